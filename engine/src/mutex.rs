use std::cell::UnsafeCell;

/// Interior-mutability cell shared between the control thread and the cycle
/// driver. Exclusive access is guaranteed by the pause/resume handshake
/// (see `engine::PauseGate`), not by this type: port buffers belong to the
/// router while a cycle is running, and topology only changes while the
/// driver is parked.
#[derive(Debug)]
pub struct UnsafeMutex<T> {
    data: UnsafeCell<T>,
}

impl<T> UnsafeMutex<T> {
    pub fn new(data: T) -> Self {
        UnsafeMutex {
            data: UnsafeCell::new(data),
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn lock(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

unsafe impl<T: Send> Send for UnsafeMutex<T> {}
unsafe impl<T: Send> Sync for UnsafeMutex<T> {}
