use crate::engine::EngineHandle;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::info;

/// Contract consumed from an audio backend: something that invokes the
/// engine once per hardware period with monotonically increasing frame
/// counts. Device-specific drivers live outside the core and implement
/// this; the dummy driver below is the reference implementation.
pub trait BlockDriver: Send {
    fn sample_rate(&self) -> u32;
    fn block_length(&self) -> usize;
    /// Stops the periodic callback and detaches from the pause gate.
    fn stop(&mut self);
}

/// Clock-driven driver without hardware. Runs one cycle per period on its
/// own thread, honouring the pause handshake at cycle boundaries.
pub struct DummyDriver {
    sample_rate: u32,
    block_length: usize,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DummyDriver {
    pub fn start(engine: EngineHandle) -> Result<Self, String> {
        let (sample_rate, block_length, gate) = {
            let e = engine.lock();
            (e.sample_rate, e.block_length, e.gate.clone())
        };
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        gate.attach_driver();
        let handle = thread::Builder::new()
            .name("dummy-driver".into())
            .spawn(move || {
                let period = Duration::from_secs_f64(block_length as f64 / sample_rate as f64);
                while !thread_stop.load(Ordering::Relaxed) {
                    gate.checkpoint();
                    {
                        let engine = engine.lock();
                        // the export worker owns the cycles while bouncing
                        if !engine.exporting {
                            let nframes = engine.block_length as u32;
                            engine.run_cycle(nframes);
                        }
                    }
                    thread::sleep(period);
                }
                gate.detach_driver();
            })
            .map_err(|e| format!("Failed to spawn dummy driver: {e}"))?;
        info!("dummy driver running: {sample_rate} Hz, period {block_length}");
        Ok(Self {
            sample_rate,
            block_length,
            stop,
            handle: Some(handle),
        })
    }
}

impl BlockDriver for DummyDriver {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn block_length(&self) -> usize {
        self.block_length
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DummyDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
