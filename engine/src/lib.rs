pub mod backend;
pub mod client;
pub mod clip;
pub mod dither;
pub mod engine;
pub mod exporter;
pub mod graph;
pub mod kind;
pub mod message;
pub mod midi;
pub mod mutex;
pub mod pan;
pub mod port;
pub mod router;
pub mod session;
pub mod track;
pub mod transport;

use tokio::sync::mpsc::{Sender, channel};
use tokio::task::JoinHandle;

/// Spawns a session with its own engine and returns the request channel
/// plus the session task handle.
pub fn init(sample_rate: u32, block_length: usize) -> (Sender<message::Message>, JoinHandle<()>) {
    let (tx, rx) = channel::<message::Message>(32);
    let mut session = session::Session::new(rx, tx.clone(), sample_rate, block_length);
    let handle = tokio::spawn(async move {
        session.work().await;
    });
    (tx, handle)
}
