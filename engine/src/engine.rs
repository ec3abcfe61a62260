use crate::graph::PortGraph;
use crate::kind::Kind;
use crate::mutex::UnsafeMutex;
use crate::router::{CycleContext, Router};
use crate::track::{MASTER_TRACK_NAME, TrackHandle, Tracklist};
use crate::transport::{PlayState, Position, Transport};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::info;

/// Whether the engine is rendering a stem bounce instead of the full mix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BounceMode {
    Off,
    On,
}

/// Engine state captured before an export so it can be restored afterwards.
#[derive(Clone, Copy, Debug)]
pub struct EngineState {
    pub play_state: PlayState,
    pub playhead: Position,
}

#[derive(Default)]
struct GateState {
    pause_requests: usize,
    parked: bool,
    driver_attached: bool,
}

/// Pause/resume handshake between the cycle driver and everyone who needs
/// the graph quiescent (topology mutation, export preparation).
///
/// The driver calls `checkpoint` between cycles and parks there while any
/// pause request is outstanding. A mutator takes a `PauseGuard`, which
/// blocks until the driver is parked (or no driver is attached) and
/// releases the driver when dropped. Port buffers are never touched by two
/// sides at once: they belong to the router from `Preparing` to `Settled`.
pub struct PauseGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
        }
    }

    fn guard(&self) -> MutexGuard<'_, GateState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, GateState>) -> MutexGuard<'a, GateState> {
        match self.cond.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn attach_driver(&self) {
        self.guard().driver_attached = true;
        self.cond.notify_all();
    }

    pub fn detach_driver(&self) {
        let mut state = self.guard();
        state.driver_attached = false;
        state.parked = false;
        self.cond.notify_all();
    }

    /// Driver-side safe boundary between cycles. Parks while any pause
    /// request is outstanding.
    pub fn checkpoint(&self) {
        let mut state = self.guard();
        while state.pause_requests > 0 {
            state.parked = true;
            self.cond.notify_all();
            state = self.wait(state);
        }
        state.parked = false;
    }

    /// Blocks until the driver has parked, then holds it there until the
    /// returned guard is dropped.
    pub fn pause(self: &Arc<Self>) -> PauseGuard {
        let mut state = self.guard();
        state.pause_requests += 1;
        self.cond.notify_all();
        while state.driver_attached && !state.parked {
            state = self.wait(state);
        }
        drop(state);
        PauseGuard { gate: self.clone() }
    }

    pub fn is_parked(&self) -> bool {
        self.guard().parked
    }
}

/// Releases the paused driver on drop.
pub struct PauseGuard {
    gate: Arc<PauseGate>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        let mut state = self.gate.guard();
        state.pause_requests = state.pause_requests.saturating_sub(1);
        self.gate.cond.notify_all();
    }
}

/// The one audio engine of a session: port graph, tracklist, transport and
/// router, explicitly constructed and owned by the session object. There
/// are no process-wide singletons; "exactly one active engine" follows
/// from the session's lifetime.
pub struct AudioEngine {
    pub sample_rate: u32,
    pub block_length: usize,
    pub graph: PortGraph,
    pub tracklist: Tracklist,
    pub transport: Transport,
    pub router: Router,
    pub gate: Arc<PauseGate>,
    pub exporting: bool,
    pub bounce_mode: BounceMode,
}

pub type EngineHandle = Arc<UnsafeMutex<AudioEngine>>;

impl AudioEngine {
    pub fn new(sample_rate: u32, block_length: usize) -> Self {
        let mut graph = PortGraph::new();
        let tracklist = Tracklist::new(&mut graph);
        let mut engine = Self {
            sample_rate,
            block_length,
            graph,
            tracklist,
            transport: Transport::new(sample_rate),
            router: Router::new(),
            gate: Arc::new(PauseGate::new()),
            exporting: false,
            bounce_mode: BounceMode::Off,
        };
        engine.recalc_graph();
        info!(
            "engine ready: {} Hz, block length {}",
            sample_rate, block_length
        );
        engine
    }

    pub fn into_handle(self) -> EngineHandle {
        Arc::new(UnsafeMutex::new(self))
    }

    pub fn recalc_graph(&mut self) {
        self.router.recalc_order(&mut self.graph, &self.tracklist);
    }

    /// Creates a track and routes its stereo output to the master mix.
    pub fn add_track(&mut self, name: &str) -> Result<TrackHandle, String> {
        let handle = self.tracklist.add(name, &mut self.graph)?;
        self.connect_tracks(name, MASTER_TRACK_NAME, Kind::Audio)?;
        Ok(handle)
    }

    pub fn remove_track(&mut self, name: &str) -> Result<(), String> {
        match self.tracklist.remove(name, &mut self.graph) {
            Some(_) => {
                self.recalc_graph();
                Ok(())
            }
            None => Err(format!("Track not found: {name}")),
        }
    }

    pub fn connect_tracks(&mut self, from: &str, to: &str, kind: Kind) -> Result<(), String> {
        let from_track = self
            .tracklist
            .get(from)
            .ok_or_else(|| format!("Track not found: {from}"))?;
        let to_track = self
            .tracklist
            .get(to)
            .ok_or_else(|| format!("Track not found: {to}"))?;
        match kind {
            Kind::Audio => {
                let (src_l, src_r) = {
                    let t = from_track.lock();
                    (t.stereo_out.l_id(), t.stereo_out.r_id())
                };
                let (dest_l, dest_r) = {
                    let t = to_track.lock();
                    (t.stereo_in.l_id(), t.stereo_in.r_id())
                };
                self.graph.connect(src_l, dest_l).map_err(|e| e.to_string())?;
                self.graph.connect(src_r, dest_r).map_err(|e| e.to_string())?;
            }
            Kind::MIDI => {
                let src = from_track.lock().midi_out.lock().id;
                let dest = to_track.lock().midi_in.lock().id;
                self.graph.connect(src, dest).map_err(|e| e.to_string())?;
            }
        }
        self.recalc_graph();
        Ok(())
    }

    pub fn disconnect_tracks(&mut self, from: &str, to: &str, kind: Kind) -> Result<(), String> {
        let from_track = self
            .tracklist
            .get(from)
            .ok_or_else(|| format!("Track not found: {from}"))?;
        let to_track = self
            .tracklist
            .get(to)
            .ok_or_else(|| format!("Track not found: {to}"))?;
        match kind {
            Kind::Audio => {
                let (src_l, src_r) = {
                    let t = from_track.lock();
                    (t.stereo_out.l_id(), t.stereo_out.r_id())
                };
                let (dest_l, dest_r) = {
                    let t = to_track.lock();
                    (t.stereo_in.l_id(), t.stereo_in.r_id())
                };
                self.graph.disconnect(src_l, dest_l);
                self.graph.disconnect(src_r, dest_r);
            }
            Kind::MIDI => {
                let src = from_track.lock().midi_out.lock().id;
                let dest = to_track.lock().midi_in.lock().id;
                self.graph.disconnect(src, dest);
            }
        }
        self.recalc_graph();
        Ok(())
    }

    /// Runs one cycle at the playhead and advances it by the processed
    /// frame count (while rolling).
    pub fn run_cycle(&mut self, nframes: u32) {
        let ctx = CycleContext {
            g_start_frame: self.transport.playhead.frames.max(0) as u64,
            local_offset: 0,
            nframes,
        };
        self.router
            .start_cycle(ctx, &self.graph, &self.tracklist, &self.transport);
        self.transport.add_frames(nframes as i64);
    }

    pub fn capture_state(&self) -> EngineState {
        EngineState {
            play_state: self.transport.play_state,
            playhead: self.transport.playhead,
        }
    }

    pub fn restore_state(&mut self, state: &EngineState) {
        self.transport.play_state = state.play_state;
        self.transport.set_playhead(state.playhead);
    }
}
