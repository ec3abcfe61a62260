use crate::midi::MidiEvents;
use crate::mutex::UnsafeMutex;
use crate::pan::{PanAlgorithm, PanLaw, stereo_gains};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Upper bound on connections per side of a port. Storage is dynamically
/// sized; the bound is enforced on connect.
pub const MAX_CONNECTIONS: usize = 64;

/// Durable port identity. Ids are allocated by the graph arena and never
/// reused within a session; resolved handles are a cache derived from them.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PortId(pub u32);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortType {
    Control,
    Audio,
    Event,
    Cv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortFlow {
    Input,
    Output,
}

/// Weak back-reference to the entity that owns a port. The owner outlives
/// and exclusively destroys its ports; this is a lookup key, not an
/// ownership edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortOwner {
    Track(String),
    Plugin(u32),
}

pub type PortHandle = Arc<UnsafeMutex<Port>>;

/// Resolved incoming connection, rebuilt by the graph whenever topology
/// changes. `feedback` edges read the source's previous-cycle buffer.
#[derive(Clone)]
pub struct SrcConn {
    pub id: PortId,
    pub port: PortHandle,
    pub multiplier: f32,
    pub enabled: bool,
    pub feedback: bool,
}

/// Resolved outgoing connection.
#[derive(Clone)]
pub struct DestConn {
    pub id: PortId,
    pub port: PortHandle,
}

/// Typed, directional data conduit with a per-cycle buffer.
///
/// Type and flow are fixed at creation. The buffer grows to the requested
/// block length and is otherwise zeroed each cycle; `prev_buf` holds the
/// previous completed cycle's contents for feedback reads.
pub struct Port {
    pub id: PortId,
    pub label: String,
    pub ty: PortType,
    pub flow: PortFlow,

    pub buf: Vec<f32>,
    pub prev_buf: Vec<f32>,
    pub midi_events: MidiEvents,
    pub prev_midi_events: MidiEvents,

    /// Durable connection identities, serialized with the project.
    pub src_ids: Vec<PortId>,
    pub dest_ids: Vec<PortId>,
    /// Resolved caches, rebuilt from the connection manager.
    pub srcs: Vec<SrcConn>,
    pub dests: Vec<DestConn>,

    pub owner: Option<PortOwner>,
}

impl Port {
    pub(crate) fn new(
        id: PortId,
        ty: PortType,
        flow: PortFlow,
        label: String,
        owner: Option<PortOwner>,
    ) -> Self {
        Self {
            id,
            label,
            ty,
            flow,
            buf: vec![],
            prev_buf: vec![],
            midi_events: MidiEvents::new(),
            prev_midi_events: MidiEvents::new(),
            src_ids: vec![],
            dest_ids: vec![],
            srcs: vec![],
            dests: vec![],
            owner,
        }
    }

    /// Grow-only buffer sizing. Shrinking waits for a block-length change,
    /// not a per-cycle decision.
    pub fn ensure_size(&mut self, nframes: usize) {
        if self.buf.len() < nframes {
            self.buf.resize(nframes, 0.0);
        }
        if self.prev_buf.len() < nframes {
            self.prev_buf.resize(nframes, 0.0);
        }
    }

    /// Rotates the current buffer into `prev_buf` and clears the current
    /// one. Called once per port while the router is `Preparing`.
    pub fn begin_cycle(&mut self, nframes: usize) {
        std::mem::swap(&mut self.buf, &mut self.prev_buf);
        std::mem::swap(&mut self.midi_events, &mut self.prev_midi_events);
        self.ensure_size(nframes);
        self.clear_buffer();
    }

    pub fn clear_buffer(&mut self) {
        self.buf.fill(0.0);
        self.midi_events.clear();
    }

    /// Drops all per-cycle state, current and previous. Used when resetting
    /// the engine to a deterministic state before a bounce.
    pub fn reset(&mut self) {
        self.buf.fill(0.0);
        self.prev_buf.fill(0.0);
        self.midi_events.clear();
        self.prev_midi_events.clear();
    }

    /// Zeroes the buffer, then sums every enabled incoming connection into
    /// it. Audio, CV and control signals superpose linearly, scaled by the
    /// connection multiplier; event lists merge and re-sort by timestamp.
    /// Feedback sources contribute their previous-cycle data.
    pub fn sum_from_inputs(&mut self, nframes: usize) {
        if self.ty == PortType::Event {
            self.midi_events.clear();
            for conn in &self.srcs {
                if !conn.enabled {
                    continue;
                }
                let src = conn.port.lock();
                let events = if conn.feedback {
                    &src.prev_midi_events
                } else {
                    &src.midi_events
                };
                self.midi_events.extend_from(events);
            }
            self.midi_events.sort();
            return;
        }

        let n = nframes.min(self.buf.len());
        self.buf[..n].fill(0.0);
        for conn in &self.srcs {
            if !conn.enabled {
                continue;
            }
            let src = conn.port.lock();
            let src_buf = if conn.feedback {
                &src.prev_buf
            } else {
                &src.buf
            };
            for (out, sample) in self.buf[..n].iter_mut().zip(src_buf.iter()) {
                *out += sample * conn.multiplier;
            }
        }
    }

    /// Multiplies every sample by a linear amplitude. No clamping; clipping
    /// detection is a downstream concern.
    pub fn apply_fader(&mut self, amp: f32, nframes: usize) {
        let n = nframes.min(self.buf.len());
        for sample in &mut self.buf[..n] {
            *sample *= amp;
        }
    }

    pub fn abs_peak(&self, nframes: usize) -> f32 {
        let n = nframes.min(self.buf.len());
        self.buf[..n]
            .iter()
            .fold(0.0_f32, |acc, sample| acc.max(sample.abs()))
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("ty", &self.ty)
            .field("flow", &self.flow)
            .field("srcs", &self.src_ids)
            .field("dests", &self.dest_ids)
            .finish()
    }
}

/// L/R pair of audio ports, used wherever a stereo path is exposed.
#[derive(Clone)]
pub struct StereoPorts {
    pub l: PortHandle,
    pub r: PortHandle,
}

impl StereoPorts {
    pub fn new(l: PortHandle, r: PortHandle) -> Self {
        Self { l, r }
    }

    pub fn l_id(&self) -> PortId {
        self.l.lock().id
    }

    pub fn r_id(&self) -> PortId {
        self.r.lock().id
    }

    pub fn sum_from_inputs(&self, nframes: usize) {
        self.l.lock().sum_from_inputs(nframes);
        self.r.lock().sum_from_inputs(nframes);
    }

    pub fn apply_fader(&self, amp: f32, nframes: usize) {
        self.l.lock().apply_fader(amp, nframes);
        self.r.lock().apply_fader(amp, nframes);
    }

    /// Explicit stereo pan stage. Gains are computed once for the cycle and
    /// applied in place; summation never pans.
    pub fn apply_pan(&self, pan: f32, law: PanLaw, algo: PanAlgorithm, nframes: usize) {
        let (gain_l, gain_r) = stereo_gains(pan, law, algo);
        self.l.lock().apply_fader(gain_l, nframes);
        self.r.lock().apply_fader(gain_r, nframes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(id: u32, ty: PortType, flow: PortFlow) -> PortHandle {
        let mut p = Port::new(PortId(id), ty, flow, format!("p{id}"), None);
        p.ensure_size(8);
        Arc::new(UnsafeMutex::new(p))
    }

    fn src_conn(p: &PortHandle, multiplier: f32) -> SrcConn {
        SrcConn {
            id: p.lock().id,
            port: p.clone(),
            multiplier,
            enabled: true,
            feedback: false,
        }
    }

    #[test]
    fn summation_is_linear_and_order_independent() {
        let a = port(1, PortType::Audio, PortFlow::Output);
        let b = port(2, PortType::Audio, PortFlow::Output);
        a.lock().buf.copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0]);
        b.lock().buf.copy_from_slice(&[0.5, 0.5, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0]);

        let dest = port(3, PortType::Audio, PortFlow::Input);
        dest.lock().srcs = vec![src_conn(&a, 1.0), src_conn(&b, 1.0)];
        dest.lock().sum_from_inputs(8);
        let forward = dest.lock().buf.clone();

        dest.lock().srcs = vec![src_conn(&b, 1.0), src_conn(&a, 1.0)];
        dest.lock().sum_from_inputs(8);
        assert_eq!(forward, dest.lock().buf);
        assert_eq!(&forward[..4], &[1.5, 2.5, 3.5, 4.5]);
    }

    #[test]
    fn summation_applies_multiplier_and_skips_disabled() {
        let a = port(1, PortType::Audio, PortFlow::Output);
        a.lock().buf[0] = 2.0;
        let b = port(2, PortType::Audio, PortFlow::Output);
        b.lock().buf[0] = 100.0;

        let dest = port(3, PortType::Audio, PortFlow::Input);
        let mut disabled = src_conn(&b, 1.0);
        disabled.enabled = false;
        dest.lock().srcs = vec![src_conn(&a, 0.25), disabled];
        dest.lock().sum_from_inputs(8);
        assert_eq!(dest.lock().buf[0], 0.5);
    }

    #[test]
    fn feedback_connection_reads_previous_cycle() {
        let src = port(1, PortType::Audio, PortFlow::Output);
        src.lock().buf[0] = 7.0;
        src.lock().prev_buf[0] = 3.0;

        let dest = port(2, PortType::Audio, PortFlow::Input);
        let mut conn = src_conn(&src, 1.0);
        conn.feedback = true;
        dest.lock().srcs = vec![conn];
        dest.lock().sum_from_inputs(8);
        assert_eq!(dest.lock().buf[0], 3.0);
    }

    #[test]
    fn fader_at_zero_silences_and_unity_passes() {
        let p = port(1, PortType::Audio, PortFlow::Output);
        p.lock().buf.copy_from_slice(&[0.5; 8]);
        p.lock().apply_fader(1.0, 8);
        assert_eq!(p.lock().buf[0], 0.5);
        p.lock().apply_fader(0.0, 8);
        assert!(p.lock().buf.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn begin_cycle_rotates_buffers() {
        let p = port(1, PortType::Audio, PortFlow::Output);
        p.lock().buf[0] = 4.0;
        p.lock().begin_cycle(8);
        assert_eq!(p.lock().prev_buf[0], 4.0);
        assert_eq!(p.lock().buf[0], 0.0);
    }

    #[test]
    fn event_port_merges_from_inputs() {
        use crate::midi::MidiEvent;

        let a = port(1, PortType::Event, PortFlow::Output);
        a.lock().midi_events.push(MidiEvent::note_on(6, 60, 90));
        let b = port(2, PortType::Event, PortFlow::Output);
        b.lock().midi_events.push(MidiEvent::note_on(2, 64, 90));

        let dest = port(3, PortType::Event, PortFlow::Input);
        dest.lock().srcs = vec![src_conn(&a, 1.0), src_conn(&b, 1.0)];
        dest.lock().sum_from_inputs(8);
        let frames: Vec<u32> = dest.lock().midi_events.iter().map(|e| e.frame).collect();
        assert_eq!(frames, vec![2, 6]);
    }
}
