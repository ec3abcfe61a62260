use crate::clip::{AudioClip, MidiClip};
use crate::graph::PortGraph;
use crate::midi::MidiEvent;
use crate::mutex::UnsafeMutex;
use crate::pan::{PanAlgorithm, PanLaw};
use crate::port::{PortFlow, PortHandle, PortId, PortOwner, PortType, StereoPorts};
use crate::router::CycleContext;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;

pub const MASTER_TRACK_NAME: &str = "master";

/// Per-track output gain and pan stage. The law/algorithm pair is chosen
/// per track and takes effect at the next cycle; gains are recomputed once
/// per cycle.
#[derive(Clone, Copy, Debug)]
pub struct Fader {
    pub amp: f32,
    pub pan: f32,
    pub law: PanLaw,
    pub algo: PanAlgorithm,
}

impl Default for Fader {
    fn default() -> Self {
        Self {
            amp: 1.0,
            pan: 0.5,
            law: PanLaw::ZeroDb,
            algo: PanAlgorithm::SinLaw,
        }
    }
}

/// A processing node: stereo audio path, MIDI path, fader, and the clips
/// providing material. The master track is an ordinary `Track` every other
/// track's stereo output connects to by default.
pub struct Track {
    pub name: String,
    pub stereo_in: StereoPorts,
    pub stereo_out: StereoPorts,
    pub midi_in: PortHandle,
    pub midi_out: PortHandle,
    pub fader: Fader,
    pub muted: bool,
    pub soloed: bool,
    /// Derived from mute/solo state across the tracklist.
    pub out_enabled: bool,
    /// Marked for stem bounce; see the export driver's routing modes.
    pub bounce: bool,
    pub audio_clips: Vec<AudioClip>,
    pub midi_clips: Vec<MidiClip>,
}

pub type TrackHandle = Arc<UnsafeMutex<Track>>;

impl Track {
    /// Creates the track and its six ports inside the graph arena.
    pub fn new(name: String, graph: &mut PortGraph) -> Self {
        let owner = Some(PortOwner::Track(name.clone()));
        let in_l = graph.add_port_owned(
            PortType::Audio,
            PortFlow::Input,
            format!("{name} in L"),
            owner.clone(),
        );
        let in_r = graph.add_port_owned(
            PortType::Audio,
            PortFlow::Input,
            format!("{name} in R"),
            owner.clone(),
        );
        let out_l = graph.add_port_owned(
            PortType::Audio,
            PortFlow::Output,
            format!("{name} out L"),
            owner.clone(),
        );
        let out_r = graph.add_port_owned(
            PortType::Audio,
            PortFlow::Output,
            format!("{name} out R"),
            owner.clone(),
        );
        let midi_in = graph.add_port_owned(
            PortType::Event,
            PortFlow::Input,
            format!("{name} MIDI in"),
            owner.clone(),
        );
        let midi_out = graph.add_port_owned(
            PortType::Event,
            PortFlow::Output,
            format!("{name} MIDI out"),
            owner,
        );
        Self {
            name,
            stereo_in: StereoPorts::new(in_l, in_r),
            stereo_out: StereoPorts::new(out_l, out_r),
            midi_in,
            midi_out,
            fader: Fader::default(),
            muted: false,
            soloed: false,
            out_enabled: true,
            bounce: false,
            audio_clips: vec![],
            midi_clips: vec![],
        }
    }

    pub fn port_ids(&self) -> [PortId; 6] {
        [
            self.stereo_in.l_id(),
            self.stereo_in.r_id(),
            self.stereo_out.l_id(),
            self.stereo_out.r_id(),
            self.midi_in.lock().id,
            self.midi_out.lock().id,
        ]
    }

    pub fn set_level_db(&mut self, level_db: f32) {
        self.fader.amp = 10.0_f32.powf(level_db / 20.0);
    }

    pub fn set_pan(&mut self, pan: f32) {
        self.fader.pan = pan.clamp(0.0, 1.0);
    }

    pub fn has_midi_notes(&self) -> bool {
        self.midi_clips.iter().any(|clip| !clip.notes.is_empty())
    }

    /// Runs the track for one cycle: sum input ports, produce output
    /// material, then the fader and the explicit pan stage at the output.
    pub fn process(&mut self, ctx: &CycleContext, transport: &Transport) {
        let n = ctx.nframes as usize;

        self.stereo_in.sum_from_inputs(n);
        self.midi_in.lock().sum_from_inputs(n);

        {
            let in_l = self.stereo_in.l.lock();
            let in_r = self.stereo_in.r.lock();
            let out_l = self.stereo_out.l.lock();
            let out_r = self.stereo_out.r.lock();
            out_l.buf[..n].copy_from_slice(&in_l.buf[..n]);
            out_r.buf[..n].copy_from_slice(&in_r.buf[..n]);
            for clip in &self.audio_clips {
                clip.render(ctx.g_start_frame, &mut out_l.buf[..n]);
                clip.render(ctx.g_start_frame, &mut out_r.buf[..n]);
            }
        }

        {
            let midi_in = self.midi_in.lock();
            let midi_out = self.midi_out.lock();
            midi_out.midi_events.extend_from(&midi_in.midi_events);
            let win_end = ctx.g_start_frame + n as u64;
            for clip in &self.midi_clips {
                for note in &clip.notes {
                    let on_frame = transport.frames_at_tick(clip.start_tick + note.tick);
                    if on_frame >= ctx.g_start_frame && on_frame < win_end {
                        midi_out.midi_events.push(MidiEvent::note_on(
                            (on_frame - ctx.g_start_frame) as u32,
                            note.pitch,
                            note.velocity,
                        ));
                    }
                    let off_frame =
                        transport.frames_at_tick(clip.start_tick + note.tick + note.duration);
                    if off_frame >= ctx.g_start_frame && off_frame < win_end {
                        midi_out.midi_events.push(MidiEvent::note_off(
                            (off_frame - ctx.g_start_frame) as u32,
                            note.pitch,
                        ));
                    }
                }
            }
            midi_out.midi_events.sort();
        }

        if self.out_enabled {
            self.stereo_out.apply_fader(self.fader.amp, n);
            self.stereo_out
                .apply_pan(self.fader.pan, self.fader.law, self.fader.algo, n);
        } else {
            self.stereo_out.l.lock().buf[..n].fill(0.0);
            self.stereo_out.r.lock().buf[..n].fill(0.0);
        }
    }

    /// Deterministic reset of per-cycle state, used before a bounce so the
    /// render is not polluted by prior playback.
    pub fn reset(&mut self) {
        for port in [
            &self.stereo_in.l,
            &self.stereo_in.r,
            &self.stereo_out.l,
            &self.stereo_out.r,
            &self.midi_in,
            &self.midi_out,
        ] {
            port.lock().reset();
        }
    }
}

/// All tracks of a session in insertion order, master first.
pub struct Tracklist {
    tracks: HashMap<String, TrackHandle>,
    names: Vec<String>,
}

impl Tracklist {
    pub fn new(graph: &mut PortGraph) -> Self {
        let master = Track::new(MASTER_TRACK_NAME.to_string(), graph);
        let mut tracks = HashMap::new();
        tracks.insert(
            MASTER_TRACK_NAME.to_string(),
            Arc::new(UnsafeMutex::new(master)),
        );
        Self {
            tracks,
            names: vec![MASTER_TRACK_NAME.to_string()],
        }
    }

    pub fn add(&mut self, name: &str, graph: &mut PortGraph) -> Result<TrackHandle, String> {
        if self.tracks.contains_key(name) {
            return Err(format!("Track {name} already exists"));
        }
        let handle = Arc::new(UnsafeMutex::new(Track::new(name.to_string(), graph)));
        self.tracks.insert(name.to_string(), handle.clone());
        self.names.push(name.to_string());
        Ok(handle)
    }

    pub fn remove(&mut self, name: &str, graph: &mut PortGraph) -> Option<TrackHandle> {
        if name == MASTER_TRACK_NAME {
            return None;
        }
        let handle = self.tracks.remove(name)?;
        self.names.retain(|n| n != name);
        for id in handle.lock().port_ids() {
            graph.remove_port(id);
        }
        Some(handle)
    }

    pub fn get(&self, name: &str) -> Option<TrackHandle> {
        self.tracks.get(name).cloned()
    }

    pub fn master(&self) -> TrackHandle {
        self.tracks[MASTER_TRACK_NAME].clone()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, TrackHandle)> {
        self.names
            .iter()
            .map(move |name| (name, self.tracks[name].clone()))
    }

    /// Solo wins over everything else: while any track is soloed, only
    /// soloed, unmuted tracks keep their output enabled. The master is
    /// exempt.
    pub fn apply_mute_solo_policy(&self) {
        let any_soloed = self
            .names
            .iter()
            .filter(|name| name.as_str() != MASTER_TRACK_NAME)
            .any(|name| self.tracks[name].lock().soloed);
        for name in &self.names {
            let track = self.tracks[name].lock();
            if track.name == MASTER_TRACK_NAME {
                track.out_enabled = !track.muted;
                continue;
            }
            track.out_enabled = if any_soloed {
                track.soloed && !track.muted
            } else {
                !track.muted
            };
        }
    }

    pub fn reset_all(&self) {
        for name in &self.names {
            self.tracks[name].lock().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::CycleContext;

    fn ctx(g_start_frame: u64, nframes: u32) -> CycleContext {
        CycleContext {
            g_start_frame,
            local_offset: 0,
            nframes,
        }
    }

    fn prepare(graph: &PortGraph, nframes: usize) {
        for port in graph.ports() {
            port.lock().begin_cycle(nframes);
        }
    }

    #[test]
    fn clip_material_reaches_the_output_at_unity() {
        let mut graph = PortGraph::new();
        let transport = Transport::new(48_000);
        let mut track = Track::new("one".into(), &mut graph);
        track.audio_clips.push(AudioClip::new("c".into(), 0, vec![0.25; 64]));

        prepare(&graph, 64);
        track.process(&ctx(0, 64), &transport);
        // default fader: unity gain, centred with a 0 dB pan law
        let out = track.stereo_out.l.lock().buf.clone();
        assert!((out[0] - 0.25).abs() < 1e-6);
        let out_r = track.stereo_out.r.lock().buf.clone();
        assert!((out_r[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn disabled_output_is_silent() {
        let mut graph = PortGraph::new();
        let transport = Transport::new(48_000);
        let mut track = Track::new("one".into(), &mut graph);
        track.audio_clips.push(AudioClip::new("c".into(), 0, vec![1.0; 64]));
        track.out_enabled = false;

        prepare(&graph, 64);
        track.process(&ctx(0, 64), &transport);
        assert!(track.stereo_out.l.lock().buf.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn solo_mutes_everything_else() {
        let mut graph = PortGraph::new();
        let mut tracks = Tracklist::new(&mut graph);
        tracks.add("a", &mut graph).unwrap();
        tracks.add("b", &mut graph).unwrap();
        tracks.get("a").unwrap().lock().soloed = true;
        tracks.apply_mute_solo_policy();
        assert!(tracks.get("a").unwrap().lock().out_enabled);
        assert!(!tracks.get("b").unwrap().lock().out_enabled);
        assert!(tracks.master().lock().out_enabled);
    }

    #[test]
    fn note_events_are_emitted_in_their_cycle() {
        use crate::midi::MidiNote;

        let mut graph = PortGraph::new();
        let transport = Transport::new(48_000);
        let mut track = Track::new("keys".into(), &mut graph);
        track.midi_clips.push(MidiClip::new(
            "m".into(),
            0,
            vec![MidiNote {
                tick: 0,
                duration: 960,
                pitch: 60,
                velocity: 100,
            }],
        ));

        prepare(&graph, 128);
        track.process(&ctx(0, 128), &transport);
        let events = track.midi_out.lock().midi_events.clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events.iter().next().map(|e| e.data[0]), Some(0x90));
    }
}
