use serde::{Deserialize, Serialize};

/// Time resolution of musical positions and of exported MIDI files.
pub const TICKS_PER_QUARTER_NOTE: u32 = 960;

pub const MIN_BPM: f32 = 40.0;
pub const MAX_BPM: f32 = 360.0;
pub const DEFAULT_BPM: f32 = 120.0;
pub const DEFAULT_BEATS_PER_BAR: u32 = 4;
/// Bar the end-of-song marker sits on in a fresh session.
pub const DEFAULT_END_MARKER_BAR: u32 = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayState {
    Paused,
    Rolling,
}

/// A point on the timeline, carried both in musical ticks and in frames.
/// Frames are derived from ticks via the transport's `frames_per_tick` and
/// are kept in sync whenever the playhead moves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticks: f64,
    pub frames: i64,
}

impl Position {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_before(&self, other: &Position) -> bool {
        self.frames < other.frames
    }

    pub fn is_after_or_equal(&self, other: &Position) -> bool {
        self.frames >= other.frames
    }
}

/// Minimal transport contract needed to drive playback and export: a
/// playhead, song and loop ranges, and tick/frame conversion.
#[derive(Clone, Debug)]
pub struct Transport {
    pub playhead: Position,
    pub song_start: Position,
    pub song_end: Position,
    pub loop_start: Position,
    pub loop_end: Position,
    pub loop_enabled: bool,
    pub play_state: PlayState,
    pub bpm: f32,
    pub beats_per_bar: u32,
    pub sample_rate: u32,
    pub frames_per_tick: f64,
    pub ticks_per_frame: f64,
}

impl Transport {
    pub fn new(sample_rate: u32) -> Self {
        let mut transport = Self {
            playhead: Position::zero(),
            song_start: Position::zero(),
            song_end: Position::zero(),
            loop_start: Position::zero(),
            loop_end: Position::zero(),
            loop_enabled: true,
            play_state: PlayState::Paused,
            bpm: DEFAULT_BPM,
            beats_per_bar: DEFAULT_BEATS_PER_BAR,
            sample_rate,
            frames_per_tick: 0.0,
            ticks_per_frame: 0.0,
        };
        transport.set_bpm(DEFAULT_BPM);
        transport.song_start = transport.position_at_bar(1);
        transport.song_end = transport.position_at_bar(DEFAULT_END_MARKER_BAR);
        transport.loop_start = transport.position_at_bar(1);
        transport.loop_end = transport.position_at_bar(8);
        transport
    }

    pub fn set_bpm(&mut self, bpm: f32) {
        self.bpm = bpm.clamp(MIN_BPM, MAX_BPM);
        self.update_rates();
    }

    fn update_rates(&mut self) {
        self.frames_per_tick =
            self.sample_rate as f64 * 60.0 / (self.bpm as f64 * TICKS_PER_QUARTER_NOTE as f64);
        self.ticks_per_frame = 1.0 / self.frames_per_tick;
        // re-derive marker frames for the new tempo
        for pos in [
            &mut self.playhead,
            &mut self.song_start,
            &mut self.song_end,
            &mut self.loop_start,
            &mut self.loop_end,
        ] {
            pos.frames = (pos.ticks * self.frames_per_tick).round() as i64;
        }
    }

    /// Position of the first tick of the given one-based bar.
    pub fn position_at_bar(&self, bar: u32) -> Position {
        let ticks = (bar.saturating_sub(1) as u64
            * self.beats_per_bar as u64
            * TICKS_PER_QUARTER_NOTE as u64) as f64;
        self.position_at_tick(ticks)
    }

    pub fn position_at_tick(&self, ticks: f64) -> Position {
        Position {
            ticks,
            frames: (ticks * self.frames_per_tick).round() as i64,
        }
    }

    pub fn frames_at_tick(&self, tick: u64) -> u64 {
        (tick as f64 * self.frames_per_tick).round() as u64
    }

    pub fn set_playhead(&mut self, pos: Position) {
        self.playhead = pos;
    }

    /// Advances the playhead by the processed frame count. Only a rolling
    /// transport moves.
    pub fn add_frames(&mut self, frames: i64) {
        if self.play_state == PlayState::Rolling {
            self.playhead.frames += frames;
            self.playhead.ticks += frames as f64 * self.ticks_per_frame;
        }
    }
}
