use crate::exporter::{ExportError, ExportOutcome, ExportSettings};
use crate::kind::Kind;
use crate::midi::MidiNote;
use std::path::PathBuf;
use tokio::sync::mpsc::Sender;

#[derive(Clone, Debug)]
pub enum Action {
    Quit,
    Play,
    Stop,
    SetBpm(f32),
    AddTrack {
        name: String,
    },
    RemoveTrack(String),
    /// Fader level in dB.
    TrackLevel(String, f32),
    /// Pan position in [0, 1].
    TrackPan(String, f32),
    TrackToggleMute(String),
    TrackToggleSolo(String),
    TrackMarkForBounce {
        track_name: String,
        bounce: bool,
    },
    Connect {
        from_track: String,
        to_track: String,
        kind: Kind,
    },
    Disconnect {
        from_track: String,
        to_track: String,
        kind: Kind,
    },
    AddToneClip {
        track_name: String,
        freq: f32,
        amp: f32,
        start_frame: usize,
        frames: usize,
    },
    AddMidiClip {
        track_name: String,
        start_tick: u64,
        notes: Vec<MidiNote>,
    },
    StartExport(Box<ExportSettings>),
    CancelExport,
    /// Response-only: terminal state of an export operation.
    ExportFinished {
        path: PathBuf,
        cancelled: bool,
        clipped: bool,
        peak_db: f32,
    },
}

#[derive(Clone, Debug)]
pub enum Message {
    Channel(Sender<Self>),
    Request(Action),
    Response(Result<Action, String>),
    ExportDone(Box<Result<ExportOutcome, ExportError>>),
}
