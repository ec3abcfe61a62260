use clap::{Parser, ValueEnum};
use ostinato_engine::client::Client;
use ostinato_engine::exporter::{
    BitDepth, ExportFormat, ExportMode, ExportSettings, ExportTimeRange,
};
use ostinato_engine::message::{Action, Message};
use ostinato_engine::midi::MidiNote;
use ostinato_engine::transport::{TICKS_PER_QUARTER_NOTE, Transport};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Renders a session description to an audio or MIDI file, entirely
/// offline.
#[derive(Parser, Debug)]
#[command(name = "ostinato", version, about)]
struct Args {
    /// Session description (JSON)
    session: PathBuf,
    /// Output file
    output: PathBuf,
    #[arg(long, value_enum, default_value_t = FormatArg::Wav)]
    format: FormatArg,
    #[arg(long, value_enum, default_value_t = DepthArg::D16)]
    depth: DepthArg,
    /// First bar of the render range (inclusive)
    #[arg(long, default_value_t = 1)]
    start_bar: u32,
    /// Last bar of the render range (exclusive)
    #[arg(long, default_value_t = 5)]
    end_bar: u32,
    /// Apply TPDF dither before quantization
    #[arg(long)]
    dither: bool,
    /// Render only tracks marked `bounce` in the session description
    #[arg(long)]
    stems: bool,
    #[arg(long, default_value = "")]
    artist: String,
    #[arg(long, default_value = "")]
    title: String,
    #[arg(long, default_value = "")]
    genre: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Wav,
    Flac,
    Raw,
    Ogg,
    Midi0,
    Midi1,
}

impl From<FormatArg> for ExportFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Wav => ExportFormat::Wav,
            FormatArg::Flac => ExportFormat::Flac,
            FormatArg::Raw => ExportFormat::Raw,
            FormatArg::Ogg => ExportFormat::OggVorbis,
            FormatArg::Midi0 => ExportFormat::Midi0,
            FormatArg::Midi1 => ExportFormat::Midi1,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DepthArg {
    #[value(name = "16")]
    D16,
    #[value(name = "24")]
    D24,
    #[value(name = "32")]
    D32,
}

impl From<DepthArg> for BitDepth {
    fn from(value: DepthArg) -> Self {
        match value {
            DepthArg::D16 => BitDepth::Bit16,
            DepthArg::D24 => BitDepth::Bit24,
            DepthArg::D32 => BitDepth::Bit32,
        }
    }
}

fn default_sample_rate() -> u32 {
    44_100
}

fn default_block_length() -> usize {
    512
}

fn default_bpm() -> f32 {
    120.0
}

fn default_bars() -> u32 {
    4
}

fn default_start_bar() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct SessionDesc {
    #[serde(default = "default_sample_rate")]
    sample_rate: u32,
    #[serde(default = "default_block_length")]
    block_length: usize,
    #[serde(default = "default_bpm")]
    bpm: f32,
    tracks: Vec<TrackDesc>,
}

#[derive(Debug, Deserialize)]
struct TrackDesc {
    name: String,
    #[serde(default)]
    level_db: Option<f32>,
    #[serde(default)]
    pan: Option<f32>,
    #[serde(default)]
    bounce: bool,
    #[serde(default)]
    tones: Vec<ToneDesc>,
    #[serde(default)]
    notes: Vec<NoteDesc>,
}

#[derive(Debug, Deserialize)]
struct ToneDesc {
    freq: f32,
    amp: f32,
    #[serde(default = "default_start_bar")]
    start_bar: u32,
    #[serde(default = "default_bars")]
    bars: u32,
}

#[derive(Debug, Deserialize)]
struct NoteDesc {
    #[serde(default)]
    tick: u64,
    duration: u64,
    pitch: u8,
    velocity: u8,
}

fn bar_to_frame(transport: &Transport, bar: u32) -> usize {
    transport.position_at_bar(bar).frames.max(0) as usize
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let desc: SessionDesc = serde_json::from_str(&std::fs::read_to_string(&args.session)?)?;

    // local mirror of the engine transport, for bar arithmetic
    let mut transport = Transport::new(desc.sample_rate);
    transport.set_bpm(desc.bpm);

    let (tx, handle) = ostinato_engine::init(desc.sample_rate, desc.block_length);
    let client = Client::new(tx);
    let (resp_tx, mut resp_rx) = tokio::sync::mpsc::channel(64);
    client.subscribe(resp_tx).await;

    client.request(Action::SetBpm(desc.bpm)).await;
    for track in &desc.tracks {
        client.add_track(track.name.clone()).await;
        if let Some(level_db) = track.level_db {
            client
                .request(Action::TrackLevel(track.name.clone(), level_db))
                .await;
        }
        if let Some(pan) = track.pan {
            client
                .request(Action::TrackPan(track.name.clone(), pan))
                .await;
        }
        if track.bounce {
            client
                .request(Action::TrackMarkForBounce {
                    track_name: track.name.clone(),
                    bounce: true,
                })
                .await;
        }
        for tone in &track.tones {
            let start_frame = bar_to_frame(&transport, tone.start_bar);
            let end_frame = bar_to_frame(&transport, tone.start_bar + tone.bars);
            client
                .request(Action::AddToneClip {
                    track_name: track.name.clone(),
                    freq: tone.freq,
                    amp: tone.amp,
                    start_frame,
                    frames: end_frame - start_frame,
                })
                .await;
        }
        if !track.notes.is_empty() {
            let notes = track
                .notes
                .iter()
                .map(|n| MidiNote {
                    tick: n.tick,
                    duration: n.duration,
                    pitch: n.pitch,
                    velocity: n.velocity,
                })
                .collect();
            client
                .request(Action::AddMidiClip {
                    track_name: track.name.clone(),
                    start_tick: 0,
                    notes,
                })
                .await;
        }
    }

    let mut settings = ExportSettings::new(args.format.into(), &args.output);
    settings.depth = args.depth.into();
    settings.time_range = ExportTimeRange::Custom;
    settings.custom_start = transport.position_at_bar(args.start_bar);
    settings.custom_end = transport.position_at_bar(args.end_bar);
    settings.dither = args.dither;
    settings.mode = if args.stems {
        ExportMode::Tracks
    } else {
        ExportMode::Full
    };
    settings.artist = args.artist.clone();
    settings.title = args.title.clone();
    settings.genre = args.genre.clone();
    client.start_export(settings).await;

    let mut exit = Ok(());
    while let Some(message) = resp_rx.recv().await {
        match message {
            Message::Response(Ok(Action::ExportFinished {
                path,
                cancelled,
                clipped,
                peak_db,
            })) => {
                if cancelled {
                    println!("export cancelled");
                } else {
                    let ticks_per_bar =
                        u64::from(transport.beats_per_bar) * u64::from(TICKS_PER_QUARTER_NOTE);
                    println!(
                        "rendered bars {}..{} ({} ticks/bar) to {}",
                        args.start_bar,
                        args.end_bar,
                        ticks_per_bar,
                        path.display()
                    );
                    if clipped {
                        println!("warning: output clipped, peak {peak_db:.1} dBFS");
                    }
                }
                break;
            }
            Message::Response(Err(reason)) => {
                warn!("{reason}");
                exit = Err(reason.into());
                break;
            }
            _ => {}
        }
    }

    client.quit().await;
    handle.await?;
    exit
}
