use crate::dither::Ditherer;
use crate::engine::{AudioEngine, BounceMode, EngineHandle, EngineState};
use crate::graph::PortConnection;
use crate::track::MASTER_TRACK_NAME;
use crate::transport::{PlayState, Position, TICKS_PER_QUARTER_NOTE, Transport};
use byteorder::{LittleEndian, WriteBytesExt};
use i24::i24;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tracing::{info, warn};

pub const EXPORT_CHANNELS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFormat {
    Wav,
    Flac,
    Raw,
    OggVorbis,
    Midi0,
    Midi1,
}

impl ExportFormat {
    pub fn pretty(&self) -> &'static str {
        match self {
            ExportFormat::Wav => "WAV",
            ExportFormat::Flac => "FLAC",
            ExportFormat::Raw => "RAW",
            ExportFormat::OggVorbis => "OGG (Vorbis)",
            ExportFormat::Midi0 => "MIDI Type 0",
            ExportFormat::Midi1 => "MIDI Type 1",
        }
    }

    pub fn ext(&self) -> &'static str {
        match self {
            ExportFormat::Wav => "wav",
            ExportFormat::Flac => "flac",
            ExportFormat::Raw => "raw",
            ExportFormat::OggVorbis => "ogg",
            ExportFormat::Midi0 | ExportFormat::Midi1 => "mid",
        }
    }

    pub fn is_midi(&self) -> bool {
        matches!(self, ExportFormat::Midi0 | ExportFormat::Midi1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitDepth {
    Bit16,
    Bit24,
    Bit32,
}

impl BitDepth {
    pub fn bits(&self) -> u32 {
        match self {
            BitDepth::Bit16 => 16,
            BitDepth::Bit24 => 24,
            BitDepth::Bit32 => 32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportTimeRange {
    Song,
    Loop,
    Custom,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportMode {
    /// Render the whole mix as routed.
    Full,
    /// Render only tracks marked for bounce, detaching the others.
    Tracks,
    /// Render marked material over a region range; routing-wise identical
    /// to `Tracks`.
    Regions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportSettings {
    pub format: ExportFormat,
    pub depth: BitDepth,
    pub time_range: ExportTimeRange,
    pub custom_start: Position,
    pub custom_end: Position,
    pub dither: bool,
    pub mode: ExportMode,
    pub artist: String,
    pub title: String,
    pub genre: String,
    pub file_path: PathBuf,
    /// Fixed output rate for formats that mandate one. The engine does not
    /// resample; a mismatch with the engine rate is rejected up front.
    pub sample_rate_override: Option<u32>,
}

impl ExportSettings {
    pub fn new(format: ExportFormat, file_path: impl Into<PathBuf>) -> Self {
        Self {
            format,
            depth: BitDepth::Bit16,
            time_range: ExportTimeRange::Song,
            custom_start: Position::zero(),
            custom_end: Position::zero(),
            dither: false,
            mode: ExportMode::Full,
            artist: String::new(),
            title: String::new(),
            genre: String::new(),
            file_path: file_path.into(),
            sample_rate_override: None,
        }
    }

    pub fn print(&self) {
        info!(
            "~~~ Export Settings ~~~ format: {}, bit depth: {}, time range: {:?}, \
             mode: {:?}, dither: {}, artist: {}, title: {}, genre: {}, file: {}",
            self.format.pretty(),
            self.depth.bits(),
            self.time_range,
            self.mode,
            self.dither,
            self.artist,
            self.title,
            self.genre,
            self.file_path.display()
        );
    }
}

/// Shared progress/cancellation state of one export operation. Progress is
/// the fraction of musical-time ticks covered; cancellation is cooperative
/// and only honoured at cycle boundaries.
#[derive(Debug, Default)]
pub struct ExportProgress {
    progress: AtomicU64,
    cancelled: AtomicBool,
}

impl ExportProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, value: f64) {
        self.progress
            .store(value.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug)]
pub struct ExportReport {
    pub path: PathBuf,
    pub frames_written: u64,
    pub clipped: bool,
    /// Peak level of the rendered material in dBFS, floored at -90 dB.
    pub peak_db: f32,
}

/// Cancellation is a terminal outcome of its own, not an error: partial
/// output is deleted and the result says so.
#[derive(Clone, Debug)]
pub enum ExportOutcome {
    Completed(ExportReport),
    Cancelled,
}

#[derive(Clone, Debug, Error)]
pub enum ExportError {
    #[error("Invalid time range")]
    InvalidTimeRange,
    #[error("Format {0} not supported yet")]
    UnsupportedFormat(&'static str),
    #[error("Couldn't open {}: {reason}", .path.display())]
    FileOpenFailure { path: PathBuf, reason: String },
    #[error("Invalid format configuration: {0}")]
    FormatMismatch(String),
    #[error("Failed writing output: {0}")]
    WriteShortfall(String),
}

/// Renders an audio or MIDI file from the given settings, driving the
/// engine cycle-by-cycle offline. Runs on the caller's thread; the session
/// dispatches it onto a blocking worker.
pub fn export(
    engine: &EngineHandle,
    settings: &ExportSettings,
    progress: &Arc<ExportProgress>,
) -> Result<ExportOutcome, ExportError> {
    info!("exporting to {}", settings.file_path.display());
    settings.print();

    if settings.time_range == ExportTimeRange::Custom {
        let origin = Position::zero();
        if !settings.custom_start.is_before(&settings.custom_end)
            || !settings.custom_start.is_after_or_equal(&origin)
        {
            warn!("invalid time range");
            return Err(ExportError::InvalidTimeRange);
        }
    }
    if let Some(rate) = settings.sample_rate_override
        && rate != engine.lock().sample_rate
    {
        return Err(ExportError::UnsupportedFormat("sample-rate conversion"));
    }

    let result = match settings.format {
        ExportFormat::Midi0 | ExportFormat::Midi1 => export_midi(engine, settings, progress),
        ExportFormat::OggVorbis => {
            Err(ExportError::UnsupportedFormat(settings.format.pretty()))
        }
        _ => export_audio(engine, settings, progress),
    };

    match &result {
        Ok(ExportOutcome::Completed(report)) => {
            info!(
                "successfully exported to {} ({} frames)",
                report.path.display(),
                report.frames_written
            );
        }
        Ok(ExportOutcome::Cancelled) => {
            info!("cancelled export to {}", settings.file_path.display());
        }
        Err(err) => warn!("export failed: {err}"),
    }
    result
}

fn resolve_range(transport: &Transport, settings: &ExportSettings) -> (Position, Position) {
    match settings.time_range {
        ExportTimeRange::Song => (transport.song_start, transport.song_end),
        ExportTimeRange::Loop => (transport.loop_start, transport.loop_end),
        ExportTimeRange::Custom => (settings.custom_start, settings.custom_end),
    }
}

/// Pauses the engine, resets node state for a reproducible render, and for
/// stem bounces detaches the outputs of tracks not marked for bounce.
/// Returns the detached edges for later restoration.
fn prepare_for_export(
    engine: &mut AudioEngine,
    settings: &ExportSettings,
    start: Position,
) -> Vec<PortConnection> {
    engine.exporting = true;
    engine.bounce_mode = if settings.mode == ExportMode::Full {
        BounceMode::Off
    } else {
        BounceMode::On
    };

    engine.tracklist.apply_mute_solo_policy();
    engine.tracklist.reset_all();

    let mut detached = vec![];
    if settings.mode != ExportMode::Full {
        let silenced: Vec<_> = engine
            .tracklist
            .iter()
            .filter(|(name, track)| {
                name.as_str() != MASTER_TRACK_NAME && !track.lock().bounce
            })
            .map(|(_, track)| {
                let t = track.lock();
                [t.stereo_out.l_id(), t.stereo_out.r_id()]
            })
            .collect();
        for [l, r] in silenced {
            for src in [l, r] {
                let edges: Vec<PortConnection> = engine
                    .graph
                    .connections
                    .iter()
                    .filter(|conn| conn.src == src)
                    .cloned()
                    .collect();
                for conn in edges {
                    engine.graph.disconnect(conn.src, conn.dest);
                    detached.push(conn);
                }
            }
        }
    }
    engine.recalc_graph();

    engine.transport.play_state = PlayState::Rolling;
    engine.transport.set_playhead(start);
    detached
}

/// Restores routing and engine state after an export, successful or not.
fn post_export(engine: &mut AudioEngine, detached: &[PortConnection], state: &EngineState) {
    for conn in detached {
        if let Err(err) = engine.graph.restore_connection(conn) {
            warn!("could not restore connection {} -> {}: {err}", conn.src, conn.dest);
        }
    }
    engine.recalc_graph();
    engine.bounce_mode = BounceMode::Off;
    engine.restore_state(state);
    engine.exporting = false;
}

fn export_audio(
    engine: &EngineHandle,
    settings: &ExportSettings,
    progress: &Arc<ExportProgress>,
) -> Result<ExportOutcome, ExportError> {
    let gate = engine.lock().gate.clone();
    let _pause = gate.pause();
    let e = engine.lock();

    let (start, stop) = resolve_range(&e.transport, settings);
    if stop.frames <= start.frames {
        return Err(ExportError::InvalidTimeRange);
    }

    let state = e.capture_state();
    let detached = prepare_for_export(e, settings, start);

    let mut ditherer = settings
        .dither
        .then(|| Ditherer::new(settings.depth.bits()));
    let total_ticks = stop.ticks - start.ticks;
    let total_frames = (stop.frames - start.frames) as u64;
    let mut rendered: Vec<f32> =
        Vec::with_capacity(total_frames as usize * EXPORT_CHANNELS);
    let mut block = vec![0.0_f32; e.block_length * EXPORT_CHANNELS];
    let mut peak_amp = 0.0_f32;
    let mut covered_frames: u64 = 0;

    loop {
        let remaining = (stop.frames - e.transport.playhead.frames).max(0) as usize;
        let nframes = remaining.min(e.block_length);
        if nframes == 0 {
            break;
        }

        e.run_cycle(nframes as u32);

        // the master channel's stereo out now holds the summed cycle
        {
            let master = e.tracklist.master();
            let m = master.lock();
            let l = m.stereo_out.l.lock();
            let r = m.stereo_out.r.lock();
            for i in 0..nframes {
                block[i * 2] = l.buf[i];
                block[i * 2 + 1] = r.buf[i];
            }
            peak_amp = peak_amp.max(l.abs_peak(nframes)).max(r.abs_peak(nframes));
        }

        if let Some(ditherer) = ditherer.as_mut() {
            ditherer.process(&mut block[..nframes * EXPORT_CHANNELS]);
        }
        rendered.extend_from_slice(&block[..nframes * EXPORT_CHANNELS]);
        covered_frames += nframes as u64;

        progress.set((e.transport.playhead.ticks - start.ticks) / total_ticks);

        if e.transport.playhead.frames >= stop.frames {
            break;
        }
        if progress.is_cancelled() {
            break;
        }
    }

    let cancelled = progress.is_cancelled() && covered_frames < total_frames;
    post_export(e, &detached, &state);

    if cancelled {
        let _ = fs::remove_file(&settings.file_path);
        return Ok(ExportOutcome::Cancelled);
    }

    if let Err(err) = write_audio_file(settings, &rendered, e.sample_rate) {
        let _ = fs::remove_file(&settings.file_path);
        return Err(err);
    }

    progress.set(1.0);
    let clipped = peak_amp >= 1.0;
    if clipped {
        warn!(
            "the exported audio contains segments louder than 0 dB (max detected {:.1} dB)",
            amp_to_dbfs(peak_amp)
        );
    }
    Ok(ExportOutcome::Completed(ExportReport {
        path: settings.file_path.clone(),
        frames_written: covered_frames,
        clipped,
        peak_db: amp_to_dbfs(peak_amp),
    }))
}

fn amp_to_dbfs(amp: f32) -> f32 {
    if amp <= 1.0e-6 {
        -90.0
    } else {
        (20.0 * amp.log10()).clamp(-90.0, 20.0)
    }
}

fn quantize_i16(sample: f32) -> i16 {
    (f64::from(sample.clamp(-1.0, 1.0)) * 32_767.0).round() as i16
}

fn quantize_i24(sample: f32) -> i32 {
    (f64::from(sample.clamp(-1.0, 1.0)) * 8_388_607.0).round() as i32
}

fn quantize_i32(sample: f32) -> i32 {
    (f64::from(sample.clamp(-1.0, 1.0)) * 2_147_483_647.0).round() as i32
}

fn write_audio_file(
    settings: &ExportSettings,
    samples: &[f32],
    sample_rate: u32,
) -> Result<(), ExportError> {
    if let Some(dir) = settings.file_path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir).map_err(|e| ExportError::FileOpenFailure {
            path: settings.file_path.clone(),
            reason: e.to_string(),
        })?;
    }
    match settings.format {
        ExportFormat::Wav => write_wav(settings, samples, sample_rate),
        ExportFormat::Flac => write_flac(settings, samples, sample_rate),
        ExportFormat::Raw => write_raw(settings, samples),
        _ => Err(ExportError::UnsupportedFormat(settings.format.pretty())),
    }
}

fn write_wav(
    settings: &ExportSettings,
    samples: &[f32],
    sample_rate: u32,
) -> Result<(), ExportError> {
    let path = &settings.file_path;
    let rate = sample_rate as i32;
    let channels = EXPORT_CHANNELS as u16;
    let result = match settings.depth {
        BitDepth::Bit16 => {
            let pcm: Vec<i16> = samples.iter().map(|s| quantize_i16(*s)).collect();
            wavers::write(path, &pcm, rate, channels)
        }
        BitDepth::Bit24 => {
            let pcm: Vec<i24> = samples
                .iter()
                .map(|s| i24::from_i32(quantize_i24(*s)))
                .collect();
            wavers::write(path, &pcm, rate, channels)
        }
        BitDepth::Bit32 => {
            let pcm: Vec<i32> = samples.iter().map(|s| quantize_i32(*s)).collect();
            wavers::write(path, &pcm, rate, channels)
        }
    };
    result.map_err(|e| ExportError::WriteShortfall(e.to_string()))
}

fn write_flac(
    settings: &ExportSettings,
    samples: &[f32],
    sample_rate: u32,
) -> Result<(), ExportError> {
    use flacenc::component::BitRepr;
    use flacenc::error::Verify;

    if settings.depth == BitDepth::Bit32 {
        return Err(ExportError::FormatMismatch(
            "FLAC supports at most 24-bit PCM".to_string(),
        ));
    }
    let pcm: Vec<i32> = match settings.depth {
        BitDepth::Bit16 => samples.iter().map(|s| i32::from(quantize_i16(*s))).collect(),
        _ => samples.iter().map(|s| quantize_i24(*s)).collect(),
    };

    let config = flacenc::config::Encoder::default()
        .into_verified()
        .map_err(|_| {
            ExportError::FormatMismatch("FLAC encoder configuration rejected".to_string())
        })?;
    let source = flacenc::source::MemSource::from_samples(
        &pcm,
        EXPORT_CHANNELS,
        settings.depth.bits() as usize,
        sample_rate as usize,
    );
    let stream = flacenc::encode_with_fixed_block_size(&config, source, config.block_size)
        .map_err(|_| ExportError::FormatMismatch("FLAC encoding failed".to_string()))?;
    let mut sink = flacenc::bitsink::ByteSink::new();
    stream
        .write(&mut sink)
        .map_err(|_| ExportError::WriteShortfall("FLAC bitstream write failed".to_string()))?;
    fs::write(&settings.file_path, sink.as_slice())
        .map_err(|e| ExportError::WriteShortfall(e.to_string()))
}

/// Headerless interleaved little-endian PCM.
fn write_raw(settings: &ExportSettings, samples: &[f32]) -> Result<(), ExportError> {
    let file = File::create(&settings.file_path).map_err(|e| ExportError::FileOpenFailure {
        path: settings.file_path.clone(),
        reason: e.to_string(),
    })?;
    let mut writer = BufWriter::new(file);
    let result: std::io::Result<()> = samples.iter().try_for_each(|s| match settings.depth {
        BitDepth::Bit16 => writer.write_i16::<LittleEndian>(quantize_i16(*s)),
        BitDepth::Bit24 => writer.write_i24::<LittleEndian>(quantize_i24(*s)),
        BitDepth::Bit32 => writer.write_i32::<LittleEndian>(quantize_i32(*s)),
    });
    result
        .and_then(|_| writer.flush())
        .map_err(|e| ExportError::WriteShortfall(e.to_string()))
}

/// Writes note material to a standard MIDI file. No router cycles are
/// involved: each track with note content is walked once. Format 0 merges
/// everything into a single track, format 1 keeps one MIDI track per
/// source track.
fn export_midi(
    engine: &EngineHandle,
    settings: &ExportSettings,
    progress: &Arc<ExportProgress>,
) -> Result<ExportOutcome, ExportError> {
    use midly::num::{u4, u7, u15, u24, u28};
    use midly::{
        Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind,
    };

    let gate = engine.lock().gate.clone();
    let _pause = gate.pause();
    let e = engine.lock();

    struct TrackNotes {
        name: String,
        // (absolute tick, note on?, pitch, velocity)
        events: Vec<(u64, bool, u8, u8)>,
    }

    let mut sources: Vec<TrackNotes> = vec![];
    let track_count = e.tracklist.len();
    for (i, (name, track)) in e.tracklist.iter().enumerate() {
        progress.set(i as f64 / track_count.max(1) as f64);
        if progress.is_cancelled() {
            return Ok(ExportOutcome::Cancelled);
        }
        let t = track.lock();
        if !t.has_midi_notes() {
            continue;
        }
        let mut events = vec![];
        for clip in &t.midi_clips {
            for note in &clip.notes {
                let on = clip.start_tick + note.tick;
                events.push((on, true, note.pitch, note.velocity));
                events.push((on + note.duration, false, note.pitch, 0));
            }
        }
        events.sort_by_key(|(tick, _, _, _)| *tick);
        sources.push(TrackNotes {
            name: name.clone(),
            events,
        });
    }

    let tempo = u24::new((60_000_000.0 / f64::from(e.transport.bpm)) as u32);
    let time_sig = MetaMessage::TimeSignature(e.transport.beats_per_bar as u8, 2, 24, 8);

    fn to_track_events(events: &[(u64, bool, u8, u8)]) -> Vec<TrackEvent<'static>> {
        let mut out = vec![];
        let mut prev_tick = 0_u64;
        for (tick, on, pitch, velocity) in events {
            // clamp to the 28-bit delta a track event can carry
            let delta = u28::new(tick.saturating_sub(prev_tick).min(0x0FFF_FFFF) as u32);
            prev_tick = *tick;
            let message = if *on {
                MidiMessage::NoteOn {
                    key: u7::new(*pitch),
                    vel: u7::new(*velocity),
                }
            } else {
                MidiMessage::NoteOff {
                    key: u7::new(*pitch),
                    vel: u7::new(0),
                }
            };
            out.push(TrackEvent {
                delta,
                kind: TrackEventKind::Midi {
                    channel: u4::new(0),
                    message,
                },
            });
        }
        out
    }

    let format = if settings.format == ExportFormat::Midi0 {
        Format::SingleTrack
    } else {
        Format::Parallel
    };
    let mut tracks: Vec<Vec<TrackEvent<'_>>> = vec![];
    if settings.format == ExportFormat::Midi0 {
        let mut merged: Vec<(u64, bool, u8, u8)> = vec![];
        for source in &sources {
            merged.extend(source.events.iter().copied());
        }
        merged.sort_by_key(|(tick, _, _, _)| *tick);

        let mut events = vec![
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::Tempo(tempo)),
            },
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(time_sig),
            },
        ];
        if !settings.title.is_empty() {
            events.push(TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::TrackName(settings.title.as_bytes())),
            });
        }
        events.extend(to_track_events(&merged));
        events.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });
        tracks.push(events);
    } else {
        tracks.push(vec![
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::Tempo(tempo)),
            },
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(time_sig),
            },
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
            },
        ]);
        for source in &sources {
            let mut events = vec![TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::TrackName(source.name.as_bytes())),
            }];
            events.extend(to_track_events(&source.events));
            events.push(TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
            });
            tracks.push(events);
        }
    }

    if progress.is_cancelled() {
        return Ok(ExportOutcome::Cancelled);
    }

    let smf = Smf {
        header: Header::new(
            format,
            Timing::Metrical(u15::new(TICKS_PER_QUARTER_NOTE as u16)),
        ),
        tracks,
    };
    if let Some(dir) = settings.file_path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir).map_err(|e| ExportError::FileOpenFailure {
            path: settings.file_path.clone(),
            reason: e.to_string(),
        })?;
    }
    let mut file = File::create(&settings.file_path).map_err(|e| ExportError::FileOpenFailure {
        path: settings.file_path.clone(),
        reason: e.to_string(),
    })?;
    if let Err(err) = smf.write_std(&mut file) {
        drop(file);
        let _ = fs::remove_file(&settings.file_path);
        return Err(ExportError::WriteShortfall(err.to_string()));
    }

    progress.set(1.0);
    Ok(ExportOutcome::Completed(ExportReport {
        path: settings.file_path.clone(),
        frames_written: 0,
        clipped: false,
        peak_db: -90.0,
    }))
}
