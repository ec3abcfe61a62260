use ostinato_engine::clip::{AudioClip, MidiClip};
use ostinato_engine::engine::{AudioEngine, EngineHandle};
use ostinato_engine::exporter::{
    self, BitDepth, ExportError, ExportFormat, ExportMode, ExportOutcome, ExportProgress,
    ExportSettings, ExportTimeRange,
};
use ostinato_engine::kind::Kind;
use ostinato_engine::message::{Action, Message};
use ostinato_engine::midi::MidiNote;
use ostinato_engine::track::MASTER_TRACK_NAME;
use std::path::Path;
use tempfile::tempdir;

const FOUR_BARS_44K: u64 = 352_800;

fn engine_44k() -> EngineHandle {
    AudioEngine::new(44_100, 256).into_handle()
}

fn custom_settings(
    engine: &EngineHandle,
    format: ExportFormat,
    depth: BitDepth,
    path: &Path,
    start_bar: u32,
    end_bar: u32,
) -> ExportSettings {
    let e = engine.lock();
    let mut settings = ExportSettings::new(format, path);
    settings.depth = depth;
    settings.time_range = ExportTimeRange::Custom;
    settings.custom_start = e.transport.position_at_bar(start_bar);
    settings.custom_end = e.transport.position_at_bar(end_bar);
    settings
}

#[test]
fn silent_export_covers_the_exact_frame_count() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("silent.wav");
    let engine = engine_44k();
    engine.lock().add_track("one").unwrap();

    let settings = custom_settings(&engine, ExportFormat::Wav, BitDepth::Bit16, &path, 1, 5);
    let progress = ExportProgress::new();
    let outcome = exporter::export(&engine, &settings, &progress).unwrap();

    let ExportOutcome::Completed(report) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(report.frames_written, FOUR_BARS_44K);
    assert!(!report.clipped);
    assert_eq!(progress.get(), 1.0);

    let mut wav: wavers::Wav<i16> = wavers::Wav::from_path(&path).unwrap();
    assert_eq!(wav.n_channels(), 2);
    let samples = wav.read().unwrap();
    assert_eq!(samples.as_ref().len() as u64, FOUR_BARS_44K * 2);
    assert!(samples.as_ref().iter().all(|s| *s == 0));
}

#[test]
fn full_scale_material_sets_the_clipping_flag() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hot.wav");
    let engine = engine_44k();
    engine.lock().add_track("one").unwrap();
    engine
        .lock()
        .tracklist
        .get("one")
        .unwrap()
        .lock()
        .audio_clips
        .push(AudioClip::new(
            "dc".into(),
            0,
            vec![1.0; FOUR_BARS_44K as usize],
        ));

    let settings = custom_settings(&engine, ExportFormat::Wav, BitDepth::Bit16, &path, 1, 5);
    let progress = ExportProgress::new();
    let ExportOutcome::Completed(report) =
        exporter::export(&engine, &settings, &progress).unwrap()
    else {
        panic!("expected completion");
    };
    assert!(report.clipped);
    assert!(report.peak_db.abs() < 0.1, "peak {} dB", report.peak_db);
}

#[test]
fn half_scale_material_does_not_clip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ok.wav");
    let engine = engine_44k();
    engine.lock().add_track("one").unwrap();
    engine
        .lock()
        .tracklist
        .get("one")
        .unwrap()
        .lock()
        .audio_clips
        .push(AudioClip::new(
            "dc".into(),
            0,
            vec![0.5; FOUR_BARS_44K as usize],
        ));

    let settings = custom_settings(&engine, ExportFormat::Wav, BitDepth::Bit16, &path, 1, 5);
    let progress = ExportProgress::new();
    let ExportOutcome::Completed(report) =
        exporter::export(&engine, &settings, &progress).unwrap()
    else {
        panic!("expected completion");
    };
    assert!(!report.clipped);

    let mut wav: wavers::Wav<i16> = wavers::Wav::from_path(&path).unwrap();
    let samples = wav.read().unwrap();
    let peak = samples.as_ref().iter().map(|s| s.unsigned_abs()).max().unwrap();
    assert!((16_000..17_000).contains(&peak), "peak {peak}");
}

#[test]
fn cancelled_export_deletes_the_file_and_reports_cancelled() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cancelled.wav");
    let engine = engine_44k();
    engine.lock().add_track("one").unwrap();

    let settings = custom_settings(&engine, ExportFormat::Wav, BitDepth::Bit16, &path, 1, 33);
    let progress = ExportProgress::new();
    progress.cancel();
    let outcome = exporter::export(&engine, &settings, &progress).unwrap();
    assert!(matches!(outcome, ExportOutcome::Cancelled));
    assert!(!path.exists());
}

#[test]
fn invalid_custom_range_fails_before_any_io() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("never.wav");
    let engine = engine_44k();
    let mut settings = custom_settings(&engine, ExportFormat::Wav, BitDepth::Bit16, &path, 5, 5);
    settings.custom_end = settings.custom_start;

    let progress = ExportProgress::new();
    let err = exporter::export(&engine, &settings, &progress).unwrap_err();
    assert!(matches!(err, ExportError::InvalidTimeRange));
    assert!(!path.exists());
}

#[test]
fn flac_export_writes_a_flac_stream() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mix.flac");
    let engine = engine_44k();
    engine.lock().add_track("one").unwrap();
    engine
        .lock()
        .tracklist
        .get("one")
        .unwrap()
        .lock()
        .audio_clips
        .push(AudioClip::tone(
            "tone".into(),
            0,
            FOUR_BARS_44K as usize,
            440.0,
            0.5,
            44_100,
        ));

    let settings = custom_settings(&engine, ExportFormat::Flac, BitDepth::Bit16, &path, 1, 5);
    let progress = ExportProgress::new();
    let outcome = exporter::export(&engine, &settings, &progress).unwrap();
    assert!(matches!(outcome, ExportOutcome::Completed(_)));
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..4], b"fLaC");
}

#[test]
fn flac_rejects_32_bit_depth() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.flac");
    let engine = engine_44k();
    let settings = custom_settings(&engine, ExportFormat::Flac, BitDepth::Bit32, &path, 1, 2);
    let progress = ExportProgress::new();
    let err = exporter::export(&engine, &settings, &progress).unwrap_err();
    assert!(matches!(err, ExportError::FormatMismatch(_)));
    assert!(!path.exists());
}

#[test]
fn ogg_is_reported_unsupported() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("no.ogg");
    let engine = engine_44k();
    let settings = custom_settings(&engine, ExportFormat::OggVorbis, BitDepth::Bit16, &path, 1, 2);
    let progress = ExportProgress::new();
    let err = exporter::export(&engine, &settings, &progress).unwrap_err();
    assert!(matches!(err, ExportError::UnsupportedFormat(_)));
}

#[test]
fn raw_export_has_no_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mix.raw");
    let engine = engine_44k();
    engine.lock().add_track("one").unwrap();

    let settings = custom_settings(&engine, ExportFormat::Raw, BitDepth::Bit16, &path, 1, 5);
    let progress = ExportProgress::new();
    let outcome = exporter::export(&engine, &settings, &progress).unwrap();
    assert!(matches!(outcome, ExportOutcome::Completed(_)));
    let bytes = std::fs::read(&path).unwrap();
    // 2 channels x 2 bytes per sample, no container overhead
    assert_eq!(bytes.len() as u64, FOUR_BARS_44K * 4);
}

#[test]
fn export_is_deterministic_for_identical_sessions() {
    let dir = tempdir().unwrap();

    let render = |path: &Path| {
        let engine = engine_44k();
        engine.lock().add_track("one").unwrap();
        engine
            .lock()
            .tracklist
            .get("one")
            .unwrap()
            .lock()
            .audio_clips
            .push(AudioClip::tone(
                "tone".into(),
                0,
                FOUR_BARS_44K as usize,
                220.0,
                0.6,
                44_100,
            ));
        let mut settings =
            custom_settings(&engine, ExportFormat::Wav, BitDepth::Bit16, path, 1, 5);
        settings.dither = true;
        let progress = ExportProgress::new();
        exporter::export(&engine, &settings, &progress).unwrap()
    };

    let a = dir.path().join("a.wav");
    let b = dir.path().join("b.wav");
    render(&a);
    render(&b);
    assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
}

#[test]
fn stem_bounce_detaches_unmarked_tracks_and_restores_routing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stem.wav");
    let engine = engine_44k();
    engine.lock().add_track("keep").unwrap();
    engine.lock().add_track("drop").unwrap();
    for (name, bounce) in [("keep", true), ("drop", false)] {
        let track = engine.lock().tracklist.get(name).unwrap();
        let t = track.lock();
        t.bounce = bounce;
        t.audio_clips.push(AudioClip::new(
            "dc".into(),
            0,
            vec![0.5; FOUR_BARS_44K as usize],
        ));
    }

    let mut settings = custom_settings(&engine, ExportFormat::Wav, BitDepth::Bit16, &path, 1, 5);
    settings.mode = ExportMode::Tracks;
    let progress = ExportProgress::new();
    let ExportOutcome::Completed(report) =
        exporter::export(&engine, &settings, &progress).unwrap()
    else {
        panic!("expected completion");
    };
    // only the marked track sounds: 0.5, not 1.0
    assert!(!report.clipped);
    let mut wav: wavers::Wav<i16> = wavers::Wav::from_path(&path).unwrap();
    let samples = wav.read().unwrap();
    let peak = samples.as_ref().iter().map(|s| s.unsigned_abs()).max().unwrap();
    assert!((16_000..17_000).contains(&peak), "peak {peak}");

    // routing snapshot is restored after the bounce
    let e = engine.lock();
    let dropped = e.tracklist.get("drop").unwrap();
    let master = e.tracklist.master();
    let src = dropped.lock().stereo_out.l_id();
    let dest = master.lock().stereo_in.l_id();
    assert!(e.graph.are_connected(src, dest));
}

fn add_notes(engine: &EngineHandle, track: &str, base_pitch: u8) {
    let handle = engine.lock().tracklist.get(track).unwrap();
    handle.lock().midi_clips.push(MidiClip::new(
        "riff".into(),
        0,
        (0..4)
            .map(|i| MidiNote {
                tick: i * 960,
                duration: 480,
                pitch: base_pitch + i as u8,
                velocity: 100,
            })
            .collect(),
    ));
}

#[test]
fn midi_format0_merges_into_one_track_chunk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("song.mid");
    let engine = engine_44k();
    engine.lock().add_track("keys").unwrap();
    engine.lock().add_track("bass").unwrap();
    add_notes(&engine, "keys", 60);
    add_notes(&engine, "bass", 36);

    let settings = custom_settings(&engine, ExportFormat::Midi0, BitDepth::Bit16, &path, 1, 5);
    let progress = ExportProgress::new();
    let outcome = exporter::export(&engine, &settings, &progress).unwrap();
    assert!(matches!(outcome, ExportOutcome::Completed(_)));

    let bytes = std::fs::read(&path).unwrap();
    let smf = midly::Smf::parse(&bytes).unwrap();
    assert_eq!(smf.tracks.len(), 1);
    let note_ons = smf.tracks[0]
        .iter()
        .filter(|ev| {
            matches!(
                ev.kind,
                midly::TrackEventKind::Midi {
                    message: midly::MidiMessage::NoteOn { .. },
                    ..
                }
            )
        })
        .count();
    assert_eq!(note_ons, 8);
}

#[test]
fn midi_format1_preserves_per_track_chunks() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("song1.mid");
    let engine = engine_44k();
    engine.lock().add_track("keys").unwrap();
    engine.lock().add_track("bass").unwrap();
    add_notes(&engine, "keys", 60);
    add_notes(&engine, "bass", 36);

    let settings = custom_settings(&engine, ExportFormat::Midi1, BitDepth::Bit16, &path, 1, 5);
    let progress = ExportProgress::new();
    exporter::export(&engine, &settings, &progress).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let smf = midly::Smf::parse(&bytes).unwrap();
    // tempo/meta track plus one chunk per source track
    assert_eq!(smf.tracks.len(), 3);
    let has_tempo = smf.tracks[0].iter().any(|ev| {
        matches!(
            ev.kind,
            midly::TrackEventKind::Meta(midly::MetaMessage::Tempo(_))
        )
    });
    assert!(has_tempo);
}

#[tokio::test]
async fn session_runs_an_export_end_to_end() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.wav");
    let (tx, handle) = ostinato_engine::init(44_100, 256);
    let client = ostinato_engine::client::Client::new(tx);
    let (resp_tx, mut resp_rx) = tokio::sync::mpsc::channel(32);
    client.subscribe(resp_tx).await;

    client.add_track("one").await;
    client
        .request(Action::AddToneClip {
            track_name: "one".into(),
            freq: 440.0,
            amp: 0.5,
            start_frame: 0,
            frames: FOUR_BARS_44K as usize,
        })
        .await;
    client.connect("one", MASTER_TRACK_NAME, Kind::Audio).await;

    let mut settings = ExportSettings::new(ExportFormat::Wav, &path);
    settings.time_range = ExportTimeRange::Custom;
    // 4 bars at the default tempo
    settings.custom_start = ostinato_engine::transport::Transport::new(44_100).position_at_bar(1);
    settings.custom_end = ostinato_engine::transport::Transport::new(44_100).position_at_bar(5);
    client.start_export(settings).await;

    let mut finished = false;
    while let Some(message) = resp_rx.recv().await {
        match message {
            Message::Response(Ok(Action::ExportFinished {
                cancelled, clipped, ..
            })) => {
                assert!(!cancelled);
                assert!(!clipped);
                finished = true;
                break;
            }
            Message::Response(Err(reason)) => panic!("engine error: {reason}"),
            _ => {}
        }
    }
    assert!(finished);
    assert!(path.exists());

    client.quit().await;
    handle.await.unwrap();
}
