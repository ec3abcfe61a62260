use crate::clip::{AudioClip, MidiClip};
use crate::engine::{AudioEngine, EngineHandle};
use crate::exporter::{self, ExportError, ExportOutcome, ExportProgress};
use crate::message::{Action, Message};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{error, info};

struct ExportJob {
    progress: Arc<ExportProgress>,
    path: PathBuf,
}

/// Control-thread message loop. Owns the engine; topology mutations go
/// through the pause handshake, exports run on a blocking worker and
/// report back as `Message::ExportDone`.
pub struct Session {
    rx: Receiver<Message>,
    tx: Sender<Message>,
    clients: Vec<Sender<Message>>,
    engine: EngineHandle,
    export: Option<ExportJob>,
}

impl Session {
    pub fn new(
        rx: Receiver<Message>,
        tx: Sender<Message>,
        sample_rate: u32,
        block_length: usize,
    ) -> Self {
        Self {
            rx,
            tx,
            clients: vec![],
            engine: AudioEngine::new(sample_rate, block_length).into_handle(),
            export: None,
        }
    }

    pub fn engine(&self) -> EngineHandle {
        self.engine.clone()
    }

    async fn notify_clients(&self, action: Result<Action, String>) {
        for client in &self.clients {
            if let Err(e) = client.send(Message::Response(action.clone())).await {
                error!("Error sending response to client: {e}");
            }
        }
    }

    async fn handle_request(&mut self, action: Action) {
        match action {
            Action::Quit | Action::ExportFinished { .. } => {}
            Action::Play => {
                self.engine.lock().transport.play_state = crate::transport::PlayState::Rolling;
            }
            Action::Stop => {
                self.engine.lock().transport.play_state = crate::transport::PlayState::Paused;
            }
            Action::SetBpm(bpm) => {
                let gate = self.engine.lock().gate.clone();
                let _pause = gate.pause();
                self.engine.lock().transport.set_bpm(bpm);
            }
            Action::AddTrack { ref name } => {
                let gate = self.engine.lock().gate.clone();
                let _pause = gate.pause();
                if let Err(e) = self.engine.lock().add_track(name) {
                    self.notify_clients(Err(e)).await;
                    return;
                }
            }
            Action::RemoveTrack(ref name) => {
                let gate = self.engine.lock().gate.clone();
                let _pause = gate.pause();
                if let Err(e) = self.engine.lock().remove_track(name) {
                    self.notify_clients(Err(e)).await;
                    return;
                }
            }
            Action::TrackLevel(ref name, level_db) => {
                match self.engine.lock().tracklist.get(name) {
                    Some(track) => track.lock().set_level_db(level_db),
                    None => {
                        self.notify_clients(Err(format!("Track not found: {name}")))
                            .await;
                        return;
                    }
                }
            }
            Action::TrackPan(ref name, pan) => match self.engine.lock().tracklist.get(name) {
                Some(track) => track.lock().set_pan(pan),
                None => {
                    self.notify_clients(Err(format!("Track not found: {name}")))
                        .await;
                    return;
                }
            },
            Action::TrackToggleMute(ref name) => {
                let engine = self.engine.lock();
                match engine.tracklist.get(name) {
                    Some(track) => {
                        let t = track.lock();
                        t.muted = !t.muted;
                    }
                    None => {
                        self.notify_clients(Err(format!("Track not found: {name}")))
                            .await;
                        return;
                    }
                }
                engine.tracklist.apply_mute_solo_policy();
            }
            Action::TrackToggleSolo(ref name) => {
                let engine = self.engine.lock();
                match engine.tracklist.get(name) {
                    Some(track) => {
                        let t = track.lock();
                        t.soloed = !t.soloed;
                    }
                    None => {
                        self.notify_clients(Err(format!("Track not found: {name}")))
                            .await;
                        return;
                    }
                }
                engine.tracklist.apply_mute_solo_policy();
            }
            Action::TrackMarkForBounce {
                ref track_name,
                bounce,
            } => match self.engine.lock().tracklist.get(track_name) {
                Some(track) => track.lock().bounce = bounce,
                None => {
                    self.notify_clients(Err(format!("Track not found: {track_name}")))
                        .await;
                    return;
                }
            },
            Action::Connect {
                ref from_track,
                ref to_track,
                kind,
            } => {
                let gate = self.engine.lock().gate.clone();
                let _pause = gate.pause();
                if let Err(e) = self.engine.lock().connect_tracks(from_track, to_track, kind) {
                    self.notify_clients(Err(e)).await;
                    return;
                }
            }
            Action::Disconnect {
                ref from_track,
                ref to_track,
                kind,
            } => {
                let gate = self.engine.lock().gate.clone();
                let _pause = gate.pause();
                if let Err(e) = self
                    .engine
                    .lock()
                    .disconnect_tracks(from_track, to_track, kind)
                {
                    self.notify_clients(Err(e)).await;
                    return;
                }
            }
            Action::AddToneClip {
                ref track_name,
                freq,
                amp,
                start_frame,
                frames,
            } => {
                let engine = self.engine.lock();
                match engine.tracklist.get(track_name) {
                    Some(track) => {
                        let clip = AudioClip::tone(
                            format!("tone {freq} Hz"),
                            start_frame,
                            frames,
                            freq,
                            amp,
                            engine.sample_rate,
                        );
                        track.lock().audio_clips.push(clip);
                    }
                    None => {
                        self.notify_clients(Err(format!("Track not found: {track_name}")))
                            .await;
                        return;
                    }
                }
            }
            Action::AddMidiClip {
                ref track_name,
                start_tick,
                ref notes,
            } => match self.engine.lock().tracklist.get(track_name) {
                Some(track) => {
                    track
                        .lock()
                        .midi_clips
                        .push(MidiClip::new("notes".to_string(), start_tick, notes.clone()));
                }
                None => {
                    self.notify_clients(Err(format!("Track not found: {track_name}")))
                        .await;
                    return;
                }
            },
            Action::StartExport(ref settings) => {
                if self.export.is_some() || self.engine.lock().exporting {
                    self.notify_clients(Err("Export already in progress".to_string()))
                        .await;
                    return;
                }
                self.engine.lock().exporting = true;
                let progress = ExportProgress::new();
                self.export = Some(ExportJob {
                    progress: progress.clone(),
                    path: settings.file_path.clone(),
                });
                let engine = self.engine.clone();
                let job_settings = (**settings).clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = tokio::task::spawn_blocking(move || {
                        exporter::export(&engine, &job_settings, &progress)
                    })
                    .await
                    .unwrap_or_else(|e| {
                        Err(ExportError::WriteShortfall(format!(
                            "export worker died: {e}"
                        )))
                    });
                    if let Err(e) = tx.send(Message::ExportDone(Box::new(result))).await {
                        error!("Error delivering export result: {e}");
                    }
                });
            }
            Action::CancelExport => match &self.export {
                Some(job) => job.progress.cancel(),
                None => {
                    self.notify_clients(Err("No export in progress".to_string()))
                        .await;
                    return;
                }
            },
        }
        self.notify_clients(Ok(action.clone())).await;
    }

    async fn handle_export_done(&mut self, result: Result<ExportOutcome, ExportError>) {
        let job = self.export.take();
        self.engine.lock().exporting = false;
        match result {
            Ok(ExportOutcome::Completed(report)) => {
                self.notify_clients(Ok(Action::ExportFinished {
                    path: report.path,
                    cancelled: false,
                    clipped: report.clipped,
                    peak_db: report.peak_db,
                }))
                .await;
            }
            Ok(ExportOutcome::Cancelled) => {
                let path = job.map(|j| j.path).unwrap_or_default();
                self.notify_clients(Ok(Action::ExportFinished {
                    path,
                    cancelled: true,
                    clipped: false,
                    peak_db: -90.0,
                }))
                .await;
            }
            Err(err) => {
                self.notify_clients(Err(err.to_string())).await;
            }
        }
    }

    pub async fn work(&mut self) {
        while let Some(message) = self.rx.recv().await {
            match message {
                Message::Channel(sender) => {
                    self.clients.push(sender);
                }
                Message::Request(Action::Quit) => {
                    if let Some(job) = &self.export {
                        job.progress.cancel();
                    }
                    self.notify_clients(Ok(Action::Quit)).await;
                    info!("session shutting down");
                    return;
                }
                Message::Request(action) => {
                    self.handle_request(action).await;
                }
                Message::ExportDone(result) => {
                    self.handle_export_done(*result).await;
                }
                Message::Response(_) => {}
            }
        }
    }
}
