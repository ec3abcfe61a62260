use crate::exporter::ExportSettings;
use crate::kind::Kind;
use crate::message::{Action, Message};
use tokio::sync::mpsc::Sender;

/// Cheap cloneable handle for submitting actions to a running session.
#[derive(Debug, Clone)]
pub struct Client {
    tx: Sender<Message>,
}

impl Client {
    pub fn new(tx: Sender<Message>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, message: Message) {
        let _ = self.tx.send(message).await;
    }

    /// Registers a response channel; every engine response is mirrored to
    /// it.
    pub async fn subscribe(&self, sender: Sender<Message>) {
        self.send(Message::Channel(sender)).await;
    }

    pub async fn request(&self, action: Action) {
        self.send(Message::Request(action)).await;
    }

    pub async fn add_track(&self, name: impl Into<String>) {
        self.request(Action::AddTrack { name: name.into() }).await;
    }

    pub async fn connect(&self, from: impl Into<String>, to: impl Into<String>, kind: Kind) {
        self.request(Action::Connect {
            from_track: from.into(),
            to_track: to.into(),
            kind,
        })
        .await;
    }

    pub async fn play(&self) {
        self.request(Action::Play).await;
    }

    pub async fn stop(&self) {
        self.request(Action::Stop).await;
    }

    pub async fn start_export(&self, settings: ExportSettings) {
        self.request(Action::StartExport(Box::new(settings))).await;
    }

    pub async fn cancel_export(&self) {
        self.request(Action::CancelExport).await;
    }

    pub async fn quit(self) {
        self.request(Action::Quit).await;
    }
}
