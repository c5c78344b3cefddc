//! Notifications surfaced to the embedding application.
//!
//! The core never calls back into the presentation layer directly; it posts
//! notifications onto an unbounded channel that the embedding application
//! drains on its own schedule.

use tokio::sync::mpsc;

/// A notification from the session manager to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotification {
    /// A completed assistant message (spoken transcript or text channel).
    AssistantText(String),
    /// Transcript of what the user said, for retrieval-augmented follow-ups.
    UserTranscript(String),
    /// An error reported by the service or a failed pipeline.
    ServerError(String),
    /// Advisory status line.
    Status(String),
    /// Connection state changed.
    Connection(bool),
    /// Instantaneous assistant loudness in `[0, 1]`, for visualizers.
    AudioLevel(f32),
}

/// Sending half of the notification channel, shared by all session tasks.
#[derive(Clone)]
pub(crate) struct Notifier {
    tx: mpsc::UnboundedSender<ClientNotification>,
}

impl Notifier {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<ClientNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, notification: ClientNotification) {
        // A dropped receiver means nobody is listening; that is not an error.
        let _ = self.tx.send(notification);
    }

    pub(crate) fn status(&self, message: impl Into<String>) {
        self.emit(ClientNotification::Status(message.into()));
    }

    pub(crate) fn error(&self, message: impl Into<String>) {
        self.emit(ClientNotification::ServerError(message.into()));
    }

    pub(crate) fn assistant_text(&self, text: String) {
        self.emit(ClientNotification::AssistantText(text));
    }

    pub(crate) fn user_transcript(&self, text: String) {
        self.emit(ClientNotification::UserTranscript(text));
    }

    pub(crate) fn connection(&self, connected: bool) {
        self.emit(ClientNotification::Connection(connected));
    }

    pub(crate) fn audio_level(&self, level: f32) {
        self.emit(ClientNotification::AudioLevel(level));
    }
}
