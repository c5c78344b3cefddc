//! Shared state crossing the control and session execution contexts.
//!
//! One `SharedState` is created per client and handed by `Arc` into the
//! worker thread. Control methods mutate it from the caller's thread; the
//! session tasks read it from theirs, so every field is either atomic,
//! mutex-guarded, or a channel endpoint.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;

use secrecy::SecretString;
use tokio::sync::{mpsc, watch};

use crate::config::{ClientConfig, SessionConfig};
use crate::device::AudioDuplex;
use crate::protocol::ClientEvent;

pub(crate) struct SharedState {
    pub(crate) config: Mutex<SessionConfig>,
    pub(crate) api_key: Mutex<SecretString>,
    /// Stop signal; the only flag set from outside the session context that
    /// the pipelines and the supervisor must observe promptly.
    pub(crate) stop: watch::Sender<bool>,
    pub(crate) mic_enabled: AtomicBool,
    pub(crate) speaker_enabled: AtomicBool,
    pub(crate) connected: AtomicBool,
    /// Non-owning handle to the live outbound event channel. Present only
    /// while a session is running; stale sends silently fail.
    live: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    /// The currently open audio port, so `stop()` can force-release it and
    /// unblock a pending read.
    live_audio: Mutex<Option<Arc<dyn AudioDuplex>>>,
}

impl SharedState {
    pub(crate) fn new(config: ClientConfig) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            config: Mutex::new(config.session),
            api_key: Mutex::new(config.api_key),
            stop,
            mic_enabled: AtomicBool::new(true),
            speaker_enabled: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            live: Mutex::new(None),
            live_audio: Mutex::new(None),
        })
    }

    pub(crate) fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    pub(crate) fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub(crate) fn session_config(&self) -> SessionConfig {
        self.config
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn api_key(&self) -> SecretString {
        self.api_key
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Sends an event over the live connection, if any. Returns whether the
    /// event was accepted; a stale or absent handle is a silent no-op.
    pub(crate) fn dispatch_live(&self, event: ClientEvent) -> bool {
        let live = self
            .live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match live.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub(crate) fn set_live(&self, tx: mpsc::UnboundedSender<ClientEvent>) {
        *self
            .live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
    }

    pub(crate) fn clear_live(&self) {
        self.live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }

    pub(crate) fn set_live_audio(&self, port: Arc<dyn AudioDuplex>) {
        *self
            .live_audio
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(port);
    }

    pub(crate) fn clear_live_audio(&self) {
        self.live_audio
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }

    /// Force-closes the live audio port, unblocking any pending read or
    /// write. Part of the `stop()` path.
    pub(crate) fn close_live_audio(&self) {
        let live_audio = self
            .live_audio
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(port) = live_audio.as_ref() {
            port.close();
        }
    }
}
