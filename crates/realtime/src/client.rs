//! Thread-safe control facade for the realtime session manager.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::ClientConfig;
use crate::device::{AudioSystem, CpalAudio};
use crate::notify::{ClientNotification, Notifier};
use crate::protocol::ClientEvent;
use crate::state::SharedState;
use crate::supervisor;
use crate::transport::{Connector, WsConnector};

/// Bound on how long `stop()` waits for the worker thread to wind down.
const STOP_WAIT: Duration = Duration::from_secs(3);

/// Background client for a realtime speech service.
///
/// Owns a dedicated worker thread with its own single-threaded runtime; all
/// session lifecycle work happens there. Control methods are safe to call
/// from any thread and never block on network or audio I/O. Notifications
/// flow over the channel handed out at construction.
pub struct RealtimeClient {
    shared: Arc<SharedState>,
    notifier: Notifier,
    connector: Arc<dyn Connector>,
    audio: Arc<dyn AudioSystem>,
    worker: Mutex<Option<Worker>>,
}

struct Worker {
    thread: std::thread::JoinHandle<()>,
    done_rx: std::sync::mpsc::Receiver<()>,
}

impl RealtimeClient {
    /// Creates a client over the default WebSocket transport and the host's
    /// default audio devices.
    #[must_use]
    pub fn new(config: ClientConfig) -> (Self, UnboundedReceiver<ClientNotification>) {
        Self::with_backends(config, Arc::new(WsConnector::new()), Arc::new(CpalAudio))
    }

    /// Creates a client with explicit transport and audio backends.
    #[must_use]
    pub fn with_backends(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        audio: Arc<dyn AudioSystem>,
    ) -> (Self, UnboundedReceiver<ClientNotification>) {
        let (notifier, rx) = Notifier::channel();
        let shared = SharedState::new(config);
        (
            Self {
                shared,
                notifier,
                connector,
                audio,
                worker: Mutex::new(None),
            },
            rx,
        )
    }

    /// Starts the reconnection supervisor on its own worker thread.
    /// Idempotent: a second call while the worker is alive is a no-op.
    pub fn start(&self) {
        let mut worker = self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if worker.as_ref().is_some_and(|w| !w.thread.is_finished()) {
            return;
        }

        self.shared.stop.send_replace(false);

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let notifier = self.notifier.clone();
        let connector = Arc::clone(&self.connector);
        let audio = Arc::clone(&self.audio);

        let spawned = std::thread::Builder::new()
            .name("sona-realtime".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        notifier.error(format!("failed to start session runtime: {e}"));
                        let _ = done_tx.send(());
                        return;
                    }
                };
                runtime.block_on(supervisor::run(shared, notifier, connector, audio));
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(thread) => *worker = Some(Worker { thread, done_rx }),
            Err(e) => self
                .notifier
                .error(format!("failed to spawn worker thread: {e}")),
        }
    }

    /// Requests a stop and waits, bounded, for the worker to terminate.
    ///
    /// The stop flag interrupts the supervisor's backoff and both pipelines;
    /// force-closing the audio port unblocks a pending capture read. Safe to
    /// call repeatedly and from any thread.
    pub fn stop(&self) {
        self.shared.stop.send_replace(true);
        self.shared.close_live_audio();

        let worker = {
            let mut guard = self
                .worker
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take()
        };
        if let Some(worker) = worker {
            match worker.done_rx.recv_timeout(STOP_WAIT) {
                Ok(()) | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    let _ = worker.thread.join();
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    // Leave the worker detached; it exits on its next stop
                    // check.
                    tracing::warn!("worker did not stop within {STOP_WAIT:?}; detaching");
                }
            }
        }
    }

    /// Updates the system instructions. Empty text is ignored. If a session
    /// is live, a configuration event is dispatched best-effort; otherwise
    /// the next session picks the new value up.
    pub fn set_instructions(&self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        {
            let mut config = self
                .shared
                .config
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            config.instructions = text;
        }
        self.dispatch_session_update();
    }

    /// Updates the assistant voice. Empty voice names are ignored.
    pub fn set_voice(&self, voice: impl Into<String>) {
        let voice = voice.into();
        if voice.is_empty() {
            return;
        }
        {
            let mut config = self
                .shared
                .config
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            config.voice = voice;
        }
        self.dispatch_session_update();
    }

    /// Updates the server-VAD parameters. The threshold is clamped to
    /// `[0, 1]` and the silence window to at least 100 ms.
    pub fn set_vad_params(&self, threshold: Option<f32>, silence_ms: Option<u32>) {
        let (threshold, silence_ms) = {
            let mut config = self
                .shared
                .config
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(threshold) = threshold {
                config.set_vad_threshold(threshold);
            }
            if let Some(silence_ms) = silence_ms {
                config.set_vad_silence_ms(silence_ms);
            }
            (config.vad_threshold(), config.vad_silence_ms())
        };
        self.notifier.status(format!(
            "VAD updated: threshold={threshold:.2}, silence={silence_ms} ms"
        ));
        self.dispatch_session_update();
    }

    /// Replaces the credential used by the next connection attempt. An
    /// already-established connection is unaffected.
    pub fn set_api_key(&self, api_key: impl Into<String>) {
        *self
            .shared
            .api_key
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) =
            SecretString::from(api_key.into());
    }

    /// Enables or disables forwarding microphone audio.
    pub fn toggle_mic(&self, enabled: bool) {
        self.shared.mic_enabled.store(enabled, Ordering::SeqCst);
        self.notifier.status(if enabled {
            "Microphone enabled."
        } else {
            "Microphone muted."
        });
    }

    /// Enables or disables playback of assistant audio.
    pub fn toggle_speaker(&self, enabled: bool) {
        self.shared.speaker_enabled.store(enabled, Ordering::SeqCst);
        self.notifier.status(if enabled {
            "Speaker enabled."
        } else {
            "Speaker muted."
        });
    }

    /// Submits typed user text: a conversation item followed by a response
    /// request. No-op when disconnected or when the text is empty.
    pub fn submit_text(&self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() || !self.shared.connected.load(Ordering::SeqCst) {
            return;
        }
        if self.shared.dispatch_live(ClientEvent::user_message(text)) {
            self.shared.dispatch_live(ClientEvent::response_create());
        }
    }

    /// Asks the service to generate a response for the current conversation,
    /// used after a user transcript has been folded into the instructions.
    /// No-op when disconnected.
    pub fn request_response(&self) {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return;
        }
        self.shared.dispatch_live(ClientEvent::response_create());
    }

    /// Whether a session is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn dispatch_session_update(&self) {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return;
        }
        let config = self.shared.session_config();
        self.shared
            .dispatch_live(ClientEvent::session_update(&config));
    }
}
