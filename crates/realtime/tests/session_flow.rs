//! End-to-end tests of the client facade over scripted transport and audio
//! backends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::mpsc;

use sona_realtime::device::{AudioDuplex, AudioSystem};
use sona_realtime::protocol::{ClientEvent, ErrorDetail, ServerEvent};
use sona_realtime::transport::{Connector, EventSink, EventStream};
use sona_realtime::{ClientConfig, ClientNotification, Error, RealtimeClient, Result};

type SharedEvents = Arc<Mutex<Vec<ClientEvent>>>;
type SharedFrames = Arc<Mutex<VecDeque<Vec<i16>>>>;

struct TestSink {
    sent: SharedEvents,
}

#[async_trait]
impl EventSink for TestSink {
    async fn send(&mut self, event: &ClientEvent) -> Result<()> {
        self.sent.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct TestStream {
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

#[async_trait]
impl EventStream for TestStream {
    async fn next_event(&mut self) -> Option<Result<ServerEvent>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Hands out one scripted session; later attempts stay pending so the
/// supervisor parks until stop.
struct TestConnector {
    connects: Arc<AtomicUsize>,
    session: Mutex<Option<(Box<dyn EventSink>, Box<dyn EventStream>)>>,
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(
        &self,
        _model: &str,
        _api_key: &SecretString,
    ) -> Result<(Box<dyn EventSink>, Box<dyn EventStream>)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let session = self.session.lock().unwrap().take();
        match session {
            Some(pair) => Ok(pair),
            None => std::future::pending().await,
        }
    }
}

/// Always refuses the connection, to drive the supervisor into backoff.
struct RefusingConnector {
    connects: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for RefusingConnector {
    async fn connect(
        &self,
        _model: &str,
        _api_key: &SecretString,
    ) -> Result<(Box<dyn EventSink>, Box<dyn EventStream>)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Err(Error::Transport(
            tokio_tungstenite::tungstenite::Error::ConnectionClosed,
        ))
    }
}

struct ScriptedPort {
    frames: SharedFrames,
    written: Arc<Mutex<Vec<i16>>>,
    closed: AtomicBool,
}

impl AudioDuplex for ScriptedPort {
    fn read_frame(&self) -> Result<Vec<i16>> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::AudioClosed);
            }
            if let Some(frame) = self.frames.lock().unwrap().pop_front() {
                return Ok(frame);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn write(&self, samples: &[i16]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::AudioClosed);
        }
        self.written.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct ScriptedAudio {
    frames: SharedFrames,
    written: Arc<Mutex<Vec<i16>>>,
}

impl AudioSystem for ScriptedAudio {
    fn open(&self) -> Result<Arc<dyn AudioDuplex>> {
        Ok(Arc::new(ScriptedPort {
            frames: Arc::clone(&self.frames),
            written: Arc::clone(&self.written),
            closed: AtomicBool::new(false),
        }))
    }
}

struct Harness {
    server_tx: mpsc::UnboundedSender<ServerEvent>,
    sent: SharedEvents,
    frames: SharedFrames,
    connects: Arc<AtomicUsize>,
}

fn build_harness() -> (
    Harness,
    RealtimeClient,
    mpsc::UnboundedReceiver<ClientNotification>,
) {
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    let sent: SharedEvents = Arc::new(Mutex::new(Vec::new()));
    let frames: SharedFrames = Arc::new(Mutex::new(VecDeque::new()));
    let written = Arc::new(Mutex::new(Vec::new()));
    let connects = Arc::new(AtomicUsize::new(0));

    let connector = Arc::new(TestConnector {
        connects: Arc::clone(&connects),
        session: Mutex::new(Some((
            Box::new(TestSink {
                sent: Arc::clone(&sent),
            }) as Box<dyn EventSink>,
            Box::new(TestStream { rx: server_rx }) as Box<dyn EventStream>,
        ))),
    });
    let audio = Arc::new(ScriptedAudio {
        frames: Arc::clone(&frames),
        written,
    });

    let (client, rx) = RealtimeClient::with_backends(ClientConfig::new("test-key"), connector, audio);
    (
        Harness {
            server_tx,
            sent,
            frames,
            connects,
        },
        client,
        rx,
    )
}

async fn wait_for<F>(
    rx: &mut mpsc::UnboundedReceiver<ClientNotification>,
    pred: F,
) -> ClientNotification
where
    F: Fn(&ClientNotification) -> bool,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let notification = rx.recv().await.expect("notification channel closed");
            if pred(&notification) {
                return notification;
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

async fn wait_for_sent<F>(sent: &SharedEvents, pred: F)
where
    F: Fn(&ClientEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if sent.lock().unwrap().iter().any(|e| pred(e)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for outbound event")
}

fn append_count(sent: &SharedEvents) -> usize {
    sent.lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, ClientEvent::InputAudioBufferAppend { .. }))
        .count()
}

#[tokio::test]
async fn session_configures_before_streaming() {
    let (harness, client, mut rx) = build_harness();
    client.start();
    wait_for(&mut rx, |n| matches!(n, ClientNotification::Connection(true))).await;

    let sent = harness.sent.lock().unwrap();
    assert!(
        matches!(sent.first(), Some(ClientEvent::SessionUpdate { .. })),
        "first outbound event must be the configuration event"
    );
    drop(sent);

    client.stop();
}

#[tokio::test]
async fn text_deltas_flush_to_one_assistant_message() {
    let (harness, client, mut rx) = build_harness();
    client.start();
    wait_for(&mut rx, |n| matches!(n, ClientNotification::Connection(true))).await;

    harness
        .server_tx
        .send(ServerEvent::TextDelta {
            delta: Some("Hel".to_string()),
        })
        .unwrap();
    harness
        .server_tx
        .send(ServerEvent::TextDelta {
            delta: Some("lo".to_string()),
        })
        .unwrap();
    harness
        .server_tx
        .send(ServerEvent::TextDone { text: None })
        .unwrap();

    let notification = wait_for(&mut rx, |n| {
        matches!(n, ClientNotification::AssistantText(_))
    })
    .await;
    assert_eq!(
        notification,
        ClientNotification::AssistantText("Hello".to_string())
    );

    // A later boundary with no new deltas flushes nothing.
    harness
        .server_tx
        .send(ServerEvent::TextDone { text: None })
        .unwrap();
    harness
        .server_tx
        .send(ServerEvent::TextDone {
            text: Some("marker".to_string()),
        })
        .unwrap();
    let notification = wait_for(&mut rx, |n| {
        matches!(n, ClientNotification::AssistantText(_))
    })
    .await;
    assert_eq!(
        notification,
        ClientNotification::AssistantText("marker".to_string())
    );

    client.stop();
}

#[tokio::test]
async fn active_response_errors_are_invisible() {
    let (harness, client, mut rx) = build_harness();
    client.start();
    wait_for(&mut rx, |n| matches!(n, ClientNotification::Connection(true))).await;

    for _ in 0..3 {
        harness
            .server_tx
            .send(ServerEvent::Error {
                error: ErrorDetail {
                    code: Some("conversation_already_has_active_response".to_string()),
                    message: None,
                },
            })
            .unwrap();
    }
    harness
        .server_tx
        .send(ServerEvent::TextDone {
            text: Some("marker".to_string()),
        })
        .unwrap();

    // Everything up to the marker must pass without a single error
    // notification.
    let notification = wait_for(&mut rx, |n| {
        matches!(
            n,
            ClientNotification::AssistantText(_) | ClientNotification::ServerError(_)
        )
    })
    .await;
    assert_eq!(
        notification,
        ClientNotification::AssistantText("marker".to_string())
    );

    client.stop();
}

#[tokio::test]
async fn mic_frames_are_suppressed_while_assistant_speaks() {
    let (harness, client, mut rx) = build_harness();
    client.start();
    wait_for(&mut rx, |n| matches!(n, ClientNotification::Connection(true))).await;

    // Assistant audio arrives: speaking flag set, cooldown stamped.
    harness
        .server_tx
        .send(ServerEvent::AudioDelta {
            delta: Some(sona_realtime::audio::encode_i16(&[4096i16; 256])),
        })
        .unwrap();
    wait_for(&mut rx, |n| matches!(n, ClientNotification::AudioLevel(_))).await;

    // A mic frame captured now must never reach the wire.
    harness
        .frames
        .lock()
        .unwrap()
        .push_back(vec![100i16; sona_realtime::audio::FRAME_SAMPLES]);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(append_count(&harness.sent), 0);

    // After the stream ends and the cooldown elapses, frames flow again.
    harness.server_tx.send(ServerEvent::AudioDone).unwrap();
    tokio::time::sleep(Duration::from_millis(900)).await;
    harness
        .frames
        .lock()
        .unwrap()
        .push_back(vec![200i16; sona_realtime::audio::FRAME_SAMPLES]);
    wait_for_sent(&harness.sent, |e| {
        matches!(e, ClientEvent::InputAudioBufferAppend { .. })
    })
    .await;

    client.stop();
}

#[tokio::test]
async fn live_updates_and_text_submissions_reach_the_wire() {
    let (harness, client, mut rx) = build_harness();
    client.start();
    wait_for(&mut rx, |n| matches!(n, ClientNotification::Connection(true))).await;

    client.set_vad_params(Some(0.5), Some(500));
    wait_for_sent(&harness.sent, |e| match e {
        ClientEvent::SessionUpdate { session } => {
            (session.turn_detection.threshold - 0.5).abs() < f32::EPSILON
                && session.turn_detection.silence_duration_ms == 500
        }
        _ => false,
    })
    .await;

    client.submit_text("hello there");
    wait_for_sent(&harness.sent, |e| {
        matches!(e, ClientEvent::ConversationItemCreate { .. })
    })
    .await;
    wait_for_sent(&harness.sent, |e| {
        matches!(e, ClientEvent::ResponseCreate { .. })
    })
    .await;

    client.stop();
}

#[tokio::test]
async fn double_start_keeps_a_single_session() {
    let (harness, client, mut rx) = build_harness();
    client.start();
    client.start();
    wait_for(&mut rx, |n| matches!(n, ClientNotification::Connection(true))).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(harness.connects.load(Ordering::SeqCst), 1);

    client.stop();
}

#[tokio::test]
async fn stop_is_bounded_mid_backoff() {
    let connects = Arc::new(AtomicUsize::new(0));
    let connector = Arc::new(RefusingConnector {
        connects: Arc::clone(&connects),
    });
    let audio = Arc::new(ScriptedAudio {
        frames: Arc::new(Mutex::new(VecDeque::new())),
        written: Arc::new(Mutex::new(Vec::new())),
    });
    let (client, _rx) =
        RealtimeClient::with_backends(ClientConfig::new("test-key"), connector, audio);

    client.start();
    // Let the first attempt fail and the supervisor enter its 5 s backoff.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(connects.load(Ordering::SeqCst) >= 1);

    let started = Instant::now();
    let stopped = tokio::task::spawn_blocking(move || {
        client.stop();
        started.elapsed()
    })
    .await
    .expect("stop task panicked");
    assert!(
        stopped < Duration::from_secs(2),
        "stop took {stopped:?}, expected prompt return mid-backoff"
    );
}
