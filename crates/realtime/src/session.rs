//! One realtime session: startup sequence, the concurrent send and receive
//! pipelines, echo policy, and teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::audio;
use crate::device::{AudioDuplex, AudioSystem};
use crate::notify::Notifier;
use crate::protocol::{ClientEvent, ERR_ACTIVE_RESPONSE, ServerEvent};
use crate::state::SharedState;
use crate::transport::{Connector, EventSink, EventStream};

/// Suppression window after the assistant's last audio chunk, giving
/// acoustic echo time to decay before mic audio is forwarded again.
const ASSISTANT_COOLDOWN: Duration = Duration::from_millis(800);

/// Bound on draining the send pipeline and closing the sink at teardown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Capture frames in flight between the bridge thread and the send pipeline.
const FRAME_CHANNEL_DEPTH: usize = 8;

/// How one session attempt ended, for the supervisor's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionOutcome {
    /// Voluntary end: stop requested, or nothing went wrong.
    Clean,
    /// The service closed the connection.
    PeerClosed,
    /// Setup or pipeline failure.
    Failed,
}

/// Why a pipeline stopped iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineEnd {
    Stopped,
    Closed,
    Error,
}

/// Echo-avoidance state, written by the receive pipeline and read by the
/// send pipeline.
pub(crate) struct EchoGuard {
    speaking: AtomicBool,
    /// Milliseconds since `epoch` of the last assistant audio chunk, offset
    /// by one so zero means "never".
    last_audio_ms: AtomicU64,
    epoch: Instant,
    cooldown: Duration,
}

impl EchoGuard {
    pub(crate) fn new(cooldown: Duration) -> Self {
        Self {
            speaking: AtomicBool::new(false),
            last_audio_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            cooldown,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    /// Marks the assistant as speaking and stamps the cooldown clock.
    pub(crate) fn note_audio(&self) {
        self.speaking.store(true, Ordering::SeqCst);
        self.last_audio_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    /// The assistant's audio stream ended.
    pub(crate) fn stream_ended(&self) {
        self.speaking.store(false, Ordering::SeqCst);
    }

    /// Whether mic audio must currently be suppressed.
    pub(crate) fn suppresses(&self) -> bool {
        if self.speaking.load(Ordering::SeqCst) {
            return true;
        }
        let last = self.last_audio_ms.load(Ordering::SeqCst);
        if last == 0 {
            return false;
        }
        self.now_ms().saturating_sub(last) < self.cooldown.as_millis() as u64
    }
}

/// Accumulates incremental transcript deltas until a "done" boundary.
#[derive(Default)]
pub(crate) struct TranscriptAccumulator {
    audio: String,
    text: String,
}

impl TranscriptAccumulator {
    pub(crate) fn push_audio_delta(&mut self, delta: &str) {
        self.audio.push_str(delta);
    }

    pub(crate) fn push_text_delta(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    /// Flushes the audio transcript unless the text channel already carries
    /// this response. The event's own transcript field wins over the
    /// accumulated deltas. Both buffers reset either way.
    pub(crate) fn finish_audio(&mut self, transcript: Option<String>) -> Option<String> {
        let flushed = if self.text.is_empty() {
            let text = transcript
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| std::mem::take(&mut self.audio));
            if text.is_empty() { None } else { Some(text) }
        } else {
            None
        };
        self.audio.clear();
        self.text.clear();
        flushed
    }

    /// Flushes the text channel; the event's final text wins over the
    /// accumulated deltas. Both buffers reset.
    pub(crate) fn finish_text(&mut self, text: Option<String>) -> Option<String> {
        let text = text
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| std::mem::take(&mut self.text));
        self.audio.clear();
        self.text.clear();
        if text.is_empty() { None } else { Some(text) }
    }
}

/// Runs one full session attempt: open audio, connect, configure, stream
/// until either pipeline ends or stop is requested, then tear down. The
/// audio port is always released before the transport is closed.
pub(crate) async fn run_session(
    shared: &Arc<SharedState>,
    notifier: &Notifier,
    connector: &Arc<dyn Connector>,
    audio_system: &Arc<dyn AudioSystem>,
) -> SessionOutcome {
    let config = shared.session_config();
    notifier.status(format!("Connecting to realtime service ({})...", config.model));

    let port = match audio_system.open() {
        Ok(port) => port,
        Err(e) => {
            notifier.error(format!("failed to open audio device: {e}"));
            return SessionOutcome::Failed;
        }
    };
    shared.set_live_audio(Arc::clone(&port));

    let mut stop_rx = shared.stop_rx();
    if shared.stop_requested() {
        release_audio(shared, port.as_ref());
        return SessionOutcome::Clean;
    }
    let api_key = shared.api_key();
    let connected = tokio::select! {
        result = connector.connect(&config.model, &api_key) => result,
        _ = stop_rx.changed() => {
            release_audio(shared, port.as_ref());
            return SessionOutcome::Clean;
        }
    };
    let (mut sink, stream) = match connected {
        Ok(pair) => pair,
        Err(e) => {
            release_audio(shared, port.as_ref());
            if !shared.stop_requested() {
                notifier.error(format!("connection failed: {e}"));
            }
            return SessionOutcome::Failed;
        }
    };

    // The configuration event always precedes the pipelines.
    if let Err(e) = sink.send(&ClientEvent::session_update(&config)).await {
        release_audio(shared, port.as_ref());
        let _ = tokio::time::timeout(TEARDOWN_TIMEOUT, sink.close()).await;
        if !shared.stop_requested() {
            notifier.error(format!("failed to configure session: {e}"));
        }
        return SessionOutcome::Failed;
    }

    let (live_tx, live_rx) = mpsc::unbounded_channel();
    shared.set_live(live_tx);
    shared.connected.store(true, Ordering::SeqCst);
    notifier.connection(true);
    notifier.status(format!(
        "Connected (VAD threshold={:.2}, silence={} ms). You can start speaking.",
        config.vad_threshold(),
        config.vad_silence_ms()
    ));
    tracing::info!(model = %config.model, "realtime session established");

    let guard = Arc::new(EchoGuard::new(ASSISTANT_COOLDOWN));

    // Bridge thread: blocking frame reads, forwarded into the async send
    // pipeline. Closing the port unblocks the read and ends the channel.
    let (frame_tx, frame_rx) = mpsc::channel::<Vec<i16>>(FRAME_CHANNEL_DEPTH);
    let bridge_port = Arc::clone(&port);
    let bridge = std::thread::Builder::new()
        .name("sona-capture".to_string())
        .spawn(move || {
            while let Ok(frame) = bridge_port.read_frame() {
                if frame_tx.blocking_send(frame).is_err() {
                    break;
                }
            }
        });
    let bridge = match bridge {
        Ok(handle) => handle,
        Err(e) => {
            teardown(shared, notifier, port.as_ref());
            let _ = tokio::time::timeout(TEARDOWN_TIMEOUT, sink.close()).await;
            notifier.error(format!("failed to spawn capture bridge: {e}"));
            return SessionOutcome::Failed;
        }
    };

    let mut send_task = tokio::spawn(send_pipeline(
        sink,
        frame_rx,
        live_rx,
        Arc::clone(shared),
        Arc::clone(&guard),
        notifier.clone(),
        shared.stop_rx(),
    ));
    let mut recv_task = tokio::spawn(receive_pipeline(
        stream,
        Arc::clone(&port),
        Arc::clone(shared),
        Arc::clone(&guard),
        notifier.clone(),
        shared.stop_rx(),
    ));

    let (first_end, sink_back) = tokio::select! {
        joined = &mut send_task => {
            recv_task.abort();
            match joined {
                Ok((end, sink)) => (end, Some(sink)),
                Err(_) => (PipelineEnd::Error, None),
            }
        }
        joined = &mut recv_task => {
            let recv_end = joined.unwrap_or(PipelineEnd::Error);
            // Wind the sender down by releasing its frame source and live
            // handle, then collect the sink for an orderly close.
            port.close();
            shared.clear_live();
            match tokio::time::timeout(TEARDOWN_TIMEOUT, &mut send_task).await {
                Ok(Ok((_, sink))) => (recv_end, Some(sink)),
                _ => {
                    send_task.abort();
                    (recv_end, None)
                }
            }
        }
    };

    teardown(shared, notifier, port.as_ref());
    let _ = bridge.join();
    if let Some(mut sink) = sink_back {
        let _ = tokio::time::timeout(TEARDOWN_TIMEOUT, sink.close()).await;
    }
    notifier.status("Session closed.");

    if shared.stop_requested() {
        return SessionOutcome::Clean;
    }
    match first_end {
        PipelineEnd::Stopped => SessionOutcome::Clean,
        PipelineEnd::Closed => SessionOutcome::PeerClosed,
        PipelineEnd::Error => SessionOutcome::Failed,
    }
}

fn release_audio(shared: &SharedState, port: &dyn AudioDuplex) {
    port.close();
    shared.clear_live_audio();
}

fn teardown(shared: &Arc<SharedState>, notifier: &Notifier, port: &dyn AudioDuplex) {
    shared.clear_live();
    if shared.connected.swap(false, Ordering::SeqCst) {
        notifier.connection(false);
    }
    release_audio(shared, port);
}

/// Mic → service. One iteration per capture frame; control events from the
/// facade are interleaved on the same sink.
async fn send_pipeline(
    mut sink: Box<dyn EventSink>,
    mut frames: mpsc::Receiver<Vec<i16>>,
    mut live_rx: mpsc::UnboundedReceiver<ClientEvent>,
    shared: Arc<SharedState>,
    guard: Arc<EchoGuard>,
    notifier: Notifier,
    mut stop_rx: watch::Receiver<bool>,
) -> (PipelineEnd, Box<dyn EventSink>) {
    let end = loop {
        if shared.stop_requested() {
            break PipelineEnd::Stopped;
        }
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break PipelineEnd::Stopped;
                }
            }
            maybe_frame = frames.recv() => {
                let Some(frame) = maybe_frame else {
                    if shared.stop_requested() {
                        break PipelineEnd::Stopped;
                    }
                    notifier.error("audio capture ended unexpectedly");
                    break PipelineEnd::Error;
                };
                if !shared.mic_enabled.load(Ordering::SeqCst) {
                    continue;
                }
                if guard.suppresses() {
                    continue;
                }
                let event = ClientEvent::audio_append(audio::encode_i16(&frame));
                if let Err(e) = sink.send(&event).await {
                    if shared.stop_requested() {
                        break PipelineEnd::Stopped;
                    }
                    notifier.error(format!("audio send failed: {e}"));
                    break PipelineEnd::Error;
                }
            }
            maybe_ctrl = live_rx.recv() => {
                let Some(event) = maybe_ctrl else {
                    break PipelineEnd::Closed;
                };
                if let Err(e) = sink.send(&event).await {
                    if shared.stop_requested() {
                        break PipelineEnd::Stopped;
                    }
                    notifier.error(format!("event send failed: {e}"));
                    break PipelineEnd::Error;
                }
            }
        }
    };
    (end, sink)
}

/// Service → speaker/text. One iteration per inbound event.
async fn receive_pipeline(
    mut stream: Box<dyn EventStream>,
    port: Arc<dyn AudioDuplex>,
    shared: Arc<SharedState>,
    guard: Arc<EchoGuard>,
    notifier: Notifier,
    mut stop_rx: watch::Receiver<bool>,
) -> PipelineEnd {
    let mut transcripts = TranscriptAccumulator::default();
    loop {
        if shared.stop_requested() {
            return PipelineEnd::Stopped;
        }
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return PipelineEnd::Stopped;
                }
            }
            maybe_event = stream.next_event() => {
                match maybe_event {
                    None => return PipelineEnd::Closed,
                    Some(Err(e)) => {
                        if shared.stop_requested() {
                            return PipelineEnd::Stopped;
                        }
                        notifier.error(format!("receive failed: {e}"));
                        return PipelineEnd::Error;
                    }
                    Some(Ok(event)) => {
                        if let Err(end) = handle_server_event(
                            event,
                            &port,
                            &shared,
                            &guard,
                            &mut transcripts,
                            &notifier,
                        )
                        .await
                        {
                            return end;
                        }
                    }
                }
            }
        }
    }
}

async fn handle_server_event(
    event: ServerEvent,
    port: &Arc<dyn AudioDuplex>,
    shared: &Arc<SharedState>,
    guard: &Arc<EchoGuard>,
    transcripts: &mut TranscriptAccumulator,
    notifier: &Notifier,
) -> Result<(), PipelineEnd> {
    match event {
        ServerEvent::AudioDelta { delta } => {
            if !shared.speaker_enabled.load(Ordering::SeqCst) {
                return Ok(());
            }
            let Some(delta) = delta else {
                return Ok(());
            };
            let samples = audio::decode_i16(&delta);
            if samples.is_empty() {
                return Ok(());
            }
            guard.note_audio();
            let level = audio::level_estimate(&samples);
            let write_port = Arc::clone(port);
            let written = tokio::task::spawn_blocking(move || write_port.write(&samples)).await;
            match written {
                Ok(Ok(())) => notifier.audio_level(level),
                Ok(Err(_)) | Err(_) => {
                    // A write failure racing a requested stop is expected.
                    if shared.stop_requested() {
                        return Err(PipelineEnd::Stopped);
                    }
                    notifier.error("playback write failed");
                    return Err(PipelineEnd::Error);
                }
            }
        }
        ServerEvent::AudioDone => guard.stream_ended(),
        ServerEvent::AudioTranscriptDelta { delta } => {
            if let Some(delta) = delta {
                transcripts.push_audio_delta(&delta);
            }
        }
        ServerEvent::AudioTranscriptDone { transcript } => {
            if let Some(text) = transcripts.finish_audio(transcript) {
                notifier.assistant_text(text);
            }
        }
        ServerEvent::TextDelta { delta } => {
            if let Some(delta) = delta {
                transcripts.push_text_delta(&delta);
            }
        }
        ServerEvent::TextDone { text } => {
            if let Some(text) = transcripts.finish_text(text) {
                notifier.assistant_text(text);
            }
        }
        ServerEvent::InputAudioTranscriptionCompleted { transcript } => {
            if let Some(text) = transcript.filter(|t| !t.is_empty()) {
                notifier.user_transcript(text);
            }
        }
        ServerEvent::Error { error } => {
            if error.code.as_deref() == Some(ERR_ACTIVE_RESPONSE) {
                return Ok(());
            }
            notifier.error(error.describe());
        }
        ServerEvent::Unknown => {}
    }
    Ok(())
}
