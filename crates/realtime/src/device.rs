//! Abstract duplex audio device and the cpal-backed implementation.
//!
//! The session engine only sees the [`AudioDuplex`] trait: a blocking read of
//! fixed-size capture frames, a blocking write of playback samples, and a
//! forced close that unblocks both. The production backend bridges those
//! blocking calls to cpal's realtime callbacks through lock-free ring
//! buffers, with the streams themselves owned by a dedicated thread (cpal
//! streams are not `Send`).

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::audio::{FRAME_SAMPLES, SAMPLE_RATE, convert_f32_to_i16};
use crate::error::{Error, Result};

/// How often blocked reads and writes re-check the ring buffers.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Capture ring capacity: ten seconds of backlog before frames are dropped.
const CAPTURE_CAPACITY: usize = SAMPLE_RATE as usize * 10;

/// Playback ring capacity: thirty seconds of queued assistant audio.
const PLAYBACK_CAPACITY: usize = SAMPLE_RATE as usize * 30;

/// One open capture+playback device pair, valid for a single session.
pub trait AudioDuplex: Send + Sync {
    /// Blocks until a full capture frame of [`FRAME_SAMPLES`] mono PCM16
    /// samples is available, or the port is closed.
    fn read_frame(&self) -> Result<Vec<i16>>;

    /// Queues samples for playback, blocking while the playback buffer is
    /// full, until the port is closed.
    fn write(&self, samples: &[i16]) -> Result<()>;

    /// Forcibly releases the device, unblocking pending reads and writes.
    /// Safe to call more than once.
    fn close(&self);
}

/// Opens one [`AudioDuplex`] per session.
pub trait AudioSystem: Send + Sync {
    fn open(&self) -> Result<Arc<dyn AudioDuplex>>;
}

/// Audio backend over the host's default capture and playback devices.
pub struct CpalAudio;

impl AudioSystem for CpalAudio {
    fn open(&self) -> Result<Arc<dyn AudioDuplex>> {
        let duplex = CpalDuplex::open()?;
        Ok(duplex)
    }
}

/// cpal-backed duplex port.
pub struct CpalDuplex {
    capture: Mutex<HeapCons<i16>>,
    playback: Mutex<HeapProd<i16>>,
    closed: Arc<AtomicBool>,
}

impl CpalDuplex {
    fn open() -> Result<Arc<Self>> {
        let (capture_prod, capture_cons) = HeapRb::<i16>::new(CAPTURE_CAPACITY).split();
        let (playback_prod, playback_cons) = HeapRb::<i16>::new(PLAYBACK_CAPACITY).split();
        let closed = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread_closed = Arc::clone(&closed);
        std::thread::Builder::new()
            .name("sona-audio".to_string())
            .spawn(move || {
                audio_thread(capture_prod, playback_cons, thread_closed, ready_tx);
            })
            .map_err(|e| Error::Audio(format!("failed to spawn audio thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::Audio("audio thread exited during setup".to_string())),
        }

        Ok(Arc::new(Self {
            capture: Mutex::new(capture_cons),
            playback: Mutex::new(playback_prod),
            closed,
        }))
    }
}

impl AudioDuplex for CpalDuplex {
    fn read_frame(&self) -> Result<Vec<i16>> {
        let mut frame = vec![0i16; FRAME_SAMPLES];
        let mut filled = 0;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::AudioClosed);
            }
            {
                let mut capture = self
                    .capture
                    .lock()
                    .map_err(|e| Error::Poisoned(e.to_string()))?;
                filled += capture.pop_slice(&mut frame[filled..]);
            }
            if filled == FRAME_SAMPLES {
                return Ok(frame);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn write(&self, samples: &[i16]) -> Result<()> {
        let mut offset = 0;
        while offset < samples.len() {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::AudioClosed);
            }
            let pushed = {
                let mut playback = self
                    .playback
                    .lock()
                    .map_err(|e| Error::Poisoned(e.to_string()))?;
                playback.push_slice(&samples[offset..])
            };
            offset += pushed;
            if offset < samples.len() {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Owns the cpal streams for the lifetime of one open port.
fn audio_thread(
    capture_prod: HeapProd<i16>,
    playback_cons: HeapCons<i16>,
    closed: Arc<AtomicBool>,
    ready: std::sync::mpsc::Sender<Result<()>>,
) {
    match build_streams(capture_prod, playback_cons) {
        Ok((input_stream, output_stream)) => {
            let _ = ready.send(Ok(()));
            while !closed.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(50));
            }
            drop(input_stream);
            drop(output_stream);
            tracing::debug!("audio streams released");
        }
        Err(e) => {
            let _ = ready.send(Err(e));
        }
    }
}

fn build_streams(
    mut capture_prod: HeapProd<i16>,
    mut playback_cons: HeapCons<i16>,
) -> Result<(cpal::Stream, cpal::Stream)> {
    let host = cpal::default_host();

    let input = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;
    let output = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let input_config = pick_config(
        input
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?,
        "capture",
    )?;
    let output_config = pick_config(
        output
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?,
        "playback",
    )?;

    tracing::debug!(
        input = input.name().unwrap_or_default(),
        output = output.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        in_channels = input_config.channels,
        out_channels = output_config.channels,
        "audio duplex initialized"
    );

    let in_channels = input_config.channels as usize;
    let input_stream = input
        .build_input_stream(
            &input_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if in_channels == 1 {
                    let samples = convert_f32_to_i16(data);
                    let _ = capture_prod.push_slice(&samples);
                } else {
                    // Downmix interleaved channels to mono.
                    for frame in data.chunks(in_channels) {
                        let sum: f32 = frame.iter().sum();
                        let sample = (sum / in_channels as f32 * 32768.0)
                            .clamp(i16::MIN as f32, i16::MAX as f32)
                            as i16;
                        let _ = capture_prod.try_push(sample);
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    let out_channels = output_config.channels as usize;
    let output_stream = output
        .build_output_stream(
            &output_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(out_channels) {
                    let sample = playback_cons
                        .try_pop()
                        .map_or(0.0, |s| s as f32 / 32768.0);
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    input_stream
        .play()
        .map_err(|e| Error::Audio(e.to_string()))?;
    output_stream
        .play()
        .map_err(|e| Error::Audio(e.to_string()))?;

    Ok((input_stream, output_stream))
}

/// Picks an f32 stream config at the fixed wire sample rate, preferring mono
/// and falling back to stereo.
fn pick_config<I>(ranges: I, what: &str) -> Result<StreamConfig>
where
    I: Iterator<Item = cpal::SupportedStreamConfigRange>,
{
    ranges
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .filter(|c| {
            c.channels() >= 1
                && c.channels() <= 2
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .map(|c| c.with_sample_rate(SampleRate(SAMPLE_RATE)).config())
        .ok_or_else(|| Error::Audio(format!("no suitable {what} config at {SAMPLE_RATE} Hz")))
}
