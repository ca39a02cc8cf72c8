//! Audio capture adapters.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate, block on a lock, or perform I/O. The callback
//! therefore only downmixes into a reused scratch buffer and writes into a
//! lock-free SPSC ring; everything else (resampling, int16 conversion,
//! frame assembly) happens on a dedicated capture worker thread.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). The stream is created, owned and dropped by the worker thread;
//! the handle the coordinator stores only carries the stop flag and the
//! join handle.

pub mod device;
pub mod queue;

use std::sync::Arc;

use crate::coordinator::EventSender;
use crate::error::{Result, SottoError};
use crate::session::SessionToken;

pub use queue::{AudioFrame, FrameQueue};

/// Receives assembled 100 ms frames on the capture worker thread.
///
/// Implementations must not block: the coordinator's implementation does a
/// short queue push and an RMS probe, nothing more.
pub trait FrameSink: Send + Sync + 'static {
    fn frame(&self, frame: AudioFrame);
}

/// Handle to a running capture stream. Both operations are idempotent.
pub trait CaptureStream: Send {
    /// Signal the worker to stop; the device is released on its thread.
    fn stop(&mut self);
    /// Stop and wait for the device to actually be released. A subsequent
    /// open starts from a fresh audio host.
    fn force_release(&mut self);
}

/// Opens capture streams. The coordinator calls this from a detached
/// bring-up job and translates errors into events at that edge.
pub trait CaptureBackend: Send + Sync + 'static {
    /// Open the best available input device and start emitting frames
    /// stamped with `session` into `sink`. Blocks until frames are flowing
    /// or the open failed. Mid-stream faults are posted through `events`.
    fn open(
        &self,
        session: SessionToken,
        sink: Arc<dyn FrameSink>,
        events: EventSender,
    ) -> Result<Box<dyn CaptureStream>>;
}

/// Map an open failure to a user-readable line for the error banner.
pub fn friendly_device_message(err: &SottoError) -> String {
    match err {
        SottoError::NoInputDevice => "No microphone found. Connect an input device.".into(),
        SottoError::AudioDevice(detail) | SottoError::AudioStream(detail) => {
            format!("Audio device error: {detail}")
        }
        other => other.to_string(),
    }
}

/// cpal-backed capture.
#[derive(Debug, Clone)]
pub struct CpalCapture {
    target_rate: u32,
    frame_samples: usize,
}

impl CpalCapture {
    pub fn new(target_rate: u32, frame_samples: usize) -> Self {
        Self {
            target_rate,
            frame_samples,
        }
    }
}

#[cfg(feature = "audio-cpal")]
mod cpal_impl {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, Stream};
    use ringbuf::{
        traits::{Consumer, Observer, Producer, Split},
        HeapCons, HeapProd, HeapRb,
    };
    use rubato::{FastFixedIn, PolynomialDegree, Resampler};
    use tracing::{error, info, warn};

    use crate::machine::{Event, EventKind};

    /// Consecutive stream faults before the device is declared gone.
    const MAX_CONSECUTIVE_FAULTS: u32 = 5;

    /// Samples pulled off the ring per conversion step, at the capture
    /// rate. 20 ms at 48 kHz; small enough to keep frame latency low.
    const CONVERT_BLOCK: usize = 960;

    /// Ring capacity: 2^18 f32 samples ≈ 5.5 s at 48 kHz, enough to ride
    /// out a scheduling hiccup of the worker thread.
    const RING_CAPACITY: usize = 1 << 18;

    /// Sleep when the ring is empty.
    const EMPTY_SLEEP: Duration = Duration::from_millis(5);

    pub(super) struct CpalStreamHandle {
        stop: Arc<AtomicBool>,
        worker: Option<thread::JoinHandle<()>>,
    }

    impl CaptureStream for CpalStreamHandle {
        fn stop(&mut self) {
            self.stop.store(true, Ordering::Release);
        }

        fn force_release(&mut self) {
            self.stop();
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }

    impl Drop for CpalStreamHandle {
        fn drop(&mut self) {
            self.stop();
        }
    }

    impl CaptureBackend for CpalCapture {
        fn open(
            &self,
            session: SessionToken,
            sink: Arc<dyn FrameSink>,
            events: EventSender,
        ) -> Result<Box<dyn CaptureStream>> {
            let stop = Arc::new(AtomicBool::new(false));
            let worker_stop = Arc::clone(&stop);
            let target_rate = self.target_rate;
            let frame_samples = self.frame_samples;

            // Sync channel: the worker reports open success/failure back.
            let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<u32>>();

            let worker = thread::Builder::new()
                .name("sotto-capture".into())
                .spawn(move || {
                    capture_worker(
                        target_rate,
                        frame_samples,
                        session,
                        sink,
                        events,
                        worker_stop,
                        ready_tx,
                    )
                })
                .map_err(|e| SottoError::AudioStream(e.to_string()))?;

            match ready_rx.recv() {
                Ok(Ok(rate)) => {
                    info!(session = %session, capture_rate = rate, "capture started");
                    Ok(Box::new(CpalStreamHandle {
                        stop,
                        worker: Some(worker),
                    }))
                }
                Ok(Err(e)) => {
                    let _ = worker.join();
                    Err(e)
                }
                Err(_) => {
                    let _ = worker.join();
                    Err(SottoError::AudioStream("capture worker died during open".into()))
                }
            }
        }
    }

    /// Owns the stream for its whole life. Converts ring contents to wire
    /// samples via [`WireConverter`] and emits fixed-size frames.
    #[allow(clippy::too_many_arguments)]
    fn capture_worker(
        target_rate: u32,
        frame_samples: usize,
        session: SessionToken,
        sink: Arc<dyn FrameSink>,
        events: EventSender,
        stop: Arc<AtomicBool>,
        ready_tx: std::sync::mpsc::Sender<Result<u32>>,
    ) {
        let fault = Arc::new(AtomicBool::new(false));

        // One retry after a full failure: a fresh host re-initializes the
        // audio subsystem, which clears transient post-wake states.
        let opened = open_stream(session, &events, Arc::clone(&fault)).or_else(|first| {
            warn!(session = %session, error = %first, "device open failed, retrying once");
            thread::sleep(Duration::from_millis(100));
            open_stream(session, &events, Arc::clone(&fault))
        });

        let (stream, mut consumer, capture_rate) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        let mut converter = match WireConverter::new(capture_rate, target_rate) {
            Ok(c) => c,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        let _ = ready_tx.send(Ok(capture_rate));

        let mut pending: Vec<i16> = Vec::with_capacity(frame_samples * 2);

        while !stop.load(Ordering::Acquire) && !fault.load(Ordering::Acquire) {
            if converter.drain(&mut consumer, &mut pending) == 0 {
                thread::sleep(EMPTY_SLEEP);
                continue;
            }

            while pending.len() >= frame_samples {
                let mut pcm = Vec::with_capacity(frame_samples * 2);
                for sample in pending.drain(..frame_samples) {
                    pcm.extend_from_slice(&sample.to_le_bytes());
                }
                sink.frame(AudioFrame {
                    session,
                    pcm,
                    captured_at: std::time::Instant::now(),
                });
            }
        }

        // Stream drops here, releasing the device on this thread.
        drop(stream);
        info!(session = %session, "capture worker exited");
    }

    /// Turns ring-buffered device samples into wire samples.
    ///
    /// The SPSC ring doubles as the staging buffer: `drain` pops whole
    /// [`CONVERT_BLOCK`]s off it (leaving any partial block for the next
    /// pass), rate-converts when the device is not already at the wire
    /// rate, and quantizes straight into the caller's int16 frame-assembly
    /// buffer. One step, device float to wire int16.
    struct WireConverter {
        /// `None` when the device already captures at the wire rate.
        down: Option<FastFixedIn<f32>>,
        /// Exactly one rubato input block, refilled from the ring.
        block: Box<[f32]>,
        /// rubato output scratch, `[1][output_frames_max]`.
        scratch: Vec<Vec<f32>>,
    }

    impl WireConverter {
        fn new(capture_rate: u32, wire_rate: u32) -> Result<Self> {
            let down = if capture_rate == wire_rate {
                None
            } else {
                let down = FastFixedIn::<f32>::new(
                    wire_rate as f64 / capture_rate as f64,
                    1.0,
                    PolynomialDegree::Cubic,
                    CONVERT_BLOCK,
                    1,
                )
                .map_err(|e| SottoError::AudioDevice(format!("rate converter init: {e}")))?;
                Some(down)
            };

            let scratch = match &down {
                Some(d) => vec![vec![0f32; d.output_frames_max()]],
                None => Vec::new(),
            };

            Ok(Self {
                down,
                block: vec![0f32; CONVERT_BLOCK].into_boxed_slice(),
                scratch,
            })
        }

        /// Convert every complete block the ring currently holds, appending
        /// int16 wire samples to `out`. Returns the number appended; 0
        /// means the ring holds less than one block.
        fn drain(&mut self, ring: &mut HeapCons<f32>, out: &mut Vec<i16>) -> usize {
            let mut appended = 0;
            while ring.occupied_len() >= self.block.len() {
                let got = ring.pop_slice(&mut self.block);
                debug_assert_eq!(got, self.block.len());

                match self.down.as_mut() {
                    None => {
                        out.extend(self.block.iter().map(|s| quantize(*s)));
                        appended += self.block.len();
                    }
                    Some(down) => {
                        let input = [&self.block[..]];
                        match down.process_into_buffer(&input, &mut self.scratch, None) {
                            Ok((_, produced)) => {
                                out.extend(self.scratch[0][..produced].iter().map(|s| quantize(*s)));
                                appended += produced;
                            }
                            Err(e) => error!("rate conversion failed: {e}"),
                        }
                    }
                }
            }
            appended
        }
    }

    fn quantize(sample: f32) -> i16 {
        (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
    }

    type OpenedStream = (Stream, HeapCons<f32>, u32);

    /// Try input devices in priority order until one opens and plays.
    fn open_stream(
        session: SessionToken,
        events: &EventSender,
        fault: Arc<AtomicBool>,
    ) -> Result<OpenedStream> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());

        let mut candidates: Vec<(String, bool, cpal::Device)> = host
            .input_devices()
            .map_err(|e| classify_open_error(&e.to_string()))?
            .enumerate()
            .map(|(idx, dev)| {
                let name = dev
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                let is_default = default_name.as_deref() == Some(name.as_str());
                (name, is_default, dev)
            })
            .collect();
        if candidates.is_empty() {
            return Err(SottoError::NoInputDevice);
        }
        device::sort_for_fallback(&mut candidates);

        let mut last_err = SottoError::NoInputDevice;
        for (name, _, dev) in candidates {
            match try_open_device(&name, &dev, session, events, Arc::clone(&fault)) {
                Ok(parts) => {
                    info!(session = %session, device = name.as_str(), "opened input device");
                    return Ok(parts);
                }
                Err(e) => {
                    warn!(device = name.as_str(), error = %e, "input device rejected");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    fn try_open_device(
        name: &str,
        device: &cpal::Device,
        session: SessionToken,
        events: &EventSender,
        fault: Arc<AtomicBool>,
    ) -> Result<OpenedStream> {
        let supported = device
            .default_input_config()
            .map_err(|e| classify_open_error(&format!("{name}: {e}")))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        let config = cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let (producer, consumer) = HeapRb::<f32>::new(RING_CAPACITY).split();
        let err_cb = stream_error_callback(session, events.clone(), fault);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let mut producer = producer;
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        push_mono(&mut producer, &mut mix_buf, data, channels, |s| s);
                    },
                    err_cb,
                    None,
                )
            }
            SampleFormat::I16 => {
                let mut producer = producer;
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        push_mono(&mut producer, &mut mix_buf, data, channels, |s| {
                            s as f32 / 32768.0
                        });
                    },
                    err_cb,
                    None,
                )
            }
            fmt => {
                return Err(SottoError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| classify_open_error(&e.to_string()))?;

        stream
            .play()
            .map_err(|e| classify_open_error(&e.to_string()))?;

        Ok((stream, consumer, sample_rate))
    }

    /// Downmix interleaved input to mono and push into the ring. Reuses
    /// `mix_buf` so the audio callback never allocates after warm-up.
    fn push_mono<T: Copy>(
        producer: &mut HeapProd<f32>,
        mix_buf: &mut Vec<f32>,
        data: &[T],
        channels: usize,
        to_f32: impl Fn(T) -> f32,
    ) {
        let frames = data.len() / channels.max(1);
        mix_buf.resize(frames, 0.0);
        if channels <= 1 {
            for (dst, src) in mix_buf.iter_mut().zip(data.iter()) {
                *dst = to_f32(*src);
            }
        } else {
            for (f, dst) in mix_buf.iter_mut().enumerate() {
                let base = f * channels;
                let mut sum = 0f32;
                for c in 0..channels {
                    sum += to_f32(data[base + c]);
                }
                *dst = sum / channels as f32;
            }
        }
        let written = producer.push_slice(mix_buf);
        if written < mix_buf.len() {
            // Worker is behind; dropping at the ring keeps the callback RT-safe.
            error!("capture ring full: dropped {} samples", mix_buf.len() - written);
        }
    }

    /// Repeated in-stream faults mean the device went away. Report once.
    fn stream_error_callback(
        session: SessionToken,
        events: EventSender,
        fault: Arc<AtomicBool>,
    ) -> impl FnMut(cpal::StreamError) + Send + 'static {
        let mut consecutive: u32 = 0;
        move |err| {
            consecutive += 1;
            let gone = matches!(err, cpal::StreamError::DeviceNotAvailable)
                || consecutive >= MAX_CONSECUTIVE_FAULTS;
            if gone && !fault.swap(true, Ordering::AcqRel) {
                error!(session = %session, error = %err, "input device lost");
                events.post(
                    Event::for_session(EventKind::AudioDeviceGone, session)
                        .with_detail(err.to_string()),
                );
            } else if !gone {
                warn!(session = %session, error = %err, consecutive, "audio stream fault");
            }
        }
    }

    fn classify_open_error(detail: &str) -> SottoError {
        let lowered = detail.to_ascii_lowercase();
        if lowered.contains("permission") || lowered.contains("not permitted") {
            SottoError::PermissionDenied
        } else {
            SottoError::AudioDevice(detail.to_string())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn ring_with(samples: &[f32]) -> (HeapProd<f32>, HeapCons<f32>) {
            let (mut producer, consumer) = HeapRb::<f32>::new(RING_CAPACITY).split();
            producer.push_slice(samples);
            (producer, consumer)
        }

        #[test]
        fn passthrough_quantizes_whole_blocks() {
            let (_producer, mut ring) = ring_with(&vec![0.5f32; CONVERT_BLOCK]);
            let mut converter = WireConverter::new(16_000, 16_000).unwrap();
            let mut out = Vec::new();

            let appended = converter.drain(&mut ring, &mut out);
            assert_eq!(appended, CONVERT_BLOCK);
            assert_eq!(out.len(), CONVERT_BLOCK);
            let expected = (0.5 * f32::from(i16::MAX)) as i16;
            assert!(out.iter().all(|&s| s == expected));
            assert_eq!(ring.occupied_len(), 0);
        }

        #[test]
        fn partial_block_stays_in_the_ring() {
            let (_producer, mut ring) = ring_with(&vec![0.1f32; CONVERT_BLOCK - 1]);
            let mut converter = WireConverter::new(48_000, 16_000).unwrap();
            let mut out = Vec::new();

            assert_eq!(converter.drain(&mut ring, &mut out), 0);
            assert!(out.is_empty());
            assert_eq!(ring.occupied_len(), CONVERT_BLOCK - 1);
        }

        #[test]
        fn downsampling_48k_yields_a_third_of_the_samples() {
            let (_producer, mut ring) = ring_with(&vec![0.0f32; CONVERT_BLOCK * 3]);
            let mut converter = WireConverter::new(48_000, 16_000).unwrap();
            let mut out = Vec::new();

            let appended = converter.drain(&mut ring, &mut out);
            // Three 48 kHz blocks come out as roughly one block's worth of
            // 16 kHz samples; the polynomial filter may hold back a few.
            let expected = CONVERT_BLOCK as isize;
            assert!(
                (appended as isize - expected).unsigned_abs() <= 30,
                "appended {appended}, expected ≈{expected}"
            );
            assert_eq!(ring.occupied_len(), 0);
        }

        #[test]
        fn quantize_clamps_out_of_range_samples() {
            assert_eq!(quantize(2.0), i16::MAX);
            assert_eq!(quantize(-2.0), -i16::MAX);
            assert_eq!(quantize(0.0), 0);
        }
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl CaptureBackend for CpalCapture {
    fn open(
        &self,
        _session: SessionToken,
        _sink: Arc<dyn FrameSink>,
        _events: EventSender,
    ) -> Result<Box<dyn CaptureStream>> {
        Err(SottoError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}
