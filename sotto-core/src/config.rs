//! Runtime tuning for the coordinator and the streaming transport.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for [`crate::coordinator::Coordinator`].
///
/// `sample_rate` and `frame_ms` describe the wire format the recognizer
/// expects and are effectively fixed; they are fields so tests and future
/// endpoints can vary them in one place.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// RMS level (int16 scale) above which a frame counts as voice.
    /// Default: 500.
    pub silence_threshold: u32,
    /// Contiguous silence during recording that triggers an automatic stop.
    /// Default: 60 s.
    pub silence_window: Duration,
    /// PCM sample rate sent on the wire (Hz). Default: 16000.
    pub sample_rate: u32,
    /// Frame duration handed to the queue (ms). Default: 100.
    pub frame_ms: u32,
    /// Audio queue depth in frames. Default: 20 (≈ 2 s).
    pub queue_capacity_frames: usize,
    /// How long bring-up (permissions + device + connect) may take.
    /// Default: 5 s.
    pub arming_timeout: Duration,
    /// Flush window after a user-initiated stop. Default: 1 s.
    pub flush_timeout_stop: Duration,
    /// Flush window on fault/sleep paths. Default: 0.5 s.
    pub flush_timeout_fault: Duration,
    /// Delay before the error state auto-recovers to idle. Default: 3 s.
    pub error_recover: Duration,
    /// Interval of the idle resource sweep. Default: 60 s.
    pub idle_sweep: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 500,
            silence_window: Duration::from_secs(60),
            sample_rate: 16_000,
            frame_ms: 100,
            queue_capacity_frames: 20,
            arming_timeout: Duration::from_secs(5),
            flush_timeout_stop: Duration::from_secs(1),
            flush_timeout_fault: Duration::from_millis(500),
            error_recover: Duration::from_secs(3),
            idle_sweep: Duration::from_secs(60),
        }
    }
}

impl CoordinatorConfig {
    /// Samples per frame at the configured rate and frame duration.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    /// Bytes per frame (16-bit samples).
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples() * 2
    }
}

/// Connection parameters for the streaming recognizer.
///
/// Credentials are opaque to the coordinator — they are forwarded as request
/// headers at connect time and never interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket endpoint of the recognizer.
    pub endpoint: String,
    pub app_key: String,
    pub access_key: String,
    pub resource_id: String,
    /// Recognizer model selector sent in the handshake.
    pub model_name: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://openspeech.bytedance.com/api/v3/sauc/bigmodel_async".into(),
            app_key: String::new(),
            access_key: String::new(),
            resource_id: "volc.bigasr.sauc.duration".into(),
            model_name: "bigmodel".into(),
        }
    }
}
