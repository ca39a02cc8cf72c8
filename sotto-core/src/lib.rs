//! # sotto-core
//!
//! Push-to-talk streaming dictation engine.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CaptureBackend → FrameQueue → sender task → TransportLink → ASR
//!                                                              │
//!                                          AsrResult / faults  ▼
//!                  UserStart/UserStop ──► Coordinator queue ──► step() ──► effects
//!                                                              │
//!                                                              ▼
//!                                                  OutputSink::commit(text)
//! ```
//!
//! The state machine is a pure function; the coordinator's single event-loop
//! task is the only writer of its state. Adapters communicate exclusively by
//! posting session-stamped events onto the coordinator queue, which makes
//! late callbacks from abandoned sessions harmless.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod machine;
pub mod session;
pub mod sink;
pub mod system;
pub mod transport;

// Convenience re-exports for downstream crates
pub use config::{CoordinatorConfig, TransportConfig};
pub use coordinator::{Adapters, Coordinator, EventSender, UiEvent};
pub use error::SottoError;
pub use machine::{Event, EventKind, State};
pub use session::SessionToken;
pub use sink::OutputSink;
pub use transport::AsrResult;
