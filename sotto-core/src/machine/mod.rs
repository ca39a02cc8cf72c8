//! Recording state machine.
//!
//! ## Design
//!
//! [`step`] is a pure transition function: `(ctx, event) → effects`, with the
//! new state written into `ctx`. It performs no I/O, reads no clocks and logs
//! nothing — the runtime executes the returned [`Effect`] values and owns
//! every side channel. The same `(ctx, event)` pair always yields the same
//! `(ctx', effects)`.
//!
//! ## Session isolation
//!
//! Every event may carry a [`SessionToken`]. The first check in [`step`]
//! drops any event whose token does not match the live session, so late
//! callbacks from abandoned bring-up attempts can never mutate state. The
//! adapters merely stamp tokens; they do not reason about freshness.
//!
//! ```text
//!             UserStart                 all ready
//!   Idle ───────────────► Arming ───────────────────► Recording
//!    ▲                      │  UserStop / timeout         │ UserStop / fault
//!    │                      ▼                             ▼
//!    ◄────────────────── (release)                    Stopping
//!    ▲                                                    │ flushed / timeout
//!    └────────────────────────────────────────────────────┘ commit + release
//! ```

use std::time::Duration;

use serde::Serialize;

use crate::config::CoordinatorConfig;
use crate::session::SessionToken;

/// Coordinator state. Written only by the coordinator's event-loop task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Not recording, no resources held.
    Idle,
    /// Bring-up in flight (permissions, device, connection).
    Arming,
    /// Capturing and streaming.
    Recording,
    /// Capture stopped, flushing pending audio.
    Stopping,
    /// A terminal fault was surfaced; auto-recovers shortly.
    Error,
}

/// Event kinds accepted by [`step`], in three families: user intent, system
/// notifications, and edge-translated errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // User
    UserStart,
    UserStop,
    Quit,
    // System
    MicPermissionOk,
    AudioReady,
    TransportConnected,
    TransportDisconnected,
    DefaultInputChanged,
    SystemWillSleep,
    SystemDidWake,
    QueueFlushed,
    FlushTimeout,
    AutoRecover,
    // Error
    MicPermissionDenied,
    AccessibilityDenied,
    AudioDeviceGone,
    AudioInitFailed,
    TransportError,
    NetworkUnavailable,
    ArmingTimeout,
}

/// One queue entry: a kind, an optional session stamp, an optional detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub session: Option<SessionToken>,
    pub detail: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            session: None,
            detail: None,
        }
    }

    pub fn for_session(kind: EventKind, session: SessionToken) -> Self {
        Self {
            kind,
            session: Some(session),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Names in the runtime's timer registry. Arming a name replaces any prior
/// registration under the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerName {
    ArmingTimeout,
    FlushTimeout,
    SilenceCheck,
    IdleSweep,
    ErrorRecover,
}

/// Declarative side-effect. Executing these is the runtime's job; the order
/// within one [`step`] result is significant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    CheckPermissions,
    InitAudio,
    ConnectTransport,
    StartCapture,
    StopCapture,
    CloseTransport,
    ReleaseResources,
    FlushQueue,
    /// Status text for the indicator; `None` hides it.
    UpdateUi(Option<String>),
    ShowError(String),
    /// Finalized transcript for the output sink (may be empty).
    CommitText(String),
    ArmTimer(TimerName, Duration),
    CancelTimer(TimerName),
}

/// Readiness flags collected during arming, with a latch so promotion
/// effects are emitted exactly once even when the three readiness events
/// land back to back.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArmingGate {
    pub perm_ok: bool,
    pub audio_ready: bool,
    pub transport_ready: bool,
    started: bool,
}

impl ArmingGate {
    /// Latch and report readiness. Returns `true` exactly once, on the call
    /// that observes all three flags set.
    fn check_ready(&mut self) -> bool {
        if self.started {
            return false;
        }
        if self.perm_ok && self.audio_ready && self.transport_ready {
            self.started = true;
            return true;
        }
        false
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timeout tuning baked into the context so [`step`] never reads a config or
/// a clock.
#[derive(Debug, Clone, Copy)]
pub struct MachineTuning {
    pub arming_timeout: Duration,
    pub flush_timeout_stop: Duration,
    pub flush_timeout_fault: Duration,
    pub error_recover: Duration,
}

impl Default for MachineTuning {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

impl From<&CoordinatorConfig> for MachineTuning {
    fn from(cfg: &CoordinatorConfig) -> Self {
        Self {
            arming_timeout: cfg.arming_timeout,
            flush_timeout_stop: cfg.flush_timeout_stop,
            flush_timeout_fault: cfg.flush_timeout_fault,
            error_recover: cfg.error_recover,
        }
    }
}

/// Full machine context: state, live session and its transcript
/// accumulators.
///
/// Transcript fields are mutated by the coordinator under its state lock
/// when recognizer results arrive; [`step`] only ever reads them (to build
/// the commit effect).
#[derive(Debug)]
pub struct MachineCtx {
    pub state: State,
    pub session: Option<SessionToken>,
    pub arming: ArmingGate,
    pub error_message: Option<String>,
    /// Concatenation of finalized utterances for the live session.
    pub committed_text: String,
    /// Latest non-final partial; replaced wholesale on each partial result.
    pub current_text: String,
    tuning: MachineTuning,
}

impl MachineCtx {
    pub fn new(tuning: MachineTuning) -> Self {
        Self {
            state: State::Idle,
            session: None,
            arming: ArmingGate::default(),
            error_message: None,
            committed_text: String::new(),
            current_text: String::new(),
            tuning,
        }
    }

    /// Committed plus pending text, in utterance order.
    pub fn full_text(&self) -> String {
        let mut text = self.committed_text.clone();
        text.push_str(&self.current_text);
        text
    }

    /// Rotate to a fresh session: new token, cleared gate and accumulators.
    fn begin_session(&mut self) -> SessionToken {
        let token = SessionToken::mint();
        self.session = Some(token);
        self.arming.reset();
        self.committed_text.clear();
        self.current_text.clear();
        self.error_message = None;
        token
    }

    /// Device hot-swap restart: rotates the token and resets the gate, but
    /// keeps `perm_ok` — no permission check is re-issued on this path and
    /// permission state cannot regress while the key is held.
    fn soft_restart(&mut self) -> SessionToken {
        let token = self.begin_session();
        self.arming.perm_ok = true;
        token
    }

    fn clear_session(&mut self) {
        self.session = None;
    }
}

fn bring_up(tuning: &MachineTuning) -> Vec<Effect> {
    vec![
        Effect::UpdateUi(Some("Initializing…".into())),
        Effect::ArmTimer(TimerName::ArmingTimeout, tuning.arming_timeout),
        Effect::CheckPermissions,
        Effect::InitAudio,
        Effect::ConnectTransport,
    ]
}

fn promote(ctx: &mut MachineCtx) -> Vec<Effect> {
    if !ctx.arming.check_ready() {
        return Vec::new();
    }
    ctx.state = State::Recording;
    vec![
        Effect::CancelTimer(TimerName::ArmingTimeout),
        Effect::StartCapture,
        Effect::UpdateUi(Some("Speak now…".into())),
    ]
}

fn teardown_to_idle(ctx: &mut MachineCtx, effects: Vec<Effect>) -> Vec<Effect> {
    ctx.state = State::Idle;
    ctx.clear_session();
    effects
}

const HINT_MIC_DENIED: &str = "Microphone access is denied. Enable it in System Settings.";
const HINT_AX_DENIED: &str = "Accessibility access is denied. Enable it in System Settings.";

/// Process one event. Returns the effects the runtime must execute, in
/// order. Any `(state, event)` pair without an explicit arm below is a
/// no-op.
pub fn step(ctx: &mut MachineCtx, event: &Event) -> Vec<Effect> {
    // Stale-session filter: stamped events must match the live session.
    if let Some(token) = event.session {
        if ctx.session != Some(token) {
            return Vec::new();
        }
    }

    match (ctx.state, event.kind) {
        // ── Idle ───────────────────────────────────────────────────────
        (State::Idle, EventKind::UserStart) => {
            ctx.begin_session();
            ctx.state = State::Arming;
            bring_up(&ctx.tuning)
        }
        (State::Idle, EventKind::MicPermissionDenied) => {
            vec![Effect::ShowError(HINT_MIC_DENIED.into())]
        }
        (State::Idle, EventKind::AccessibilityDenied) => {
            vec![Effect::ShowError(HINT_AX_DENIED.into())]
        }

        // ── Arming ─────────────────────────────────────────────────────
        (State::Arming, EventKind::MicPermissionOk) => {
            ctx.arming.perm_ok = true;
            promote(ctx)
        }
        (State::Arming, EventKind::AudioReady) => {
            ctx.arming.audio_ready = true;
            promote(ctx)
        }
        (State::Arming, EventKind::TransportConnected) => {
            ctx.arming.transport_ready = true;
            promote(ctx)
        }
        (State::Arming, EventKind::UserStop) => teardown_to_idle(
            ctx,
            vec![
                Effect::ReleaseResources,
                Effect::UpdateUi(Some("Cancelled".into())),
            ],
        ),
        (State::Arming, EventKind::ArmingTimeout) => teardown_to_idle(
            ctx,
            vec![
                Effect::ReleaseResources,
                Effect::ShowError("Initialization timed out, try again.".into()),
            ],
        ),
        (State::Arming, EventKind::MicPermissionDenied) => {
            ctx.state = State::Error;
            ctx.error_message = Some(HINT_MIC_DENIED.into());
            vec![
                Effect::CancelTimer(TimerName::ArmingTimeout),
                Effect::ReleaseResources,
                Effect::ShowError(HINT_MIC_DENIED.into()),
                Effect::ArmTimer(TimerName::ErrorRecover, ctx.tuning.error_recover),
            ]
        }
        (State::Arming, EventKind::AudioInitFailed) => {
            let message = event
                .detail
                .clone()
                .unwrap_or_else(|| "Audio initialization failed.".into());
            ctx.state = State::Error;
            ctx.error_message = Some(message.clone());
            vec![
                Effect::CancelTimer(TimerName::ArmingTimeout),
                Effect::ReleaseResources,
                Effect::ShowError(message),
                Effect::ArmTimer(TimerName::ErrorRecover, ctx.tuning.error_recover),
            ]
        }
        (State::Arming, EventKind::TransportError) => {
            let message = event
                .detail
                .clone()
                .unwrap_or_else(|| "Connection failed, try again.".into());
            teardown_to_idle(ctx, vec![Effect::ReleaseResources, Effect::ShowError(message)])
        }
        (State::Arming, EventKind::NetworkUnavailable) => teardown_to_idle(
            ctx,
            vec![
                Effect::ReleaseResources,
                Effect::ShowError("Network is unreachable. Check your connection.".into()),
            ],
        ),
        // Accessibility faults are terminal for the attempt but not worth
        // the error state: release and let the user retry.
        (State::Arming, EventKind::AccessibilityDenied) => teardown_to_idle(
            ctx,
            vec![
                Effect::ReleaseResources,
                Effect::ShowError(HINT_AX_DENIED.into()),
            ],
        ),

        // ── Recording ──────────────────────────────────────────────────
        (State::Recording, EventKind::UserStop) => {
            ctx.state = State::Stopping;
            vec![
                Effect::StopCapture,
                Effect::FlushQueue,
                Effect::ArmTimer(TimerName::FlushTimeout, ctx.tuning.flush_timeout_stop),
                Effect::UpdateUi(Some("Processing…".into())),
            ]
        }
        (State::Recording, EventKind::DefaultInputChanged) => {
            ctx.soft_restart();
            ctx.state = State::Arming;
            vec![
                Effect::StopCapture,
                Effect::CloseTransport,
                Effect::InitAudio,
                Effect::ConnectTransport,
                Effect::UpdateUi(Some("Audio device changed, reconnecting…".into())),
            ]
        }
        (State::Recording, EventKind::SystemWillSleep) => {
            ctx.state = State::Stopping;
            vec![
                Effect::StopCapture,
                Effect::FlushQueue,
                Effect::ArmTimer(TimerName::FlushTimeout, ctx.tuning.flush_timeout_fault),
            ]
        }
        (State::Recording, EventKind::TransportError) => {
            let message = event
                .detail
                .clone()
                .unwrap_or_else(|| "Connection lost.".into());
            ctx.state = State::Stopping;
            vec![
                Effect::StopCapture,
                Effect::FlushQueue,
                Effect::ArmTimer(TimerName::FlushTimeout, ctx.tuning.flush_timeout_fault),
                Effect::ShowError(message),
            ]
        }
        (State::Recording, EventKind::AudioDeviceGone) => {
            ctx.state = State::Stopping;
            vec![
                Effect::FlushQueue,
                Effect::ArmTimer(TimerName::FlushTimeout, ctx.tuning.flush_timeout_fault),
                Effect::ShowError("Audio device disconnected.".into()),
            ]
        }

        // ── Stopping ───────────────────────────────────────────────────
        (State::Stopping, EventKind::QueueFlushed) | (State::Stopping, EventKind::FlushTimeout) => {
            let text = ctx.full_text();
            teardown_to_idle(
                ctx,
                vec![
                    Effect::CancelTimer(TimerName::FlushTimeout),
                    Effect::CloseTransport,
                    Effect::ReleaseResources,
                    Effect::CommitText(text),
                    Effect::UpdateUi(None),
                ],
            )
        }
        // Repeated releases while flushing are expected (key bounce).
        (State::Stopping, EventKind::UserStop) => Vec::new(),

        // ── Error ──────────────────────────────────────────────────────
        (State::Error, EventKind::UserStart) => {
            ctx.begin_session();
            ctx.state = State::Arming;
            let mut effects = vec![
                Effect::CancelTimer(TimerName::ErrorRecover),
                Effect::ReleaseResources,
            ];
            effects.extend(bring_up(&ctx.tuning));
            effects
        }
        (State::Error, EventKind::AutoRecover)
        | (State::Error, EventKind::SystemDidWake)
        | (State::Error, EventKind::UserStop) => {
            ctx.error_message = None;
            teardown_to_idle(
                ctx,
                vec![Effect::ReleaseResources, Effect::UpdateUi(None)],
            )
        }

        _ => Vec::new(),
    }
}
