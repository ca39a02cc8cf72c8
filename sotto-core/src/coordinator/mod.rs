//! Coordinator runtime.
//!
//! ## Lifecycle
//!
//! ```text
//! Coordinator::spawn(cfg, adapters)
//!     └─► event loop task (single writer of machine state)
//!           ├─ step() per event, effects executed in order
//!           ├─ detached bring-up jobs (permissions / device / connect)
//!           ├─ sender task per recording session
//!           └─ named timers (arming / flush / silence / idle / recover)
//! ```
//!
//! Every collaborator posts into one queue; nothing calls back into the
//! coordinator synchronously. Bring-up jobs capture the session token at
//! spawn time and stamp everything they post — jobs that outlive their
//! session keep running, but their events are dropped by the stale filter.
//!
//! Lock discipline: the machine lock and the adapter-slot lock are short
//! critical sections with no I/O and are never held across an await.

pub mod timers;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{
    friendly_device_message, queue, AudioFrame, CaptureBackend, CaptureStream, FrameQueue,
    FrameSink,
};
use crate::config::CoordinatorConfig;
use crate::error::SottoError;
use crate::machine::{self, Effect, Event, EventKind, MachineCtx, MachineTuning, State, TimerName};
use crate::session::SessionToken;
use crate::sink::OutputSink;
use crate::system::{PermissionStatus, SystemProbe};
use crate::transport::{AsrResult, TransportFactory, TransportLink};

use timers::TimerRegistry;

/// UI-facing event channel depth.
const UI_CHANNEL_CAP: usize = 64;

/// Silence-guard polling cadence.
const SILENCE_POLL: Duration = Duration::from_secs(1);

/// Bound on the flush drain loop.
const FLUSH_DRAIN_BUDGET: Duration = Duration::from_millis(500);

/// Messages consumed by the event loop. Recognition results are side data
/// for the coordinator — they never enter the state machine.
#[derive(Debug)]
pub enum Inbound {
    Event(Event),
    Asr {
        session: SessionToken,
        result: AsrResult,
    },
}

/// Cloneable posting handle shared with adapters, probes and timers.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl EventSender {
    pub fn post(&self, event: Event) {
        let _ = self.tx.send(Inbound::Event(event));
    }

    pub fn post_asr(&self, session: SessionToken, result: AsrResult) {
        let _ = self.tx.send(Inbound::Asr { session, result });
    }
}

/// Events published to the host UI. The host owns presentation (banners
/// auto-hide after ~2 s, the indicator mirrors the state).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum UiEvent {
    StateChanged { from: State, to: State },
    /// Status text for the indicator; `None` hides it.
    Status { text: Option<String> },
    ErrorBanner { message: String },
    /// Live transcript (committed + pending partial).
    Transcript { text: String, is_final: bool },
}

/// The coordinator's collaborators, injected at construction so tests can
/// substitute fakes.
pub struct Adapters {
    pub capture: Arc<dyn CaptureBackend>,
    pub transport: Arc<dyn TransportFactory>,
    pub probe: Arc<dyn SystemProbe>,
    pub sink: Arc<dyn OutputSink>,
}

struct SenderHandle {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SenderHandle {
    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        self.task.abort();
    }
}

/// Mutable adapter handles, guarded by one short lock.
#[derive(Default)]
struct Slots {
    capture: Option<Box<dyn CaptureStream>>,
    transport: Option<Arc<dyn TransportLink>>,
    sender: Option<SenderHandle>,
}

struct Inner {
    cfg: CoordinatorConfig,
    machine: Mutex<MachineCtx>,
    slots: Mutex<Slots>,
    timers: TimerRegistry,
    queue: Arc<FrameQueue>,
    /// Refreshed by the silence probe; read by the silence guard.
    last_voice: Mutex<Instant>,
    adapters: Adapters,
    events: EventSender,
    ui_tx: broadcast::Sender<UiEvent>,
}

/// Handle to a running coordinator.
pub struct Coordinator {
    inner: Arc<Inner>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Start the coordinator. Must be called within a Tokio runtime.
    pub fn spawn(cfg: CoordinatorConfig, adapters: Adapters) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventSender { tx };
        let (ui_tx, _) = broadcast::channel(UI_CHANNEL_CAP);

        let tuning = MachineTuning::from(&cfg);
        let queue = Arc::new(FrameQueue::with_capacity(cfg.queue_capacity_frames));
        let inner = Arc::new(Inner {
            cfg,
            machine: Mutex::new(MachineCtx::new(tuning)),
            slots: Mutex::new(Slots::default()),
            timers: TimerRegistry::default(),
            queue,
            last_voice: Mutex::new(Instant::now()),
            adapters,
            events: events.clone(),
            ui_tx,
        });

        inner.adapters.probe.subscribe(events.clone());
        arm_idle_sweep(&inner);

        let loop_inner = Arc::clone(&inner);
        let loop_task = tokio::spawn(event_loop(loop_inner, rx));

        info!("coordinator started");
        Self {
            inner,
            loop_task: Mutex::new(Some(loop_task)),
        }
    }

    pub fn user_start(&self) {
        self.inner.events.post(Event::new(EventKind::UserStart));
    }

    pub fn user_stop(&self) {
        self.inner.events.post(Event::new(EventKind::UserStop));
    }

    pub fn post(&self, event: Event) {
        self.inner.events.post(event);
    }

    /// Posting handle for hosts and probes.
    pub fn events(&self) -> EventSender {
        self.inner.events.clone()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> State {
        self.inner.machine.lock().state
    }

    /// Snapshot of the live session token, if any.
    pub fn live_session(&self) -> Option<SessionToken> {
        self.inner.machine.lock().session
    }

    /// Overflow drops observed by the audio queue.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.queue.dropped()
    }

    pub fn subscribe_ui(&self) -> broadcast::Receiver<UiEvent> {
        self.inner.ui_tx.subscribe()
    }

    /// Stop the event loop, release every resource and cancel all timers.
    pub async fn shutdown(&self) {
        self.inner.events.post(Event::new(EventKind::Quit));
        let task = self.loop_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn event_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(message) = rx.recv().await {
        match message {
            Inbound::Event(event) => {
                if event.kind == EventKind::Quit {
                    inner.quit();
                    break;
                }
                handle_event(&inner, event);
            }
            Inbound::Asr { session, result } => inner.on_asr_result(session, result),
        }
    }
}

fn handle_event(inner: &Arc<Inner>, event: Event) {
    let (old_state, new_state, effects, session) = {
        let mut ctx = inner.machine.lock();
        let old = ctx.state;
        let effects = machine::step(&mut ctx, &event);
        (old, ctx.state, effects, ctx.session)
    };

    if old_state != new_state {
        info!(
            event = ?event.kind,
            from = ?old_state,
            to = ?new_state,
            session = %session.map(|s| s.short()).unwrap_or_default(),
            "state transition"
        );
        // Observer notification happens off-lock, before effects.
        let _ = inner.ui_tx.send(UiEvent::StateChanged {
            from: old_state,
            to: new_state,
        });
        if new_state == State::Idle {
            arm_idle_sweep(inner);
        }
    } else if !effects.is_empty() {
        debug!(event = ?event.kind, state = ?old_state, "event handled");
    }

    for effect in effects {
        execute(inner, effect, session);
    }
}

/// Execute one effect. Cheap operations run inline on the loop task;
/// anything that can block or wait is detached.
fn execute(inner: &Arc<Inner>, effect: Effect, session: Option<SessionToken>) {
    match effect {
        Effect::CheckPermissions => {
            let Some(session) = session else { return };
            let job = Arc::clone(inner);
            tokio::task::spawn_blocking(move || job.check_permissions_job(session));
        }
        Effect::InitAudio => {
            let Some(session) = session else { return };
            let job = Arc::clone(inner);
            tokio::task::spawn_blocking(move || init_audio_job(&job, session));
        }
        Effect::ConnectTransport => {
            let Some(session) = session else { return };
            let job = Arc::clone(inner);
            tokio::spawn(async move { connect_transport_job(&job, session).await });
        }
        Effect::StartCapture => start_capture(inner, session),
        Effect::StopCapture => inner.stop_capture(),
        Effect::CloseTransport => inner.close_transport(),
        Effect::ReleaseResources => inner.release_resources(),
        Effect::FlushQueue => {
            let Some(session) = session else { return };
            let job = Arc::clone(inner);
            tokio::spawn(async move { flush_queue_job(&job, session).await });
        }
        Effect::UpdateUi(text) => {
            let _ = inner.ui_tx.send(UiEvent::Status { text });
        }
        Effect::ShowError(message) => {
            warn!(message = %message, "surfacing error banner");
            let _ = inner.ui_tx.send(UiEvent::ErrorBanner { message });
        }
        Effect::CommitText(text) => {
            info!(chars = text.chars().count(), "committing transcript");
            inner.adapters.sink.commit(&text);
        }
        Effect::ArmTimer(name, duration) => inner.arm_timer(name, duration, session),
        Effect::CancelTimer(name) => inner.timers.cancel(name),
    }
}

// ── Bring-up jobs ───────────────────────────────────────────────────────

fn init_audio_job(inner: &Arc<Inner>, session: SessionToken) {
    let sink = Arc::clone(inner) as Arc<dyn FrameSink>;
    match inner
        .adapters
        .capture
        .open(session, sink, inner.events.clone())
    {
        Ok(mut stream) => {
            let live = inner.machine.lock().session == Some(session);
            if live {
                inner.slots.lock().capture = Some(stream);
                inner
                    .events
                    .post(Event::for_session(EventKind::AudioReady, session));
            } else {
                // The session moved on while the device opened.
                debug!(session = %session, "disposing capture for superseded session");
                stream.force_release();
            }
        }
        Err(SottoError::PermissionDenied) => {
            inner
                .events
                .post(Event::for_session(EventKind::MicPermissionDenied, session));
        }
        Err(e) => {
            inner.events.post(
                Event::for_session(EventKind::AudioInitFailed, session)
                    .with_detail(friendly_device_message(&e)),
            );
        }
    }
}

async fn connect_transport_job(inner: &Arc<Inner>, session: SessionToken) {
    let probe = Arc::clone(&inner.adapters.probe);
    let reachable = tokio::task::spawn_blocking(move || probe.network_reachable())
        .await
        .unwrap_or(false);
    if !reachable {
        inner
            .events
            .post(Event::for_session(EventKind::NetworkUnavailable, session));
        return;
    }

    match inner
        .adapters
        .transport
        .connect(session, inner.events.clone())
        .await
    {
        Ok(link) => {
            let live = inner.machine.lock().session == Some(session);
            if live {
                inner.slots.lock().transport = Some(Arc::clone(&link));
                inner
                    .events
                    .post(Event::for_session(EventKind::TransportConnected, session));
            } else {
                debug!(session = %session, "closing transport for superseded session");
                link.close().await;
            }
        }
        Err(SottoError::NetworkUnavailable) => {
            inner
                .events
                .post(Event::for_session(EventKind::NetworkUnavailable, session));
        }
        Err(SottoError::ConnectTimeout) => {
            inner.events.post(
                Event::for_session(EventKind::TransportError, session)
                    .with_detail("Connection timed out."),
            );
        }
        Err(e) => {
            inner.events.post(
                Event::for_session(EventKind::TransportError, session)
                    .with_detail(e.to_string()),
            );
        }
    }
}

// ── Session-scoped tasks ────────────────────────────────────────────────

fn start_capture(inner: &Arc<Inner>, session: Option<SessionToken>) {
    let Some(session) = session else { return };
    let link = inner.slots.lock().transport.clone();
    let Some(link) = link else {
        // Promotion requires a connected transport; a missing link here
        // means it was torn down in between. Let the fault path run.
        warn!(session = %session, "start capture without a transport link");
        return;
    };

    let stop = Arc::new(AtomicBool::new(false));
    let task = tokio::spawn(queue::run_sender(
        Arc::clone(&inner.queue),
        session,
        link,
        inner.events.clone(),
        Arc::clone(&stop),
    ));
    if let Some(prior) = inner.slots.lock().sender.replace(SenderHandle { stop, task }) {
        prior.stop();
    }

    *inner.last_voice.lock() = Instant::now();
    arm_silence_check(inner, session);
}

/// Drain what the sender left behind, then send the last-frame sentinel.
/// Completion posts `QueueFlushed`; any failure leaves completion to the
/// flush timer.
async fn flush_queue_job(inner: &Arc<Inner>, session: SessionToken) {
    let link = inner.slots.lock().transport.clone();
    let Some(link) = link else { return };

    let deadline = Instant::now() + FLUSH_DRAIN_BUDGET;
    loop {
        let frames = inner.queue.drain_matching(session);
        if frames.is_empty() {
            break;
        }
        let mut pcm = Vec::with_capacity(frames.iter().map(|f| f.pcm.len()).sum());
        for frame in &frames {
            pcm.extend_from_slice(&frame.pcm);
        }
        if let Err(e) = link.send_audio(&pcm, false).await {
            warn!(session = %session, error = %e, "flush send failed");
            return;
        }
        if Instant::now() >= deadline {
            warn!(session = %session, "flush drain budget exhausted");
            break;
        }
    }

    match link.send_audio(&[], true).await {
        Ok(()) => {
            debug!(session = %session, "flush complete, last frame sent");
            inner
                .events
                .post(Event::for_session(EventKind::QueueFlushed, session));
        }
        Err(e) => warn!(session = %session, error = %e, "last frame send failed"),
    }
}

/// 1 Hz watchdog comparing `last_voice` against the silence window.
/// Exits when the session ends; expiry posts a stamped `UserStop`.
fn arm_silence_check(inner: &Arc<Inner>, session: SessionToken) {
    let guard = Arc::clone(inner);
    let window = inner.cfg.silence_window;
    let task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(SILENCE_POLL).await;
            let live = {
                let ctx = guard.machine.lock();
                ctx.state == State::Recording && ctx.session == Some(session)
            };
            if !live {
                break;
            }
            let silent_for = guard.last_voice.lock().elapsed();
            if silent_for >= window {
                warn!(
                    session = %session,
                    silent_secs = silent_for.as_secs(),
                    "silence window exceeded, stopping"
                );
                guard
                    .events
                    .post(Event::for_session(EventKind::UserStop, session));
                break;
            }
        }
    });
    inner.timers.register(TimerName::SilenceCheck, task);
}

/// Recurring sweep that releases straggler resources while idle. Armed on
/// every transition into `Idle`; exits as soon as the state moves on.
fn arm_idle_sweep(inner: &Arc<Inner>) {
    let guard = Arc::clone(inner);
    let interval = inner.cfg.idle_sweep;
    let task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if guard.machine.lock().state != State::Idle {
                break;
            }
            debug!("idle sweep");
            guard.release_resources();
        }
    });
    inner.timers.register(TimerName::IdleSweep, task);
}

impl Inner {
    fn check_permissions_job(&self, session: SessionToken) {
        if !self.adapters.probe.accessibility_permission() {
            self.events
                .post(Event::for_session(EventKind::AccessibilityDenied, session));
            return;
        }
        match self.adapters.probe.microphone_permission() {
            PermissionStatus::Granted => self
                .events
                .post(Event::for_session(EventKind::MicPermissionOk, session)),
            PermissionStatus::Denied | PermissionStatus::Undetermined => self
                .events
                .post(Event::for_session(EventKind::MicPermissionDenied, session)),
        }
    }

    fn stop_capture(&self) {
        self.timers.cancel(TimerName::SilenceCheck);
        if let Some(sender) = self.slots.lock().sender.take() {
            sender.stop();
        }
        if let Some(capture) = self.slots.lock().capture.as_mut() {
            capture.stop();
        }
    }

    fn close_transport(&self) {
        if let Some(sender) = self.slots.lock().sender.take() {
            sender.stop();
        }
        let link = self.slots.lock().transport.take();
        if let Some(link) = link {
            tokio::spawn(async move { link.close().await });
        }
    }

    fn release_resources(&self) {
        self.stop_capture();
        self.close_transport();
        let capture = self.slots.lock().capture.take();
        if let Some(mut capture) = capture {
            // force_release joins the capture worker; keep it off this task.
            tokio::task::spawn_blocking(move || capture.force_release());
        }
        let cleared = self.queue.clear();
        if cleared > 0 {
            debug!(cleared, "audio queue cleared");
        }
    }

    fn arm_timer(&self, name: TimerName, duration: Duration, session: Option<SessionToken>) {
        let event = match name {
            TimerName::ArmingTimeout => {
                session.map(|s| Event::for_session(EventKind::ArmingTimeout, s))
            }
            TimerName::FlushTimeout => {
                session.map(|s| Event::for_session(EventKind::FlushTimeout, s))
            }
            TimerName::ErrorRecover => Some(match session {
                Some(s) => Event::for_session(EventKind::AutoRecover, s),
                None => Event::new(EventKind::AutoRecover),
            }),
            // Guard timers are armed by the runtime, not the machine.
            TimerName::SilenceCheck | TimerName::IdleSweep => None,
        };
        let Some(event) = event else { return };

        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            events.post(event);
        });
        self.timers.register(name, task);
    }

    fn on_asr_result(&self, session: SessionToken, result: AsrResult) {
        let (display, state) = {
            let mut ctx = self.machine.lock();
            if ctx.session != Some(session) {
                return;
            }
            if result.is_final {
                ctx.committed_text.push_str(&result.text);
                ctx.current_text.clear();
            } else {
                ctx.current_text = result.text.clone();
            }
            (ctx.full_text(), ctx.state)
        };

        let _ = self.ui_tx.send(UiEvent::Transcript {
            text: display,
            is_final: result.is_final,
        });

        // A final while flushing means the server is done with us.
        if state == State::Stopping && result.is_final {
            self.events
                .post(Event::for_session(EventKind::QueueFlushed, session));
        }
    }

    fn quit(&self) {
        self.timers.cancel_all();
        self.adapters.probe.unsubscribe();
        self.release_resources();
        info!("coordinator stopped");
    }
}

/// Capture frames land here, on the capture worker thread. Short lock, a
/// queue push and an RMS probe — nothing that can stall the worker.
impl FrameSink for Inner {
    fn frame(&self, frame: AudioFrame) {
        let (session, state) = {
            let ctx = self.machine.lock();
            (ctx.session, ctx.state)
        };
        if session != Some(frame.session) {
            return;
        }
        match state {
            // Pre-roll: frames captured while bring-up finishes are kept so
            // the first syllable is not clipped.
            State::Arming => self.queue.push(frame),
            State::Recording => {
                if rms_i16(&frame.pcm) > self.cfg.silence_threshold as f64 {
                    *self.last_voice.lock() = Instant::now();
                }
                self.queue.push(frame);
            }
            _ => {}
        }
    }
}

/// Root-mean-square of little-endian int16 PCM.
fn rms_i16(pcm: &[u8]) -> f64 {
    let mut sum = 0f64;
    let mut count = 0usize;
    for chunk in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64;
        sum += sample * sample;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::rms_i16;

    fn pcm_of(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms_i16(&pcm_of(&[0; 160])), 0.0);
        assert_eq!(rms_i16(&[]), 0.0);
    }

    #[test]
    fn rms_of_square_wave_is_its_amplitude() {
        let samples: Vec<i16> = (0..160)
            .map(|i| if i % 2 == 0 { 1000 } else { -1000 })
            .collect();
        let rms = rms_i16(&pcm_of(&samples));
        assert!((rms - 1000.0).abs() < 1e-6, "rms={rms}");
    }

    #[test]
    fn quiet_signal_stays_under_default_threshold() {
        let samples: Vec<i16> = (0..160).map(|i| if i % 2 == 0 { 80 } else { -80 }).collect();
        assert!(rms_i16(&pcm_of(&samples)) < 500.0);
    }
}
