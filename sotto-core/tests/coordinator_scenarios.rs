//! End-to-end coordinator scenarios driven through scripted fake adapters.
//!
//! The fakes stand in for the microphone, the recognizer connection and the
//! host system; the coordinator under test is the real thing, running on a
//! real Tokio runtime with shortened timeouts.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use sotto_core::audio::{AudioFrame, CaptureBackend, CaptureStream, FrameSink};
use sotto_core::coordinator::{Adapters, Coordinator, EventSender, UiEvent};
use sotto_core::error::Result;
use sotto_core::machine::{Event, EventKind, State};
use sotto_core::system::{PermissionStatus, SystemProbe};
use sotto_core::transport::{AsrResult, TransportFactory, TransportLink};
use sotto_core::{CoordinatorConfig, OutputSink, SessionToken, SottoError};

// ── Fake capture ────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
enum OpenOutcome {
    Succeed,
    PermissionDenied,
    DeviceMissing,
}

struct CaptureShared {
    sink: Mutex<Option<(SessionToken, Arc<dyn FrameSink>)>>,
    outcome: Mutex<OpenOutcome>,
    opens: AtomicUsize,
    stops: AtomicUsize,
    releases: AtomicUsize,
}

struct FakeCapture {
    shared: Arc<CaptureShared>,
}

impl FakeCapture {
    fn new(outcome: OpenOutcome) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(CaptureShared {
                sink: Mutex::new(None),
                outcome: Mutex::new(outcome),
                opens: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
            }),
        })
    }

    fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    fn releases(&self) -> usize {
        self.shared.releases.load(Ordering::SeqCst)
    }

    /// Emit a frame stamped with an arbitrary session (stale-frame tests).
    fn emit_with(&self, session: SessionToken, pcm: Vec<u8>) {
        let sink = self.shared.sink.lock().as_ref().map(|(_, s)| Arc::clone(s));
        if let Some(sink) = sink {
            sink.frame(AudioFrame {
                session,
                pcm,
                captured_at: Instant::now(),
            });
        }
    }

    /// Emit a frame stamped with the session of the latest open.
    fn emit(&self, pcm: Vec<u8>) {
        let session = self.shared.sink.lock().as_ref().map(|(s, _)| *s);
        if let Some(session) = session {
            self.emit_with(session, pcm);
        }
    }
}

struct FakeStream {
    shared: Arc<CaptureShared>,
}

impl CaptureStream for FakeStream {
    fn stop(&mut self) {
        self.shared.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn force_release(&mut self) {
        self.shared.releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl CaptureBackend for FakeCapture {
    fn open(
        &self,
        session: SessionToken,
        sink: Arc<dyn FrameSink>,
        _events: EventSender,
    ) -> Result<Box<dyn CaptureStream>> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        match *self.shared.outcome.lock() {
            OpenOutcome::PermissionDenied => return Err(SottoError::PermissionDenied),
            OpenOutcome::DeviceMissing => return Err(SottoError::NoInputDevice),
            OpenOutcome::Succeed => {}
        }
        *self.shared.sink.lock() = Some((session, sink));
        Ok(Box::new(FakeStream {
            shared: Arc::clone(&self.shared),
        }))
    }
}

// ── Fake transport ──────────────────────────────────────────────────────

#[derive(Default)]
struct TransportState {
    session: Option<SessionToken>,
    events: Option<EventSender>,
    sends: Vec<(usize, bool)>,
    connects: usize,
    closes: usize,
    fail_connect: bool,
    fail_send: bool,
    connect_delay: Duration,
}

struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(TransportState::default())),
        })
    }

    fn connects(&self) -> usize {
        self.state.lock().connects
    }

    fn closes(&self) -> usize {
        self.state.lock().closes
    }

    fn sends(&self) -> Vec<(usize, bool)> {
        self.state.lock().sends.clone()
    }

    fn set_fail_send(&self, fail: bool) {
        self.state.lock().fail_send = fail;
    }

    fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Deliver a recognition result for the connected session.
    fn emit_result(&self, text: &str, is_final: bool) {
        let (events, session) = {
            let state = self.state.lock();
            (state.events.clone(), state.session)
        };
        if let (Some(events), Some(session)) = (events, session) {
            events.post_asr(
                session,
                AsrResult {
                    text: text.into(),
                    is_final,
                },
            );
        }
    }
}

struct FakeLink {
    state: Arc<Mutex<TransportState>>,
}

#[async_trait]
impl TransportLink for FakeLink {
    async fn send_audio(&self, pcm: &[u8], is_last: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_send {
            return Err(SottoError::Transport("scripted send failure".into()));
        }
        state.sends.push((pcm.len(), is_last));
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().closes += 1;
    }
}

#[async_trait]
impl TransportFactory for FakeTransport {
    async fn connect(
        &self,
        session: SessionToken,
        events: EventSender,
    ) -> Result<Arc<dyn TransportLink>> {
        let delay = self.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let mut state = self.state.lock();
            state.connects += 1;
            if state.fail_connect {
                return Err(SottoError::Transport("scripted connect failure".into()));
            }
            state.session = Some(session);
            state.events = Some(events);
        }
        Ok(Arc::new(FakeLink {
            state: Arc::clone(&self.state),
        }))
    }
}

// ── Fake probe ──────────────────────────────────────────────────────────

struct FakeProbe {
    mic: Mutex<PermissionStatus>,
    accessibility: AtomicBool,
    network: AtomicBool,
    check_delay: Mutex<Duration>,
}

impl FakeProbe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mic: Mutex::new(PermissionStatus::Granted),
            accessibility: AtomicBool::new(true),
            network: AtomicBool::new(true),
            check_delay: Mutex::new(Duration::ZERO),
        })
    }

    fn set_mic(&self, status: PermissionStatus) {
        *self.mic.lock() = status;
    }

    fn set_check_delay(&self, delay: Duration) {
        *self.check_delay.lock() = delay;
    }
}

impl SystemProbe for FakeProbe {
    fn microphone_permission(&self) -> PermissionStatus {
        let delay = *self.check_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        *self.mic.lock()
    }

    fn accessibility_permission(&self) -> bool {
        self.accessibility.load(Ordering::SeqCst)
    }

    fn network_reachable(&self) -> bool {
        self.network.load(Ordering::SeqCst)
    }

    fn subscribe(&self, _events: EventSender) {}

    fn unsubscribe(&self) {}
}

// ── Fake sink ───────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeSink {
    commits: Mutex<Vec<String>>,
}

impl OutputSink for FakeSink {
    fn commit(&self, text: &str) {
        self.commits.lock().push(text.to_string());
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    coordinator: Coordinator,
    capture: Arc<FakeCapture>,
    transport: Arc<FakeTransport>,
    probe: Arc<FakeProbe>,
    sink: Arc<FakeSink>,
    ui: Arc<Mutex<Vec<UiEvent>>>,
}

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        arming_timeout: Duration::from_millis(300),
        flush_timeout_stop: Duration::from_millis(200),
        flush_timeout_fault: Duration::from_millis(120),
        silence_window: Duration::from_millis(200),
        error_recover: Duration::from_millis(150),
        ..CoordinatorConfig::default()
    }
}

impl Harness {
    fn spawn(cfg: CoordinatorConfig) -> Self {
        let capture = FakeCapture::new(OpenOutcome::Succeed);
        let transport = FakeTransport::new();
        let probe = FakeProbe::new();
        let sink = Arc::new(FakeSink::default());

        let coordinator = Coordinator::spawn(
            cfg,
            Adapters {
                capture: Arc::clone(&capture) as Arc<dyn CaptureBackend>,
                transport: Arc::clone(&transport) as Arc<dyn TransportFactory>,
                probe: Arc::clone(&probe) as Arc<dyn SystemProbe>,
                sink: Arc::clone(&sink) as Arc<dyn OutputSink>,
            },
        );

        let ui = Arc::new(Mutex::new(Vec::new()));
        let mut rx = coordinator.subscribe_ui();
        let ui_log = Arc::clone(&ui);
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                ui_log.lock().push(event);
            }
        });

        Self {
            coordinator,
            capture,
            transport,
            probe,
            sink,
            ui,
        }
    }

    fn spawn_default() -> Self {
        Self::spawn(test_config())
    }

    async fn wait_for_state(&self, wanted: State) {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if self.coordinator.state() == wanted {
                return;
            }
            if Instant::now() > deadline {
                panic!(
                    "timed out waiting for {wanted:?}, still {:?}",
                    self.coordinator.state()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Start and wait until the session is live and recording.
    async fn start_recording(&self) -> SessionToken {
        self.coordinator.user_start();
        self.wait_for_state(State::Recording).await;
        self.coordinator
            .live_session()
            .expect("recording must have a session")
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    fn commits(&self) -> Vec<String> {
        self.sink.commits.lock().clone()
    }

    fn error_banners(&self) -> Vec<String> {
        self.ui
            .lock()
            .iter()
            .filter_map(|e| match e {
                UiEvent::ErrorBanner { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

fn loud_frame_pcm() -> Vec<u8> {
    // ±4000 square wave: RMS 4000, comfortably over the default threshold.
    (0..1600i32)
        .flat_map(|i| {
            let s: i16 = if i % 2 == 0 { 4000 } else { -4000 };
            s.to_le_bytes()
        })
        .collect()
}

// ── Scenarios ───────────────────────────────────────────────────────────

/// S1 — happy path: partials stream in, the final lands before release,
/// exactly one commit, no error banner.
#[tokio::test]
async fn s1_happy_path_commits_final_transcript_once() {
    let h = Harness::spawn_default();
    h.start_recording().await;

    h.capture.emit(loud_frame_pcm());
    h.transport.emit_result("你", false);
    h.transport.emit_result("你好", false);
    h.transport.emit_result("你好。", true);
    h.settle().await;

    h.coordinator.user_stop();
    h.wait_for_state(State::Idle).await;
    h.settle().await;

    assert_eq!(h.commits(), vec!["你好。".to_string()]);
    assert!(h.error_banners().is_empty(), "{:?}", h.error_banners());
    assert!(
        h.transport.sends().iter().any(|(_, is_last)| *is_last),
        "flush must send the last-frame sentinel"
    );
    assert!(h.coordinator.live_session().is_none());
}

/// S2 — fast release while arming: no commit, resources released, late
/// readiness for the abandoned session is dropped.
#[tokio::test]
async fn s2_fast_release_during_arming() {
    let h = Harness::spawn_default();
    h.probe.set_check_delay(Duration::from_millis(150));

    h.coordinator.user_start();
    h.wait_for_state(State::Arming).await;
    let abandoned = h.coordinator.live_session().expect("arming session");

    h.coordinator.user_stop();
    h.wait_for_state(State::Idle).await;
    h.settle().await;

    assert!(h.commits().is_empty(), "cancelled session must not commit");

    // The permission check finishes late; its event must be inert.
    h.coordinator
        .post(Event::for_session(EventKind::MicPermissionOk, abandoned));
    h.coordinator
        .post(Event::for_session(EventKind::TransportConnected, abandoned));
    h.settle().await;
    assert_eq!(h.coordinator.state(), State::Idle);
    assert!(h.coordinator.live_session().is_none());
}

/// S3 — device hot-swap mid-recording: session rotates, adapters are
/// rebuilt, frames stamped with the superseded session never reach the
/// transport.
#[tokio::test]
async fn s3_device_hot_swap_rotates_session() {
    let h = Harness::spawn_default();
    let old = h.start_recording().await;
    assert_eq!(h.transport.connects(), 1);

    h.coordinator.post(Event::new(EventKind::DefaultInputChanged));
    h.wait_for_state(State::Recording).await;
    let new = h.coordinator.live_session().expect("restarted session");
    assert_ne!(old, new, "soft restart must rotate the token");
    assert_eq!(h.capture.opens(), 2);
    assert_eq!(h.transport.connects(), 2);
    assert!(h.transport.closes() >= 1, "old connection must close");

    // A straggler frame from the old capture is discarded at ingest.
    let sends_before = h.transport.sends().len();
    h.capture.emit_with(old, vec![0u8; 320]);
    h.capture.emit(loud_frame_pcm());
    tokio::time::sleep(Duration::from_millis(150)).await;
    let sends = h.transport.sends();
    let new_sends = &sends[sends_before..];
    assert!(
        new_sends.iter().all(|(len, _)| *len != 320),
        "stale-session frame must not be sent: {new_sends:?}"
    );
    assert!(new_sends.iter().any(|(len, _)| *len == 3200));
}

/// S4 — flush timeout: the server never confirms, the partial transcript
/// is committed when the window lapses.
#[tokio::test]
async fn s4_flush_timeout_commits_partials() {
    let h = Harness::spawn_default();
    h.start_recording().await;

    h.transport.emit_result("hello wor", false);
    h.settle().await;

    // Last-frame sentinel fails, so QueueFlushed never arrives.
    h.transport.set_fail_send(true);
    h.coordinator.user_stop();
    h.wait_for_state(State::Idle).await;
    h.settle().await;

    assert_eq!(h.commits(), vec!["hello wor".to_string()]);
}

/// S5 — transport failure mid-stream: short flush, error surfaced,
/// accumulated text still committed.
#[tokio::test]
async fn s5_transport_failure_while_recording() {
    let h = Harness::spawn_default();
    h.start_recording().await;

    h.transport.emit_result("第一句。", true);
    h.settle().await;

    // Next audio send blows up; the sender reports it exactly once.
    h.transport.set_fail_send(true);
    h.capture.emit(loud_frame_pcm());
    h.wait_for_state(State::Idle).await;
    h.settle().await;

    assert_eq!(h.commits(), vec!["第一句。".to_string()]);
    assert!(
        !h.error_banners().is_empty(),
        "transport failure must surface a banner"
    );
}

/// S6 — silence auto-stop: no voice activity, the guard posts the stop and
/// the (empty) transcript is committed through the normal path.
#[tokio::test]
async fn s6_silence_guard_auto_stops() {
    let h = Harness::spawn_default();
    h.start_recording().await;

    // No frames above the threshold ever arrive. The 1 Hz guard fires once
    // the window (200 ms here) has lapsed.
    h.wait_for_state(State::Idle).await;
    h.settle().await;

    assert_eq!(h.commits(), vec![String::new()]);
    assert!(h.coordinator.live_session().is_none());
}

// ── Fault-path scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn arming_times_out_when_connect_hangs() {
    let h = Harness::spawn_default();
    h.transport.set_connect_delay(Duration::from_secs(1));

    h.coordinator.user_start();
    h.wait_for_state(State::Arming).await;
    h.wait_for_state(State::Idle).await;

    assert!(h.commits().is_empty());
    assert!(h
        .error_banners()
        .iter()
        .any(|m| m.contains("timed out")));
}

#[tokio::test]
async fn permission_denial_enters_error_then_auto_recovers() {
    let h = Harness::spawn_default();
    h.probe.set_mic(PermissionStatus::Denied);

    h.coordinator.user_start();
    h.wait_for_state(State::Error).await;
    assert!(h
        .error_banners()
        .iter()
        .any(|m| m.contains("Microphone access")));

    // error_recover is 150 ms in the test config.
    h.wait_for_state(State::Idle).await;
    assert!(h.commits().is_empty());
}

#[tokio::test]
async fn capture_permission_failure_maps_to_mic_denied() {
    let h = Harness::spawn_default();
    *h.capture.shared.outcome.lock() = OpenOutcome::PermissionDenied;

    h.coordinator.user_start();
    h.wait_for_state(State::Error).await;
    assert!(h
        .error_banners()
        .iter()
        .any(|m| m.contains("Microphone access")));
}

#[tokio::test]
async fn capture_open_failure_reports_init_failure() {
    let mut cfg = test_config();
    cfg.error_recover = Duration::from_millis(100);
    let h = Harness::spawn(cfg);
    *h.capture.shared.outcome.lock() = OpenOutcome::DeviceMissing;

    h.coordinator.user_start();
    h.wait_for_state(State::Error).await;
    assert!(h
        .error_banners()
        .iter()
        .any(|m| m.contains("No microphone")));
    h.wait_for_state(State::Idle).await;
}

#[tokio::test]
async fn rapid_start_stop_cycles_stay_consistent() {
    let h = Harness::spawn_default();

    for _ in 0..5 {
        h.coordinator.user_start();
        tokio::time::sleep(Duration::from_millis(15)).await;
        h.coordinator.user_stop();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let deadline = Instant::now() + Duration::from_secs(3);
    while h.coordinator.state() != State::Idle && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.coordinator.state(), State::Idle);
    assert!(h.coordinator.live_session().is_none());

    // One more full cycle must still work after the churn.
    let _session = h.start_recording().await;
    h.transport.emit_result("still alive", true);
    h.settle().await;
    h.coordinator.user_stop();
    h.wait_for_state(State::Idle).await;
    h.settle().await;
    assert_eq!(h.commits().last().map(String::as_str), Some("still alive"));
}

#[tokio::test]
async fn final_result_during_flush_completes_early() {
    let h = Harness::spawn_default();
    h.start_recording().await;

    // Block the sentinel path so only the recognizer can finish the flush.
    h.transport.set_fail_send(true);
    h.coordinator.user_stop();
    h.wait_for_state(State::Stopping).await;

    h.transport.emit_result("早上好。", true);
    h.wait_for_state(State::Idle).await;
    h.settle().await;

    assert_eq!(h.commits(), vec!["早上好。".to_string()]);
}

#[tokio::test]
async fn shutdown_releases_everything() {
    let h = Harness::spawn_default();
    h.start_recording().await;
    h.coordinator.shutdown().await;

    assert!(h.capture.releases() >= 1 || h.capture.shared.stops.load(Ordering::SeqCst) >= 1);
}
