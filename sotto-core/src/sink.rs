//! Transcript destination.

/// Receives the finalized transcript of a session.
///
/// `commit` is invoked from the coordinator task, exactly once per session,
/// on the transition out of the flush phase — possibly with empty text when
/// nothing was recognized. Injection mechanics (clipboard paste, synthetic
/// keystrokes) vary by host; implementations marshal onto their UI/main
/// thread as needed and do not report back.
pub trait OutputSink: Send + Sync + 'static {
    fn commit(&self, text: &str);
}
