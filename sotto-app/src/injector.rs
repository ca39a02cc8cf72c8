//! Clipboard-paste transcript injection.
//!
//! Raw key-event synthesis mangles combining characters and IME languages;
//! pasting does not. The sink therefore:
//!
//! 1. saves the current clipboard text,
//! 2. puts the transcript on the clipboard,
//! 3. sends the platform paste chord (⌘V / Ctrl+V),
//! 4. restores the original clipboard after a short delay.
//!
//! `Enigo` and `arboard::Clipboard` are not `Send` on every platform, so all
//! injection work happens on one dedicated thread; [`PasteSink::commit`]
//! only enqueues.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use arboard::Clipboard;
use enigo::{Direction, Enigo, Key, Keyboard, Settings};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use sotto_core::OutputSink;

/// Give the focused app time to read the clipboard before it is restored.
const RESTORE_DELAY: Duration = Duration::from_millis(120);

/// Small gap between setting the clipboard and sending the chord.
const PASTE_DELAY: Duration = Duration::from_millis(30);

pub struct PasteSink {
    tx: mpsc::UnboundedSender<String>,
}

impl PasteSink {
    /// Spawn the injection thread.
    pub fn spawn() -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        thread::Builder::new()
            .name("sotto-inject".into())
            .spawn(move || {
                while let Some(text) = rx.blocking_recv() {
                    if let Err(e) = inject(&text) {
                        warn!(error = %e, "transcript injection failed");
                    }
                }
            })
            .context("failed to spawn injection thread")?;
        Ok(Self { tx })
    }
}

impl OutputSink for PasteSink {
    fn commit(&self, text: &str) {
        if text.is_empty() {
            debug!("empty transcript, nothing to inject");
            return;
        }
        let _ = self.tx.send(text.to_string());
    }
}

fn inject(text: &str) -> Result<()> {
    let mut clipboard = Clipboard::new().context("cannot open clipboard")?;
    // Err means empty or non-text content; either way there is nothing to
    // put back afterwards.
    let previous = clipboard.get_text().ok();

    clipboard
        .set_text(text)
        .context("cannot set clipboard text")?;
    thread::sleep(PASTE_DELAY);

    simulate_paste()?;

    thread::sleep(RESTORE_DELAY);
    if let Some(previous) = previous {
        clipboard
            .set_text(previous)
            .context("cannot restore clipboard")?;
    }
    debug!(chars = text.chars().count(), "transcript injected");
    Ok(())
}

/// Send the OS paste shortcut to the focused window.
///
/// A fresh `Enigo` per call: the handle is cheap and not `Send`.
fn simulate_paste() -> Result<()> {
    let mut enigo = Enigo::new(&Settings::default()).context("enigo init")?;

    #[cfg(target_os = "macos")]
    let modifier = Key::Meta;
    #[cfg(not(target_os = "macos"))]
    let modifier = Key::Control;

    enigo.key(modifier, Direction::Press).context("modifier press")?;
    enigo
        .key(Key::Unicode('v'), Direction::Click)
        .context("paste key")?;
    enigo
        .key(modifier, Direction::Release)
        .context("modifier release")?;
    Ok(())
}
