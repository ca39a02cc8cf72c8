//! Global push-to-talk key listener, backed by `rdev`.
//!
//! `rdev::listen` is a blocking OS-level call that never returns; it runs on
//! a dedicated thread. Dropping the [`HotkeyListener`] sets a stop flag so
//! the callback discards further events — the thread itself stays parked in
//! the OS event loop until the process exits, which is fine, it holds no
//! resources.
//!
//! OS key auto-repeat delivers a stream of `KeyPress` events while a key is
//! held; the listener tracks the held state and forwards only the edges.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::mpsc;
use tracing::error;

/// Edge events for the push-to-talk key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyEvent {
    Pressed,
    Released,
}

/// Parse a key name from settings into an [`rdev::Key`].
///
/// Returns `None` for unrecognised names so the caller can surface a
/// configuration error instead of silently listening to nothing.
pub fn parse_key(name: &str) -> Option<rdev::Key> {
    use rdev::Key;
    let key = match name.trim().to_ascii_lowercase().as_str() {
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        "leftalt" | "alt" | "option" => Key::Alt,
        "rightalt" | "altgr" | "rightoption" => Key::AltGr,
        "leftctrl" | "ctrl" | "control" => Key::ControlLeft,
        "rightctrl" => Key::ControlRight,
        "leftmeta" | "meta" | "cmd" | "command" => Key::MetaLeft,
        "rightmeta" | "rightcmd" => Key::MetaRight,
        "capslock" => Key::CapsLock,
        _ => return None,
    };
    Some(key)
}

/// Handle to the running listener thread.
pub struct HotkeyListener {
    stop: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

impl HotkeyListener {
    /// Spawn the listener thread. Press/release edges of `key` are forwarded
    /// on `tx` via `blocking_send` (safe from a plain OS thread).
    pub fn start(key: rdev::Key, tx: mpsc::Sender<HotkeyEvent>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("sotto-hotkey".into())
            .spawn(move || {
                let mut held = false;
                let result = rdev::listen(move |event| {
                    if stop_flag.load(Ordering::Relaxed) {
                        return;
                    }
                    match event.event_type {
                        rdev::EventType::KeyPress(k) if k == key => {
                            // Auto-repeat sends KeyPress continuously; only
                            // the first one is an edge.
                            if !held {
                                held = true;
                                let _ = tx.blocking_send(HotkeyEvent::Pressed);
                            }
                        }
                        rdev::EventType::KeyRelease(k) if k == key => {
                            held = false;
                            let _ = tx.blocking_send(HotkeyEvent::Released);
                        }
                        _ => {}
                    }
                });
                if let Err(e) = result {
                    error!("hotkey listener exited: {e:?}");
                }
            })
            .expect("failed to spawn hotkey listener thread");

        Self {
            stop,
            _thread: thread,
        }
    }
}

impl Drop for HotkeyListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_function_and_modifier_keys() {
        assert_eq!(parse_key("F8"), Some(rdev::Key::F8));
        assert_eq!(parse_key("f12"), Some(rdev::Key::F12));
        assert_eq!(parse_key("RightAlt"), Some(rdev::Key::AltGr));
        assert_eq!(parse_key(" option "), Some(rdev::Key::Alt));
        assert_eq!(parse_key("cmd"), Some(rdev::Key::MetaLeft));
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert_eq!(parse_key("hyper"), None);
        assert_eq!(parse_key(""), None);
    }
}
