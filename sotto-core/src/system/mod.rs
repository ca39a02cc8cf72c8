//! Host-system probes: permissions, reachability, notifications.
//!
//! Probe callbacks run on arbitrary threads; implementations post events to
//! the coordinator queue, they never call into it directly. Notification
//! events carry no session token — they apply to whatever session is live.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::coordinator::EventSender;
use crate::machine::{Event, EventKind};

/// Outcome of a permission check, after any platform prompt has resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
    /// The platform could not answer (no gate, or the check itself failed).
    Undetermined,
}

pub trait SystemProbe: Send + Sync + 'static {
    /// Microphone permission, prompting first if the platform supports it.
    fn microphone_permission(&self) -> PermissionStatus;

    /// Accessibility permission (gates synthetic paste injection).
    fn accessibility_permission(&self) -> bool;

    /// Quick connectivity check: true when any probe host answers a TCP
    /// connect within 500 ms.
    fn network_reachable(&self) -> bool;

    /// Start posting `SystemWillSleep` / `SystemDidWake` /
    /// `DefaultInputChanged` to the coordinator queue.
    fn subscribe(&self, events: EventSender);

    /// Stop the notifier started by [`subscribe`](Self::subscribe).
    fn unsubscribe(&self);
}

pub const REACHABILITY_TIMEOUT: Duration = Duration::from_millis(500);

/// How often the default input device name is re-checked.
const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Portable probe implementation.
///
/// Device hot-swap is detected by polling the default input device name.
/// Platforms without a permission gate report granted — the capture open
/// path still translates hard permission failures into events. Sleep/wake
/// notifications are OS-specific; hosts with access to them post the events
/// themselves.
pub struct DesktopProbe {
    hosts: Vec<(String, u16)>,
    stop: Arc<AtomicBool>,
}

impl DesktopProbe {
    pub fn new(hosts: Vec<(String, u16)>) -> Self {
        Self {
            hosts,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Probe the recognizer endpoint's host first, then a well-known DNS
    /// host so captive networks still count as "up".
    pub fn for_endpoint(endpoint: &str) -> Self {
        let mut hosts = Vec::new();
        if let Some(host) = host_of(endpoint) {
            hosts.push((host, 443));
        }
        hosts.push(("223.5.5.5".into(), 53));
        hosts.push(("1.1.1.1".into(), 53));
        Self::new(hosts)
    }
}

impl Drop for DesktopProbe {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl SystemProbe for DesktopProbe {
    fn microphone_permission(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    fn accessibility_permission(&self) -> bool {
        true
    }

    fn network_reachable(&self) -> bool {
        self.hosts
            .iter()
            .any(|(host, port)| reachable(host, *port, REACHABILITY_TIMEOUT))
    }

    fn subscribe(&self, events: EventSender) {
        let stop = Arc::clone(&self.stop);
        let spawned = thread::Builder::new()
            .name("sotto-device-watch".into())
            .spawn(move || {
                let mut last = default_input_name();
                while !stop.load(Ordering::Acquire) {
                    thread::sleep(DEVICE_POLL_INTERVAL);
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let current = default_input_name();
                    if current != last {
                        debug!(from = ?last, to = ?current, "default input changed");
                        last = current;
                        events.post(Event::new(EventKind::DefaultInputChanged));
                    }
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to start device watcher");
        }
    }

    fn unsubscribe(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

fn host_of(endpoint: &str) -> Option<String> {
    let rest = endpoint.split("://").nth(1)?;
    let authority = rest.split('/').next()?;
    let host = authority.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

fn reachable(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            return true;
        }
    }
    false
}

#[cfg(feature = "audio-cpal")]
fn default_input_name() -> Option<String> {
    use cpal::traits::{DeviceTrait, HostTrait};
    cpal::default_host()
        .default_input_device()
        .and_then(|d| d.name().ok())
}

#[cfg(not(feature = "audio-cpal"))]
fn default_input_name() -> Option<String> {
    None
}
