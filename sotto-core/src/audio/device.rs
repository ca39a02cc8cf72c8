//! Input device ranking.
//!
//! Capture falls back across input devices in descending priority. External
//! microphones (headsets, USB, bluetooth) rank above the default, which
//! ranks above built-in hardware — a user who plugs in a headset almost
//! always wants dictation to use it.

const EXTERNAL_KEYWORDS: &[&str] = &[
    "airpods",
    "headphone",
    "headset",
    "earphone",
    "earbud",
    "usb",
    "external",
    "bluetooth",
];

const BUILTIN_KEYWORDS: &[&str] = &["built-in", "internal", "macbook"];

/// Priority score for a device name. Higher is tried first.
pub fn device_priority(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    if EXTERNAL_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return 100;
    }
    if BUILTIN_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return 10;
    }
    50
}

/// Order a `(name, is_default)` device list for open attempts: priority
/// descending, the system default winning ties, then name for stability.
pub fn sort_for_fallback<T>(devices: &mut [(String, bool, T)]) {
    devices.sort_by(|a, b| {
        device_priority(&b.0)
            .cmp(&device_priority(&a.0))
            .then(b.1.cmp(&a.1))
            .then(a.0.cmp(&b.0))
    });
}
