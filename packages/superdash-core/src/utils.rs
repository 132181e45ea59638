//! General utilities shared across the application.

use std::sync::OnceLock;
use std::time::Instant;

// ─────────────────────────────────────────────────────────────────────────────
// Monotonic Time
// ─────────────────────────────────────────────────────────────────────────────

/// Process-wide monotonic origin, captured on first use.
static MONOTONIC_ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Returns milliseconds elapsed since the process-wide monotonic origin.
///
/// Used for the `updated` field on device states and for broadcast
/// timestamps. Immune to wall-clock steps (NTP), which is required for
/// operators to detect stale devices reliably.
#[must_use]
pub fn monotonic_millis() -> u64 {
    MONOTONIC_ORIGIN.get_or_init(Instant::now).elapsed().as_millis() as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Path Handling
// ─────────────────────────────────────────────────────────────────────────────

/// Strips any directory prefix from a clip path, returning the basename.
///
/// Device protocols report paths with either separator (`clips/show.mov`,
/// `MEDIA\\promo.mxf`); operator displays only want the file name.
#[must_use]
pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_millis_is_non_decreasing() {
        let a = monotonic_millis();
        let b = monotonic_millis();
        assert!(b >= a);
    }

    #[test]
    fn basename_strips_forward_slashes() {
        assert_eq!(basename("clips/show.mov"), "show.mov");
        assert_eq!(basename("a/b/c/clip.mxf"), "clip.mxf");
    }

    #[test]
    fn basename_strips_backslashes() {
        assert_eq!(basename("MEDIA\\promo.mxf"), "promo.mxf");
    }

    #[test]
    fn basename_passes_through_bare_names() {
        assert_eq!(basename("clip.mov"), "clip.mov");
        assert_eq!(basename(""), "");
    }
}
