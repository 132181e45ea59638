//! Frame-accurate timecode arithmetic.
//!
//! Converts frame counts to `HH:MM:SS:FF` timecode strings, including
//! drop-frame handling for 29.97 and 59.94 fps material. Drop-frame
//! timecode skips frame *numbers* (not frames) at minute boundaries so the
//! displayed clock stays aligned with wall time; the skipped numbers are
//! re-inserted every tenth minute.
//!
//! All conversions are total: negative inputs clamp to zero and nonsensical
//! frame rates fall back to a rate of 1 rather than panicking.

/// Returns true when `fps` calls for drop-frame timecode (29.97 or 59.94).
#[must_use]
pub fn requires_drop_frame(fps: f64) -> bool {
    (fps - 29.97).abs() < 0.01 || (fps - 59.94).abs() < 0.01
}

/// Converts a frame count to a timecode string.
///
/// Non-drop rates use a `:` separator before the frame field, drop-frame
/// rates use `;`. Negative inputs clamp to zero.
#[must_use]
pub fn frames_to_timecode(total_frames: i64, fps: f64) -> String {
    let total = total_frames.max(0) as u64;
    if requires_drop_frame(fps) {
        drop_frame_timecode(total, fps)
    } else {
        non_drop_timecode(total, nominal_rate(fps))
    }
}

/// Converts a millisecond duration to a non-drop timecode string.
///
/// This is the vMix path: vMix reports elapsed milliseconds, which are
/// floored to whole frames and rendered non-drop regardless of rate.
#[must_use]
pub fn milliseconds_to_timecode(ms: i64, fps: f64) -> String {
    let ms = ms.max(0) as f64;
    let total_frames = (ms * fps / 1000.0).floor() as u64;
    non_drop_timecode(total_frames, nominal_rate(fps))
}

/// Parses a timecode string back to a frame count.
///
/// Accepts both separators before the frame field; the drop-frame
/// adjustment is applied when `fps` requires it. Returns `None` for
/// strings that do not match `HH:MM:SS[:;]FF`.
#[must_use]
pub fn timecode_to_frames(timecode: &str, fps: f64) -> Option<i64> {
    let fields = split_timecode(timecode)?;
    let [hours, minutes, seconds, frames] = fields;
    let rate = nominal_rate(fps) as i64;
    let total_minutes = hours * 60 + minutes;
    let nominal = ((total_minutes * 60) + seconds) * rate + frames;
    if requires_drop_frame(fps) {
        let dropped_per_minute = if fps > 30.0 { 4 } else { 2 };
        // Every minute drops, except each tenth.
        let dropped = dropped_per_minute * (total_minutes - total_minutes / 10);
        Some(nominal - dropped)
    } else {
        Some(nominal)
    }
}

/// Rounded integer frame rate, guarded against degenerate inputs.
fn nominal_rate(fps: f64) -> u64 {
    let rate = fps.round();
    if rate < 1.0 {
        1
    } else {
        rate as u64
    }
}

fn non_drop_timecode(total_frames: u64, rate: u64) -> String {
    let frames = total_frames % rate;
    let total_seconds = total_frames / rate;
    let seconds = total_seconds % 60;
    let total_minutes = total_seconds / 60;
    let minutes = total_minutes % 60;
    let hours = total_minutes / 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}:{frames:02}")
}

/// Drop-frame conversion (SMPTE 12M).
///
/// Frame numbers are re-mapped by adding back the numbers skipped at each
/// minute boundary: `D` per dropped minute (2 at 29.97, 4 at 59.94), nine
/// dropped minutes per ten-minute block.
fn drop_frame_timecode(total_frames: u64, fps: f64) -> String {
    let dropped_per_minute: u64 = if fps > 30.0 { 4 } else { 2 };
    let rate = nominal_rate(fps);
    // Real frames elapsed in ten minutes / in one dropped minute.
    let frames_per_10min = (fps * 600.0).round() as u64;
    let frames_per_min = rate * 60 - dropped_per_minute;

    let blocks = total_frames / frames_per_10min;
    let into_block = total_frames % frames_per_10min;

    // The first minute of each block keeps all its numbers; the remaining
    // nine each skip `dropped_per_minute`.
    let mut adjusted = total_frames + dropped_per_minute * 9 * blocks;
    if into_block > dropped_per_minute {
        adjusted += dropped_per_minute * ((into_block - dropped_per_minute) / frames_per_min);
    }

    let frames = adjusted % rate;
    let total_seconds = adjusted / rate;
    let seconds = total_seconds % 60;
    let total_minutes = total_seconds / 60;
    let minutes = total_minutes % 60;
    let hours = total_minutes / 60;
    format!("{hours:02}:{minutes:02}:{seconds:02};{frames:02}")
}

fn split_timecode(timecode: &str) -> Option<[i64; 4]> {
    let bytes = timecode.as_bytes();
    if bytes.len() != 11 {
        return None;
    }
    if bytes[2] != b':' || bytes[5] != b':' || (bytes[8] != b':' && bytes[8] != b';') {
        return None;
    }
    let field = |range: std::ops::Range<usize>| -> Option<i64> {
        let s = timecode.get(range)?;
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse().ok()
    };
    Some([field(0..2)?, field(3..5)?, field(6..8)?, field(9..11)?])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_drop_frame_rates() {
        assert!(requires_drop_frame(29.97));
        assert!(requires_drop_frame(59.94));
        assert!(!requires_drop_frame(25.0));
        assert!(!requires_drop_frame(30.0));
        assert!(!requires_drop_frame(60.0));
    }

    #[test]
    fn non_drop_conversion() {
        assert_eq!(frames_to_timecode(0, 25.0), "00:00:00:00");
        assert_eq!(frames_to_timecode(3725, 25.0), "00:02:29:00");
        assert_eq!(frames_to_timecode(24, 25.0), "00:00:00:24");
        assert_eq!(frames_to_timecode(25, 25.0), "00:00:01:00");
        assert_eq!(frames_to_timecode(50 * 3600, 50.0), "01:00:00:00");
    }

    #[test]
    fn drop_frame_minute_boundary() {
        // First minute boundary at 29.97: two frame numbers skipped.
        assert_eq!(frames_to_timecode(1800, 29.97), "00:01:00;02");
        // Last frame before the boundary is untouched.
        assert_eq!(frames_to_timecode(1799, 29.97), "00:00:59;29");
    }

    #[test]
    fn drop_frame_tenth_minute_keeps_numbers() {
        // 17982 real frames = exactly ten minutes at 29.97; the tenth
        // minute does not drop, so the clock lands on :00;00.
        assert_eq!(frames_to_timecode(17982, 29.97), "00:10:00;00");
        assert_eq!(frames_to_timecode(17981, 29.97), "00:09:59;29");
    }

    #[test]
    fn drop_frame_5994_skips_four() {
        assert_eq!(frames_to_timecode(3600, 59.94), "00:01:00;04");
        assert_eq!(frames_to_timecode(3599, 59.94), "00:00:59;59");
    }

    #[test]
    fn negative_input_clamps_to_zero() {
        assert_eq!(frames_to_timecode(-1, 25.0), "00:00:00:00");
        assert_eq!(frames_to_timecode(-500, 29.97), "00:00:00;00");
        assert_eq!(milliseconds_to_timecode(-100, 50.0), "00:00:00:00");
    }

    #[test]
    fn degenerate_rate_does_not_panic() {
        assert_eq!(frames_to_timecode(5, 0.0), "00:00:05:00");
    }

    #[test]
    fn output_always_matches_timecode_shape() {
        let re = regex::Regex::new(r"^\d{2}:\d{2}:\d{2}[:;]\d{2}$").unwrap();
        for fps in [24.0, 25.0, 29.97, 30.0, 50.0, 59.94, 60.0] {
            for frames in [0i64, 1, 999, 17981, 17982, 86400 * 30] {
                assert!(re.is_match(&frames_to_timecode(frames, fps)));
            }
        }
    }

    #[test]
    fn milliseconds_conversion_is_non_drop() {
        assert_eq!(milliseconds_to_timecode(60_000, 50.0), "00:01:00:00");
        assert_eq!(milliseconds_to_timecode(1_000, 25.0), "00:00:01:00");
        // Even at a drop-frame rate the vMix path renders non-drop.
        assert_eq!(milliseconds_to_timecode(1_000, 29.97), "00:00:00:29");
    }

    #[test]
    fn round_trips_non_drop_rates() {
        for fps in [24.0, 25.0, 30.0, 50.0, 60.0] {
            let rate = fps as i64;
            // Sampling the day keeps the test fast; boundaries are the
            // interesting points.
            for f in (0..24 * 3600 * rate).step_by(997) {
                let tc = frames_to_timecode(f, fps);
                assert_eq!(timecode_to_frames(&tc, fps), Some(f), "fps={fps} f={f}");
            }
        }
    }

    #[test]
    fn round_trips_drop_frame_boundaries() {
        for f in [0i64, 1799, 1800, 3597, 3598, 17981, 17982, 17983, 107_892] {
            let tc = frames_to_timecode(f, 29.97);
            assert_eq!(timecode_to_frames(&tc, 29.97), Some(f), "f={f}");
        }
    }

    #[test]
    fn rejects_malformed_timecode_strings() {
        assert_eq!(timecode_to_frames("", 25.0), None);
        assert_eq!(timecode_to_frames("1:2:3:4", 25.0), None);
        assert_eq!(timecode_to_frames("aa:bb:cc:dd", 25.0), None);
        assert_eq!(timecode_to_frames("00:00:00.00", 25.0), None);
    }
}
