// crates/tapecut-core/src/helpers/time.rs
//
// Seconds to microseconds conversion and human-readable durations.
//
// The engine speaks seconds (f64) at its public surface and microseconds
// (FFmpeg's AV_TIME_BASE) when it seeks. Conversions truncate toward zero,
// matching how trim points have always been turned into seek targets.

pub const MICROS_PER_SEC: i64 = 1_000_000;

/// ```
/// use tapecut_core::helpers::time::secs_to_micros;
/// assert_eq!(secs_to_micros(30.0), 30_000_000);
/// assert_eq!(secs_to_micros(0.0000015), 1);
/// ```
pub fn secs_to_micros(secs: f64) -> i64 {
    (secs * MICROS_PER_SEC as f64) as i64
}

/// Fraction of `[start, end]` covered at `t`, clamped to `[0, 1]`.
///
/// A degenerate range reports 0.
///
/// ```
/// use tapecut_core::helpers::time::range_fraction;
/// assert_eq!(range_fraction(30.0, 45.0, 37.5), 0.5);
/// assert_eq!(range_fraction(30.0, 45.0, 10.0), 0.0);
/// assert_eq!(range_fraction(30.0, 45.0, 99.0), 1.0);
/// ```
pub fn range_fraction(start: f64, end: f64, t: f64) -> f64 {
    let span = end - start;
    if !(span > 0.0) || !t.is_finite() {
        return 0.0;
    }
    ((t - start) / span).clamp(0.0, 1.0)
}

/// Format a duration in seconds as a compact human-readable string.
///
/// | Range         | Format       | Example   |
/// |---------------|--------------|-----------|
/// | ≥ 3600 s      | `H:MM:SS`    | `1:04:35` |
/// | ≥ 60 s        | `M:SS`       | `3:07`    |
/// | < 60 s        | `S.Xs`       | `4.2s`    |
///
/// ```
/// use tapecut_core::helpers::time::format_duration;
/// assert_eq!(format_duration(4.2),    "4.2s");
/// assert_eq!(format_duration(187.0),  "3:07");
/// assert_eq!(format_duration(3875.0), "1:04:35");
/// ```
pub fn format_duration(secs: f64) -> String {
    if secs >= 3600.0 {
        format!(
            "{}:{:02}:{:02}",
            secs as u64 / 3600,
            (secs as u64 % 3600) / 60,
            secs as u64 % 60,
        )
    } else if secs >= 60.0 {
        format!("{}:{:02}", secs as u64 / 60, secs as u64 % 60)
    } else {
        format!("{secs:.1}s")
    }
}
