// crates/tapecut-core/src/helpers/geometry.rs
//
// Frame-size arithmetic shared by the preview path and the encoder.
//
// Previews are drawn into a fixed box (480×270 by default) whatever the
// source shape is, so a 4:3 VHS capture is pillarboxed and a 16:9 capture
// fills the box. Encoders that emit YUV420P need even dimensions.

/// Largest `(w, h)` with the source aspect ratio that fits in `(max_w, max_h)`.
///
/// Never returns a zero dimension.
///
/// ```
/// use tapecut_core::helpers::geometry::fit_within;
/// assert_eq!(fit_within(1920, 1080, 480, 270), (480, 270));
/// assert_eq!(fit_within(640, 480, 480, 270),   (360, 270));
/// ```
pub fn fit_within(src_w: u32, src_h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if src_w == 0 || src_h == 0 {
        return (max_w.max(1), max_h.max(1));
    }
    let scale = (max_w as f64 / src_w as f64).min(max_h as f64 / src_h as f64);
    let w = ((src_w as f64 * scale).round() as u32).clamp(1, max_w.max(1));
    let h = ((src_h as f64 * scale).round() as u32).clamp(1, max_h.max(1));
    (w, h)
}

/// Top-left offset that centres a `(w, h)` image inside `(box_w, box_h)`.
pub fn center_offset(w: u32, h: u32, box_w: u32, box_h: u32) -> (u32, u32) {
    (box_w.saturating_sub(w) / 2, box_h.saturating_sub(h) / 2)
}

/// Round a dimension down to the nearest even value, minimum 2.
///
/// ```
/// use tapecut_core::helpers::geometry::even_dimension;
/// assert_eq!(even_dimension(719), 718);
/// assert_eq!(even_dimension(1),   2);
/// ```
pub fn even_dimension(v: u32) -> u32 {
    (v & !1).max(2)
}
