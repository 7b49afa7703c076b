//! Letterbox preprocessing and canvas ↔ original coordinate mapping.

use crate::error::{FaceError, Result};
use crate::types::Image;
use ndarray::Array4;

/// Neutral gray used for letterbox padding.
pub const LETTERBOX_FILL: [u8; 3] = [114, 114, 114];

/// Metadata for coordinate de-mapping after a letterbox resize.
///
/// Produced once per preprocessing call and consumed by every unmap in the
/// same request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResizeContext {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub new_width: u32,
    pub new_height: u32,
    pub target_size: u32,
}

impl ResizeContext {
    /// Compute the letterbox geometry for a `width × height` source.
    pub fn new(width: u32, height: u32, target_size: u32) -> Self {
        let scale_w = target_size as f32 / width as f32;
        let scale_h = target_size as f32 / height as f32;
        let scale = scale_w.min(scale_h);

        let new_width = ((width as f32 * scale).round() as u32).clamp(1, target_size);
        let new_height = ((height as f32 * scale).round() as u32).clamp(1, target_size);

        Self {
            scale,
            offset_x: (target_size - new_width) / 2,
            offset_y: (target_size - new_height) / 2,
            new_width,
            new_height,
            target_size,
        }
    }
}

/// Map a canvas point back into original-image space.
pub fn unmap(x: f32, y: f32, ctx: &ResizeContext) -> (f32, f32) {
    (
        (x - ctx.offset_x as f32) / ctx.scale,
        (y - ctx.offset_y as f32) / ctx.scale,
    )
}

/// Map an original-image point onto the letterboxed canvas. Inverse of [`unmap`].
pub fn map(x: f32, y: f32, ctx: &ResizeContext) -> (f32, f32) {
    (
        x * ctx.scale + ctx.offset_x as f32,
        y * ctx.scale + ctx.offset_y as f32,
    )
}

/// Aspect-preserving resize into a `target_size × target_size` canvas.
///
/// The resized content is centered; the border is [`LETTERBOX_FILL`].
pub fn letterbox_resize(image: &Image, target_size: u32) -> Result<(Image, ResizeContext)> {
    if target_size == 0 {
        return Err(FaceError::InvalidInput("letterbox target size must be non-zero".into()));
    }
    if image.width() == 0 || image.height() == 0 {
        return Err(FaceError::InvalidInput(format!(
            "cannot letterbox an empty {}x{} image",
            image.width(),
            image.height()
        )));
    }

    let ctx = ResizeContext::new(image.width(), image.height(), target_size);
    let resized = resize_bilinear(image, ctx.new_width, ctx.new_height);

    let side = target_size as usize;
    let mut canvas = Image::filled(target_size, target_size, LETTERBOX_FILL).into_bgr();
    let row_bytes = ctx.new_width as usize * Image::CHANNELS;
    for y in 0..ctx.new_height as usize {
        let dst = ((y + ctx.offset_y as usize) * side + ctx.offset_x as usize) * Image::CHANNELS;
        let src = y * row_bytes;
        canvas[dst..dst + row_bytes].copy_from_slice(&resized[src..src + row_bytes]);
    }

    tracing::trace!(
        src_w = image.width(),
        src_h = image.height(),
        new_w = ctx.new_width,
        new_h = ctx.new_height,
        scale = ctx.scale,
        offset_x = ctx.offset_x,
        offset_y = ctx.offset_y,
        "letterbox resize"
    );

    Ok((Image::from_bgr(canvas, target_size, target_size)?, ctx))
}

/// Bilinear resize with half-pixel centers, edge-clamped.
fn resize_bilinear(image: &Image, new_w: u32, new_h: u32) -> Vec<u8> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let (new_w, new_h) = (new_w as usize, new_h as usize);
    let frame = image.data();
    let inv_scale_x = width as f32 / new_w as f32;
    let inv_scale_y = height as f32 / new_h as f32;

    let mut resized = vec![0u8; new_w * new_h * Image::CHANNELS];
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            for c in 0..Image::CHANNELS {
                let at = |px: usize, py: usize| frame[(py * width + px) * Image::CHANNELS + c] as f32;
                let val = at(x0, y0) * (1.0 - fx) * (1.0 - fy)
                    + at(x1, y0) * fx * (1.0 - fy)
                    + at(x0, y1) * (1.0 - fx) * fy
                    + at(x1, y1) * fx * fy;
                resized[(y * new_w + x) * Image::CHANNELS + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    resized
}

/// Convert an interleaved BGR image into a planar `{1, 3, H, W}` RGB tensor.
///
/// Channels 0 and 2 are swapped; `mean`/`std` are indexed by output channel.
/// With `normalize` the raw value is divided by 255 before mean/std.
pub fn to_tensor_layout(image: &Image, mean: [f32; 3], std: [f32; 3], normalize: bool) -> Array4<f32> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let data = image.data();
    let mut tensor = Array4::<f32>::zeros((1, 3, height, width));

    for y in 0..height {
        for x in 0..width {
            let src = (y * width + x) * Image::CHANNELS;
            for c in 0..Image::CHANNELS {
                let dst_c = 2 - c;
                let mut value = data[src + c] as f32;
                if normalize {
                    value /= 255.0;
                }
                tensor[[0, dst_c, y, x]] = (value - mean[dst_c]) / std[dst_c];
            }
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    #[rstest]
    #[case::no_width(0, 10)]
    #[case::no_height(10, 0)]
    #[case::no_pixels(0, 0)]
    fn test_letterbox_rejects_empty_image(#[case] w: u32, #[case] h: u32) {
        let err = letterbox_resize(&Image::filled(w, h, [0, 0, 0]), 640).unwrap_err();
        assert!(matches!(err, FaceError::InvalidInput(_)));
    }

    #[rstest]
    #[case::landscape(1280, 720)]
    #[case::portrait(480, 640)]
    #[case::square(640, 640)]
    #[case::small(100, 37)]
    fn test_letterbox_geometry(#[case] w: u32, #[case] h: u32) {
        let img = Image::filled(w, h, [10, 20, 30]);
        let (canvas, ctx) = letterbox_resize(&img, 640).unwrap();

        let expected_scale = (640.0 / w as f32).min(640.0 / h as f32);
        assert_relative_eq!(ctx.scale, expected_scale);
        assert_eq!((canvas.width(), canvas.height()), (640, 640));
        assert_eq!(ctx.offset_x, (640 - ctx.new_width) / 2);
        assert_eq!(ctx.offset_y, (640 - ctx.new_height) / 2);
        assert_eq!(ctx.new_width, (w as f32 * expected_scale).round() as u32);
        assert_eq!(ctx.new_height, (h as f32 * expected_scale).round() as u32);
    }

    #[test]
    fn test_letterbox_pads_with_neutral_gray() {
        let img = Image::filled(200, 100, [0, 0, 255]);
        let (canvas, ctx) = letterbox_resize(&img, 64).unwrap();
        assert_eq!(ctx.offset_x, 0);
        assert_eq!(ctx.offset_y, 16);
        // Top padding row
        assert_eq!(canvas.pixel(10, 0), LETTERBOX_FILL);
        // Content
        assert_eq!(canvas.pixel(10, 32), [0, 0, 255]);
        // Bottom padding row
        assert_eq!(canvas.pixel(10, 63), LETTERBOX_FILL);
    }

    #[test]
    fn test_uniform_resize_stays_uniform() {
        let img = Image::filled(100, 100, [128, 128, 128]);
        let resized = resize_bilinear(&img, 200, 200);
        assert!(resized.iter().all(|&p| p == 128), "uniform resize should stay uniform");
    }

    #[test]
    fn test_letterbox_rejects_zero_target() {
        let img = Image::filled(4, 4, [0, 0, 0]);
        assert!(letterbox_resize(&img, 0).is_err());
    }

    #[test]
    fn test_letterbox_coordinate_roundtrip() {
        for &(w, h) in &[(320u32, 240u32), (1920, 1080), (333, 777), (640, 640)] {
            let ctx = ResizeContext::new(w, h, 640);
            for &(x, y) in &[(0.0f32, 0.0f32), (100.0, 50.0), (w as f32 - 1.0, h as f32 - 1.0)] {
                let (cx, cy) = map(x, y, &ctx);
                let (rx, ry) = unmap(cx, cy, &ctx);
                assert!((rx - x).abs() < 1e-2, "x: {rx} vs {x}");
                assert!((ry - y).abs() < 1e-2, "y: {ry} vs {y}");
            }
        }
    }

    #[test]
    fn test_tensor_layout_swaps_channels_and_planarizes() {
        // 2x1 image: pixel0 = B10 G20 R30, pixel1 = B40 G50 R60
        let img = Image::from_bgr(vec![10, 20, 30, 40, 50, 60], 2, 1).unwrap();
        let t = to_tensor_layout(&img, [0.0; 3], [1.0; 3], false);
        assert_eq!(t.shape(), &[1, 3, 1, 2]);
        // Channel 0 is red
        assert_eq!(t[[0, 0, 0, 0]], 30.0);
        assert_eq!(t[[0, 0, 0, 1]], 60.0);
        assert_eq!(t[[0, 1, 0, 0]], 20.0);
        assert_eq!(t[[0, 2, 0, 1]], 40.0);
    }

    #[test]
    fn test_tensor_layout_mean_std_per_channel() {
        let img = Image::filled(1, 1, [255, 0, 128]);
        let t = to_tensor_layout(&img, [127.5, 0.0, 100.0], [128.0, 1.0, 5.0], false);
        assert_relative_eq!(t[[0, 0, 0, 0]], (128.0 - 127.5) / 128.0);
        assert_relative_eq!(t[[0, 1, 0, 0]], 0.0);
        assert_relative_eq!(t[[0, 2, 0, 0]], (255.0 - 100.0) / 5.0);
    }

    #[test]
    fn test_tensor_layout_normalize_divides_first() {
        let img = Image::filled(1, 1, [255, 255, 255]);
        let t = to_tensor_layout(&img, [0.5; 3], [0.5; 3], true);
        assert_relative_eq!(t[[0, 1, 0, 0]], 1.0);
    }
}
