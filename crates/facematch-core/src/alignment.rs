//! Face alignment via 4-DOF similarity transform.
//!
//! Aligns detected faces to the canonical ArcFace position using the five
//! InsightFace reference landmarks and a closed-form least-squares fit
//! (centroids, rotation from cross-covariance, uniform scale).

use crate::error::{FaceError, Result};
use crate::types::{Image, Landmark};
use serde::Deserialize;

/// Side of the square the reference landmarks are defined for.
pub const REFERENCE_SIZE: u32 = 112;

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: [(f64, f64); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Side of the aligned square crop.
    pub output_size: u32,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            output_size: REFERENCE_SIZE,
        }
    }
}

/// Uniform scale, rotation and translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub scale: f64,
    /// Rotation in radians.
    pub theta: f64,
    pub tx: f64,
    pub ty: f64,
}

impl SimilarityTransform {
    /// The 2×3 matrix `[[s·cosθ, −s·sinθ, tx], [s·sinθ, s·cosθ, ty]]`.
    pub fn matrix(&self) -> [[f64; 3]; 2] {
        let (sin, cos) = self.theta.sin_cos();
        let (a, b) = (self.scale * cos, self.scale * sin);
        [[a, -b, self.tx], [b, a, self.ty]]
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let [[a, c, tx], [b, d, ty]] = self.matrix();
        (a * x + c * y + tx, b * x + d * y + ty)
    }
}

/// An aligned face crop and the transform that produced it.
#[derive(Debug, Clone)]
pub struct AlignedFace {
    pub image: Image,
    pub transform: SimilarityTransform,
}

/// Estimate the similarity transform taking `src` points onto `dst` points.
pub fn estimate_similarity(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Result<SimilarityTransform> {
    if src.len() != dst.len() || src.is_empty() {
        return Err(FaceError::InvalidInput(format!(
            "point sets must be non-empty and equal length, got {} and {}",
            src.len(),
            dst.len()
        )));
    }
    if src.iter().chain(dst).any(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return Err(FaceError::InvalidInput("landmarks must be finite".into()));
    }

    let n = src.len() as f64;
    let centroid = |pts: &[(f64, f64)]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (src_cx, src_cy) = centroid(src);
    let (dst_cx, dst_cy) = centroid(dst);

    let mut src_var = 0.0;
    let mut sum_a = 0.0;
    let mut sum_b = 0.0;
    for (&(px, py), &(qx, qy)) in src.iter().zip(dst) {
        let (sx, sy) = (px - src_cx, py - src_cy);
        let (dx, dy) = (qx - dst_cx, qy - dst_cy);
        src_var += sx * sx + sy * sy;
        sum_a += dx * sx + dy * sy;
        sum_b += dy * sx - dx * sy;
    }
    src_var /= n;

    if src_var <= f64::EPSILON {
        return Err(FaceError::InvalidInput("landmarks coincide, alignment is undefined".into()));
    }

    let scale = (sum_a * sum_a + sum_b * sum_b).sqrt() / (src_var * n);
    let theta = sum_b.atan2(sum_a);

    let (sin, cos) = theta.sin_cos();
    let tx = dst_cx - scale * (cos * src_cx - sin * src_cy);
    let ty = dst_cy - scale * (sin * src_cx + cos * src_cy);

    Ok(SimilarityTransform { scale, theta, tx, ty })
}

/// Warp `image` into an `out_size × out_size` crop.
///
/// Each output pixel is mapped back through the inverse transform and sampled
/// bilinearly; samples outside the source are black.
pub fn warp_affine(image: &Image, transform: &SimilarityTransform, out_size: u32) -> Result<Image> {
    let [[a, c, tx], [b, d, ty]] = transform.matrix();
    let det = a * d - b * c;
    if det.abs() < 1e-12 {
        return Err(FaceError::InvalidInput(format!(
            "transform is not invertible (scale {})",
            transform.scale
        )));
    }
    let (ia, ic) = (d / det, -c / det);
    let (ib, id) = (-b / det, a / det);

    let (src_w, src_h) = (image.width() as i64, image.height() as i64);
    let frame = image.data();
    let size = out_size as usize;
    let mut output = vec![0u8; size * size * Image::CHANNELS];

    for oy in 0..size {
        for ox in 0..size {
            // src = M_inv * (dst - t)
            let dx = ox as f64 - tx;
            let dy = oy as f64 - ty;
            let sx = ia * dx + ic * dy;
            let sy = ib * dx + id * dy;

            let x0 = sx.floor() as i64;
            let y0 = sy.floor() as i64;
            let fx = sx - x0 as f64;
            let fy = sy - y0 as f64;

            let taps = [
                (x0, y0, (1.0 - fx) * (1.0 - fy)),
                (x0 + 1, y0, fx * (1.0 - fy)),
                (x0, y0 + 1, (1.0 - fx) * fy),
                (x0 + 1, y0 + 1, fx * fy),
            ];

            let dst = (oy * size + ox) * Image::CHANNELS;
            for ch in 0..Image::CHANNELS {
                let val: f64 = taps
                    .iter()
                    .filter(|&&(x, y, _)| x >= 0 && x < src_w && y >= 0 && y < src_h)
                    .map(|&(x, y, w)| frame[(y * src_w + x) as usize * Image::CHANNELS + ch] as f64 * w)
                    .sum();
                output[dst + ch] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    Image::from_bgr(output, out_size, out_size)
}

/// Align a detected face to the canonical crop.
///
/// Takes a BGR frame and five detected facial landmarks, computes the
/// similarity transform to the reference positions, and warps the face region
/// into an aligned crop suitable for ArcFace embedding extraction.
pub fn align_face(image: &Image, landmarks: &[Landmark], config: &AlignmentConfig) -> Result<AlignedFace> {
    if landmarks.len() != 5 {
        return Err(FaceError::InvalidInput(format!(
            "alignment needs exactly 5 landmarks, got {}",
            landmarks.len()
        )));
    }
    if config.output_size == 0 {
        return Err(FaceError::InvalidInput("alignment output size must be non-zero".into()));
    }

    let src: Vec<(f64, f64)> = landmarks.iter().map(|&(x, y)| (x as f64, y as f64)).collect();
    let transform = estimate_similarity(&src, &REFERENCE_LANDMARKS_112)?;
    tracing::trace!(
        scale = transform.scale,
        theta = transform.theta,
        tx = transform.tx,
        ty = transform.ty,
        "similarity transform"
    );

    let image = warp_affine(image, &transform, config.output_size)?;
    Ok(AlignedFace { image, transform })
}
