use crate::error::{FaceError, Result};
use serde::{Deserialize, Serialize};

/// A point in image space.
pub type Landmark = (f32, f32);

/// Interleaved 3-channel image in BGR order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Image {
    pub const CHANNELS: usize = 3;

    /// Wrap an interleaved BGR buffer, checking that it matches the dimensions.
    pub fn from_bgr(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(FaceError::InvalidInput(format!(
                "image dimensions must be non-zero, got {width}x{height}"
            )));
        }
        let expected = width as usize * height as usize * Self::CHANNELS;
        if data.len() != expected {
            return Err(FaceError::InvalidInput(format!(
                "BGR buffer for {width}x{height} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self { data, width, height })
    }

    /// A solid image. Used for letterbox canvases and synthetic inputs.
    pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * Self::CHANNELS);
        for _ in 0..pixels {
            data.extend_from_slice(&bgr);
        }
        Self { data, width, height }
    }

    /// Decode encoded image bytes (JPEG, PNG, ...) into BGR.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes)?.to_rgb8();
        tracing::debug!(
            width = decoded.width(),
            height = decoded.height(),
            "decoded image"
        );
        Self::from_rgb(&decoded)
    }

    /// Convert an RGB image buffer into BGR order.
    pub fn from_rgb(rgb: &image::RgbImage) -> Result<Self> {
        let data = rgb
            .as_raw()
            .chunks_exact(Self::CHANNELS)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect();
        Self::from_bgr(data, rgb.width(), rgb.height())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bgr(self) -> Vec<u8> {
        self.data
    }

    /// BGR value at (x, y). Panics when out of bounds, like slice indexing.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let off = (y as usize * self.width as usize + x as usize) * Self::CHANNELS;
        [self.data[off], self.data[off + 1], self.data[off + 2]]
    }
}

/// Axis-aligned box in corner form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection-over-Union; 0 when the boxes are disjoint or degenerate.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// A face found by the detector, in original-image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionCandidate {
    pub bbox: BoundingBox,
    /// Activated confidence in [0, 1].
    pub score: f32,
    /// Five-point landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    /// `None` only when the detection model exports no landmark tensor.
    pub landmarks: Option<[Landmark; 5]>,
    /// Feature-map stride that produced this candidate.
    pub stride: usize,
}

/// Identity metadata stored alongside an enrolled feature vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub face_id: String,
    pub person_id: String,
    pub name: String,
    #[serde(default)]
    pub remark: String,
    /// Unix epoch milliseconds.
    pub register_time: i64,
}

/// One ranked hit from a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub record: FaceRecord,
    /// Similarity in [0, 1]; higher is closer.
    pub similarity: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        BoundingBox { x1, y1, x2, y2 }
    }

    #[test]
    fn test_iou_identical() {
        let a = bbox(0.0, 0.0, 100.0, 100.0);
        assert_relative_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(20.0, 20.0, 30.0, 30.0);
        assert_relative_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_partial() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(5.0, 0.0, 15.0, 10.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert_relative_eq!(a.iou(&b), 50.0 / 150.0);
    }

    #[test]
    fn test_iou_degenerate_union() {
        let a = bbox(5.0, 5.0, 5.0, 5.0);
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn test_from_bgr_rejects_short_buffer() {
        let err = Image::from_bgr(vec![0; 10], 2, 2).unwrap_err();
        assert!(matches!(err, FaceError::InvalidInput(_)));
    }

    #[test]
    fn test_from_bgr_rejects_empty_dimensions() {
        assert!(Image::from_bgr(Vec::new(), 0, 4).is_err());
    }

    #[test]
    fn test_from_rgb_swaps_to_bgr() {
        let rgb = image::RgbImage::from_pixel(2, 1, image::Rgb([10, 20, 30]));
        let img = Image::from_rgb(&rgb).unwrap();
        assert_eq!(img.pixel(1, 0), [30, 20, 10]);
    }

    #[test]
    fn test_decode_png_roundtrip() {
        let rgb = image::RgbImage::from_pixel(4, 3, image::Rgb([200, 100, 50]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(rgb)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let img = Image::decode(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (4, 3));
        assert_eq!(img.pixel(3, 2), [50, 100, 200]);
    }

    #[test]
    fn test_decode_garbage_is_decode_failure() {
        let err = Image::decode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, FaceError::DecodeFailure(_)));
    }
}
