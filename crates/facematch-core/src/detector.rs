//! SCRFD face detector.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) output decoding: multi-stride anchor-center distance regression,
//! optional five-point landmarks, and NMS post-processing. The forward pass is
//! delegated to an [`InferenceEngine`].

use crate::error::{FaceError, Result};
use crate::geometry::{self, ResizeContext};
use crate::inference::{InferenceEngine, OrtEngine, SessionOptions};
use crate::suppress::{self, DEFAULT_NMS_THRESHOLD};
use crate::tensor::Tensor;
use crate::types::{BoundingBox, DetectionCandidate, Image, Landmark};
use serde::Deserialize;
use std::borrow::Cow;
use std::path::Path;

// --- Named constants (no magic numbers) ---
pub const DEFAULT_STRIDES: [usize; 3] = [8, 16, 32];
pub const ANCHORS_PER_CELL: usize = 2;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_MEAN: f32 = 127.5;
const DEFAULT_STD: f32 = 128.0;
/// Number of leading scores inspected by [`ScoreActivation::Auto`].
const ACTIVATION_SAMPLE: usize = 100;

/// How raw score tensors are turned into probabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreActivation {
    /// Sample the first scores; any value outside [0, 1] means logits.
    #[default]
    Auto,
    /// The graph emits logits; always apply the logistic function.
    Sigmoid,
    /// The graph already emits probabilities.
    Identity,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub confidence_threshold: f32,
    /// Side of the square letterbox canvas fed to the model.
    pub input_size: u32,
    pub nms_threshold: f32,
    pub strides: Vec<usize>,
    /// Per-channel mean, RGB order.
    pub mean: [f32; 3],
    /// Per-channel std, RGB order.
    pub std: [f32; 3],
    pub activation: ScoreActivation,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            input_size: DEFAULT_INPUT_SIZE,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
            strides: DEFAULT_STRIDES.to_vec(),
            mean: [DEFAULT_MEAN; 3],
            std: [DEFAULT_STD; 3],
            activation: ScoreActivation::Auto,
        }
    }
}

/// Anchor centers for one stride, in the flattening order of the model outputs.
///
/// Rows, then columns, then [`ANCHORS_PER_CELL`] slots that share a center.
#[derive(Debug, Clone)]
pub struct AnchorTable {
    pub stride: usize,
    centers: Vec<(f32, f32)>,
}

impl AnchorTable {
    pub fn new(input_size: usize, stride: usize) -> Self {
        let feature_size = input_size / stride;
        let mut centers = Vec::with_capacity(feature_size * feature_size * ANCHORS_PER_CELL);
        for i in 0..feature_size {
            for j in 0..feature_size {
                let center = ((j as f32 + 0.5) * stride as f32, (i as f32 + 0.5) * stride as f32);
                for _ in 0..ANCHORS_PER_CELL {
                    centers.push(center);
                }
            }
        }
        Self { stride, centers }
    }

    pub fn centers(&self) -> &[(f32, f32)] {
        &self.centers
    }

    pub fn len(&self) -> usize {
        self.centers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }
}

/// Output tensor indices for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputIndices {
    score: usize,
    bbox: usize,
    kps: Option<usize>,
}

/// SCRFD-based face detector.
///
/// Anchor tables and the output mapping are computed once in [`FaceDetector::new`]
/// and only read afterwards, so a detector can be shared across threads.
pub struct FaceDetector {
    engine: Box<dyn InferenceEngine>,
    config: DetectorConfig,
    anchors: Vec<AnchorTable>,
    stride_indices: Vec<StrideOutputIndices>,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, options: SessionOptions, config: DetectorConfig) -> Result<Self> {
        let engine = OrtEngine::load(model_path, options)?;
        Self::new(Box::new(engine), config)
    }

    /// Wrap an inference engine and precompute the anchor tables.
    pub fn new(engine: Box<dyn InferenceEngine>, config: DetectorConfig) -> Result<Self> {
        if config.strides.is_empty() || config.strides.contains(&0) {
            return Err(FaceError::InvalidInput(format!(
                "detector strides must be non-empty and positive, got {:?}",
                config.strides
            )));
        }
        if config.input_size == 0 {
            return Err(FaceError::InvalidInput("detector input size must be non-zero".into()));
        }

        let stride_indices = discover_output_indices(engine.output_names(), &config.strides)?;
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        let anchors: Vec<AnchorTable> = config
            .strides
            .iter()
            .map(|&stride| AnchorTable::new(config.input_size as usize, stride))
            .collect();
        tracing::info!(
            strides = ?config.strides,
            input_size = config.input_size,
            anchors = anchors.iter().map(AnchorTable::len).sum::<usize>(),
            "SCRFD anchor tables built"
        );

        Ok(Self {
            engine,
            config,
            anchors,
            stride_indices,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detect faces, returning candidates in original-image coordinates sorted
    /// by descending score. No face is an empty list, not an error.
    pub fn detect(&self, image: &Image) -> Result<Vec<DetectionCandidate>> {
        let (canvas, ctx) = geometry::letterbox_resize(image, self.config.input_size)?;
        let input: Tensor = geometry::to_tensor_layout(&canvas, self.config.mean, self.config.std, false).into();

        let outputs = self.engine.run(&input)?;

        let mut all_detections = Vec::new();
        for (table, indices) in self.anchors.iter().zip(&self.stride_indices) {
            let stride = table.stride;
            let tensor = |idx: usize, kind: &str| {
                outputs.at(idx).ok_or_else(|| {
                    FaceError::DecodeFailure(format!("missing {kind} output #{idx} for stride {stride}"))
                })
            };
            let scores = tensor(indices.score, "score")?.flatten();
            let bboxes = tensor(indices.bbox, "bbox")?.flatten();
            let kps = match indices.kps {
                Some(idx) => Some(tensor(idx, "kps")?.flatten()),
                None => None,
            };

            let dets = decode_stride(
                &scores,
                &bboxes,
                kps.as_deref(),
                table,
                self.config.input_size as f32,
                &ctx,
                self.config.confidence_threshold,
                self.config.activation,
            );
            all_detections.extend(dets);
        }

        let result = suppress::nms(all_detections, self.config.nms_threshold);
        tracing::debug!(faces = result.len(), "detection complete");
        Ok(result)
    }
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports either name their outputs `score_8`, `bbox_16`, `kps_32`, ...
/// or use generic numeric names. Without recognizable names, the standard
/// positional ordering is assumed: all scores, then all bboxes, then all kps.
fn discover_output_indices(names: &[String], strides: &[usize]) -> Result<Vec<StrideOutputIndices>> {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named = strides
        .iter()
        .all(|&stride| find("score", stride).is_some() && find("bbox", stride).is_some());

    if named {
        tracing::info!("SCRFD: using name-based output tensor mapping");
        return Ok(strides
            .iter()
            .filter_map(|&stride| {
                Some(StrideOutputIndices {
                    score: find("score", stride)?,
                    bbox: find("bbox", stride)?,
                    kps: find("kps", stride),
                })
            })
            .collect());
    }

    let n = strides.len();
    if names.len() < 2 * n {
        return Err(FaceError::ModelLoadFailure(format!(
            "SCRFD model requires at least {} outputs ({n} strides × score/bbox), got {}",
            2 * n,
            names.len()
        )));
    }
    let has_kps = names.len() >= 3 * n;
    tracing::info!(
        ?names,
        has_kps,
        "SCRFD: output names not recognized, using positional mapping [scores, bboxes, kps]"
    );
    Ok((0..n)
        .map(|i| StrideOutputIndices {
            score: i,
            bbox: n + i,
            kps: has_kps.then_some(2 * n + i),
        })
        .collect())
}

/// Whether a score array holds logits, judged from its leading values.
fn scores_are_logits(scores: &[f32]) -> bool {
    scores
        .iter()
        .take(ACTIVATION_SAMPLE)
        .any(|&s| !(0.0..=1.0).contains(&s))
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Apply the configured activation to a whole score array.
fn activate(scores: &[f32], activation: ScoreActivation) -> Cow<'_, [f32]> {
    let apply = match activation {
        ScoreActivation::Auto => scores_are_logits(scores),
        ScoreActivation::Sigmoid => true,
        ScoreActivation::Identity => false,
    };
    if apply {
        Cow::Owned(scores.iter().map(|&s| sigmoid(s)).collect())
    } else {
        Cow::Borrowed(scores)
    }
}

/// Decode detections for a single stride level.
///
/// Boxes are distance-decoded around the anchor center in canvas space,
/// validated, clipped to the canvas, and mapped back to the original image.
#[allow(clippy::too_many_arguments)]
pub fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: Option<&[f32]>,
    anchors: &AnchorTable,
    input_size: f32,
    ctx: &ResizeContext,
    threshold: f32,
    activation: ScoreActivation,
) -> Vec<DetectionCandidate> {
    let stride = anchors.stride as f32;
    let scores = activate(scores, activation);
    let count = scores.len().min(anchors.len());

    let mut detections = Vec::new();
    let mut above_threshold = 0usize;

    for (idx, (&score, &(cx, cy))) in scores[..count].iter().zip(anchors.centers()).enumerate() {
        if score < threshold {
            continue;
        }
        above_threshold += 1;

        // Decode bbox: [left, top, right, bottom] distances * stride
        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            tracing::warn!(stride = anchors.stride, idx, len = bboxes.len(), "bbox tensor shorter than score tensor");
            break;
        }
        let x1 = cx - bboxes[bbox_off] * stride;
        let y1 = cy - bboxes[bbox_off + 1] * stride;
        let x2 = cx + bboxes[bbox_off + 2] * stride;
        let y2 = cy + bboxes[bbox_off + 3] * stride;

        let (width, height) = (x2 - x1, y2 - y1);
        if width <= 0.0 || height <= 0.0 || width > 2.0 * input_size || height > 2.0 * input_size {
            continue;
        }

        let x1 = x1.clamp(0.0, input_size);
        let y1 = y1.clamp(0.0, input_size);
        let x2 = x2.clamp(0.0, input_size);
        let y2 = y2.clamp(0.0, input_size);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        // Map from letterboxed space to original frame space
        let (orig_x1, orig_y1) = geometry::unmap(x1, y1, ctx);
        let (orig_x2, orig_y2) = geometry::unmap(x2, y2, ctx);

        let landmarks = kps.and_then(|kps| {
            let kps_off = idx * 10;
            if kps_off + 9 >= kps.len() {
                return None;
            }
            let mut lms: [Landmark; 5] = [(0.0, 0.0); 5];
            for (k, lm) in lms.iter_mut().enumerate() {
                let lx = cx + kps[kps_off + k * 2] * stride;
                let ly = cy + kps[kps_off + k * 2 + 1] * stride;
                *lm = geometry::unmap(lx, ly, ctx);
            }
            Some(lms)
        });

        detections.push(DetectionCandidate {
            bbox: BoundingBox {
                x1: orig_x1,
                y1: orig_y1,
                x2: orig_x2,
                y2: orig_y2,
            },
            score,
            landmarks,
            stride: anchors.stride,
        });
    }

    tracing::debug!(
        stride = anchors.stride,
        anchors = anchors.len(),
        scores = scores.len(),
        above_threshold,
        valid = detections.len(),
        "decoded stride"
    );

    detections
}
