//! Greedy non-maximum suppression.

use crate::types::DetectionCandidate;

pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

/// Remove overlapping detections, keeping the highest-scoring box per cluster.
///
/// The sort is stable, so equal scores keep their insertion order and the
/// output is deterministic. The result is ordered by non-increasing score.
pub fn nms(mut candidates: Vec<DetectionCandidate>, iou_threshold: f32) -> Vec<DetectionCandidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut suppressed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..candidates.len() {
            if !suppressed[j] && candidates[i].bbox.iou(&candidates[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    let before = candidates.len();
    let kept: Vec<DetectionCandidate> = candidates
        .into_iter()
        .zip(suppressed)
        .filter_map(|(c, s)| (!s).then_some(c))
        .collect();
    tracing::debug!(before, after = kept.len(), "nms");
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn cand(x: f32, y: f32, w: f32, h: f32, score: f32) -> DetectionCandidate {
        DetectionCandidate {
            bbox: BoundingBox { x1: x, y1: y, x2: x + w, y2: y + h },
            score,
            landmarks: None,
            stride: 8,
        }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            cand(5.0, 5.0, 100.0, 100.0, 0.8),
            cand(0.0, 0.0, 100.0, 100.0, 0.9),
            cand(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].score, 0.9);
        assert_eq!(result[1].score, 0.7);
    }

    #[test]
    fn test_nms_no_suppression() {
        let detections = vec![cand(0.0, 0.0, 10.0, 10.0, 0.9), cand(50.0, 50.0, 10.0, 10.0, 0.8)];
        assert_eq!(nms(detections, 0.4).len(), 2);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_nms_ties_keep_insertion_order() {
        let detections = vec![
            cand(0.0, 0.0, 10.0, 10.0, 0.5),
            cand(1.0, 1.0, 10.0, 10.0, 0.5),
            cand(100.0, 0.0, 10.0, 10.0, 0.5),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].bbox.x1, 0.0);
        assert_eq!(result[1].bbox.x1, 100.0);
    }

    #[test]
    fn test_nms_threshold_is_exclusive() {
        // IoU exactly 1/3 with threshold 1/3 is kept.
        let a = cand(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = cand(5.0, 0.0, 10.0, 10.0, 0.8);
        let t = a.bbox.iou(&b.bbox);
        assert_eq!(nms(vec![a, b], t).len(), 2);
    }

    #[test]
    fn test_nms_invariants_random() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let input: Vec<DetectionCandidate> = (0..rng.gen_range(0..40))
                .map(|_| {
                    cand(
                        rng.gen_range(0.0..200.0),
                        rng.gen_range(0.0..200.0),
                        rng.gen_range(5.0..80.0),
                        rng.gen_range(5.0..80.0),
                        rng.gen_range(0.0..1.0),
                    )
                })
                .collect();

            let kept = nms(input.clone(), DEFAULT_NMS_THRESHOLD);

            for pair in kept.windows(2) {
                assert!(pair[0].score >= pair[1].score);
            }
            for (i, a) in kept.iter().enumerate() {
                assert!(input.contains(a));
                for b in &kept[i + 1..] {
                    assert!(a.bbox.iou(&b.bbox) <= DEFAULT_NMS_THRESHOLD);
                }
            }
        }
    }
}
