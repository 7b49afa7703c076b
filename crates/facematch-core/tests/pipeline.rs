//! End-to-end pipeline flows against scripted engines and the in-process gallery.

use facematch_core::alignment::REFERENCE_LANDMARKS_112;
use facematch_core::{
    AlignmentConfig, CancelFlag, DetectorConfig, FaceDetector, FaceError, FacePipeline, FaceRecognizer, InferenceEngine,
    InferenceOutput, MatchConfig, MemoryStore, MetricType, NewIdentity, RecognizeOptions, RecognizerConfig, Result,
    Tensor,
};
use std::io::Cursor;

const INPUT_SIZE: u32 = 64;
const STRIDES: [usize; 3] = [8, 16, 32];
const POOL: usize = 4;
const FEATURE_DIM: usize = 3 * POOL * POOL;

/// SCRFD stand-in: each cell's logit grows with the local pixel contrast, so
/// flat images produce nothing and edges produce faces. Every anchor predicts a
/// 2·stride box with template-shaped landmarks around its center.
struct ContrastScrfd {
    names: Vec<String>,
}

impl ContrastScrfd {
    fn new() -> Self {
        let names = ["score", "bbox", "kps"]
            .iter()
            .flat_map(|kind| STRIDES.iter().map(move |s| format!("{kind}_{s}")))
            .collect();
        Self { names }
    }
}

impl InferenceEngine for ContrastScrfd {
    fn output_names(&self) -> &[String] {
        &self.names
    }

    fn run(&self, input: &Tensor) -> Result<InferenceOutput> {
        let size = input.shape()[2];
        let data = input.flatten();
        let at = |c: usize, y: usize, x: usize| data[(c * size + y) * size + x];

        let (mut scores, mut bboxes, mut kps) = (Vec::new(), Vec::new(), Vec::new());
        for &stride in &STRIDES {
            let cells = size / stride;
            let (mut s, mut b, mut k) = (Vec::new(), Vec::new(), Vec::new());
            for i in 0..cells {
                for j in 0..cells {
                    let (mut lo, mut hi) = (f32::MAX, f32::MIN);
                    for c in 0..3 {
                        for y in i * stride..(i + 1) * stride {
                            for x in j * stride..(j + 1) * stride {
                                lo = lo.min(at(c, y, x));
                                hi = hi.max(at(c, y, x));
                            }
                        }
                    }
                    let logit = 8.0 * (hi - lo) - 4.0;
                    for _ in 0..2 {
                        s.push(logit);
                        b.extend_from_slice(&[1.0; 4]);
                        for (tx, ty) in REFERENCE_LANDMARKS_112 {
                            k.push(((tx - 56.0) / 56.0) as f32);
                            k.push(((ty - 56.0) / 56.0) as f32);
                        }
                    }
                }
            }
            let n = s.len();
            scores.push((format!("score_{stride}"), Tensor::from_shape_vec(&[1, n, 1], s)?));
            bboxes.push((format!("bbox_{stride}"), Tensor::from_shape_vec(&[1, n, 4], b)?));
            kps.push((format!("kps_{stride}"), Tensor::from_shape_vec(&[1, n, 10], k)?));
        }

        Ok(InferenceOutput::new(scores.into_iter().chain(bboxes).chain(kps).collect()))
    }
}

/// ArcFace stand-in: block-averages each channel of the aligned crop.
struct PoolingArcface {
    names: Vec<String>,
}

impl InferenceEngine for PoolingArcface {
    fn output_names(&self) -> &[String] {
        &self.names
    }

    fn run(&self, input: &Tensor) -> Result<InferenceOutput> {
        let (h, w) = (input.shape()[2], input.shape()[3]);
        let (bh, bw) = (h / POOL, w / POOL);
        let data = input.flatten();

        let mut embedding = Vec::with_capacity(FEATURE_DIM);
        for c in 0..3 {
            for by in 0..POOL {
                for bx in 0..POOL {
                    let mut sum = 0.0;
                    for y in by * bh..(by + 1) * bh {
                        for x in bx * bw..(bx + 1) * bw {
                            sum += data[(c * h + y) * w + x];
                        }
                    }
                    embedding.push(sum / (bh * bw) as f32);
                }
            }
        }
        let out = Tensor::from_shape_vec(&[1, FEATURE_DIM], embedding)?;
        Ok(InferenceOutput::new(vec![(self.names[0].clone(), out)]))
    }
}

fn pipeline() -> FacePipeline {
    let detector = FaceDetector::new(
        Box::new(ContrastScrfd::new()),
        DetectorConfig {
            input_size: INPUT_SIZE,
            ..DetectorConfig::default()
        },
    )
    .unwrap();
    let recognizer = FaceRecognizer::new(
        Box::new(PoolingArcface {
            names: vec!["fc1".into()],
        }),
        RecognizerConfig {
            feature_dim: FEATURE_DIM,
            ..RecognizerConfig::default()
        },
    )
    .unwrap();
    FacePipeline::new(
        detector,
        recognizer,
        AlignmentConfig::default(),
        MatchConfig::default(),
        Box::new(MemoryStore::new(MetricType::Cosine, FEATURE_DIM)),
    )
}

fn png(img: image::RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

/// A colored square on a plain background, centered in a 64×64 frame.
fn square(fg: [u8; 3], bg: [u8; 3]) -> Vec<u8> {
    png(image::RgbImage::from_fn(64, 64, |x, y| {
        if (20..44).contains(&x) && (20..44).contains(&y) {
            image::Rgb(fg)
        } else {
            image::Rgb(bg)
        }
    }))
}

fn face_a() -> Vec<u8> {
    square([255, 0, 0], [0, 0, 0])
}

/// Pixel-wise inverse of [`face_a`]: same geometry, opposite appearance.
fn face_b() -> Vec<u8> {
    square([0, 255, 255], [255, 255, 255])
}

fn gray() -> Vec<u8> {
    png(image::RgbImage::from_pixel(640, 640, image::Rgb([128, 128, 128])))
}

fn identity(person_id: &str, name: &str) -> NewIdentity {
    NewIdentity {
        person_id: person_id.into(),
        name: name.into(),
        remark: String::new(),
    }
}

#[test]
fn uniform_gray_image_yields_no_candidates() {
    let faces = pipeline().detect_bytes(&gray(), &CancelFlag::new()).unwrap();
    assert!(faces.is_empty());
}

#[test]
fn detection_is_ranked_and_carries_landmarks() {
    let faces = pipeline().detect_bytes(&face_a(), &CancelFlag::new()).unwrap();
    assert!(!faces.is_empty());
    for pair in faces.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    assert!(faces.iter().all(|f| f.landmarks.is_some()));
    assert!(faces[0].score > 0.5);
}

#[test]
fn register_then_recognize_same_face() {
    let p = pipeline();
    let cancel = CancelFlag::new();

    let reg = p.register(&face_a(), identity("p-1", "alice"), &cancel).unwrap();
    assert_eq!(reg.record.face_id.len(), 32);
    assert!(reg.record.face_id.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(reg.record.register_time > 0);
    assert!(reg.faces_detected >= 1);

    let rec = p.recognize(&face_a(), RecognizeOptions::default(), &cancel).unwrap();
    assert!(rec.face.is_some());
    assert_eq!(rec.matches.len(), 1);
    assert_eq!(rec.matches[0].record.name, "alice");
    assert!((rec.matches[0].similarity - 1.0).abs() < 1e-4);
}

#[test]
fn recognize_distinguishes_enrolled_faces() {
    let p = pipeline();
    let cancel = CancelFlag::new();
    p.register(&face_a(), identity("p-1", "alice"), &cancel).unwrap();
    p.register(&face_b(), identity("p-2", "bob"), &cancel).unwrap();

    let rec = p.recognize(&face_b(), RecognizeOptions::default(), &cancel).unwrap();
    let names: Vec<&str> = rec.matches.iter().map(|m| m.record.name.as_str()).collect();
    assert_eq!(names, vec!["bob"]);

    // With the threshold at the floor both come back, best first
    let all = p
        .recognize(
            &face_b(),
            RecognizeOptions {
                threshold: Some(-1.0),
                top_k: Some(5),
            },
            &cancel,
        )
        .unwrap();
    assert_eq!(all.matches.len(), 2);
    assert_eq!(all.matches[0].record.name, "bob");
    assert!(all.matches[0].similarity > all.matches[1].similarity);
}

#[test]
fn recognize_respects_top_k_override() {
    let p = pipeline();
    let cancel = CancelFlag::new();
    p.register(&face_a(), identity("p-1", "alice"), &cancel).unwrap();
    p.register(&face_a(), identity("p-1", "alice"), &cancel).unwrap();

    let options = RecognizeOptions {
        threshold: None,
        top_k: Some(1),
    };
    assert_eq!(p.recognize(&face_a(), options, &cancel).unwrap().matches.len(), 1);
}

#[test]
fn register_without_face_is_no_detection() {
    let p = pipeline();
    let err = p.register(&gray(), identity("p-1", "alice"), &CancelFlag::new()).unwrap_err();
    assert!(matches!(err, FaceError::NoDetection));
    assert!(p.list_faces(10).unwrap().is_empty());
}

#[test]
fn recognize_without_face_is_empty_outcome() {
    let rec = pipeline()
        .recognize(&gray(), RecognizeOptions::default(), &CancelFlag::new())
        .unwrap();
    assert!(rec.face.is_none());
    assert!(rec.matches.is_empty());
}

#[test]
fn cancelled_request_stores_nothing() {
    let p = pipeline();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let err = p.register(&face_a(), identity("p-1", "alice"), &cancel).unwrap_err();
    assert!(matches!(err, FaceError::Cancelled));
    assert!(p.list_faces(10).unwrap().is_empty());
}

#[test]
fn undecodable_bytes_are_decode_failure() {
    let err = pipeline()
        .recognize(b"\x89PNG not really", RecognizeOptions::default(), &CancelFlag::new())
        .unwrap_err();
    assert!(matches!(err, FaceError::DecodeFailure(_)));
}

#[test]
fn admin_operations_pass_through() {
    let p = pipeline();
    let cancel = CancelFlag::new();
    let first = p.register(&face_a(), identity("p-1", "alice"), &cancel).unwrap();
    p.register(&face_a(), identity("p-1", "alice"), &cancel).unwrap();
    p.register(&face_b(), identity("p-2", "bob"), &cancel).unwrap();

    assert_eq!(p.list_faces(10).unwrap().len(), 3);
    assert_eq!(p.list_faces(1).unwrap().len(), 1);
    assert_eq!(p.query_by_person("p-1").unwrap().len(), 2);
    assert_eq!(p.query_by_name("bob").unwrap()[0].person_id, "p-2");

    p.delete_face(&first.record.face_id).unwrap();
    assert_eq!(p.query_by_person("p-1").unwrap().len(), 1);

    p.delete_person("p-1").unwrap();
    assert!(p.query_by_name("alice").unwrap().is_empty());

    p.reset().unwrap();
    assert!(p.list_faces(10).unwrap().is_empty());
}
