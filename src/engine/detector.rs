//! Face detector backends
//!
//! - `scrfd`: InsightFace SCRFD model on OpenVINO, boxes plus 5-point landmarks
//! - `skip`: no detection, the whole image is treated as one face

use std::sync::Arc;

use image::{DynamicImage, GenericImageView};
use openvino::{InferRequest, Tensor, ElementType, Shape};
use anyhow::{Result, Context};
use tracing::{debug, warn};

use super::pool::{ModelPool, ModelType};
use super::preprocess::{extract_face, preprocess_for_detection, ResizeInfo, DETECTOR_INPUT_SIZE};

/// A face as reported by a detector backend, in source-image pixels
#[derive(Debug, Clone)]
pub struct RawFace {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub landmarks: Option<[(f32, f32); 5]>,
    /// Face crop ready for attribute prediction (aligned when requested)
    pub aligned_face: DynamicImage,
}

/// Pluggable face detection backend.
///
/// Implementations must be stateless from the caller's point of view; the
/// same instance serves every `analyze` call.
pub trait DetectorBackend: Send + Sync {
    /// Registry key of this backend
    fn name(&self) -> &str;

    /// Detect faces; an empty vector means no face was found
    fn detect_faces(&self, image: &DynamicImage, align: bool) -> Result<Vec<RawFace>>;
}

/// Bounding box with landmarks, before cropping
#[derive(Debug, Clone)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// SCRFD Face Detector
pub struct ScrfdDetector {
    pool: Arc<ModelPool>,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl ScrfdDetector {
    pub const NAME: &'static str = "scrfd";

    /// Create a new SCRFD detector
    pub fn new(pool: Arc<ModelPool>, confidence_threshold: f32, nms_threshold: f32) -> Self {
        Self {
            pool,
            confidence_threshold,
            nms_threshold,
        }
    }

    /// Run the model and return boxes in original image coordinates
    pub fn detect_boxes(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let resize_info = ResizeInfo::new(image.dimensions(), DETECTOR_INPUT_SIZE);

        let input_tensor = preprocess_for_detection(image)?;

        let model = self.pool.get_model(ModelType::Detector)?;
        let mut request = model.create_infer_request()?;

        let input_shape = Shape::new(&[1, 3, DETECTOR_INPUT_SIZE.1 as i64, DETECTOR_INPUT_SIZE.0 as i64])?;
        let mut input = Tensor::new(ElementType::F32, &input_shape)?;
        copy_into_tensor(&mut input, input_tensor.as_slice().context("detector input not contiguous")?)?;

        request.set_input_tensor(&input)?;
        request.infer().context("SCRFD inference failed")?;

        let detections = self.parse_outputs(&request, &resize_info)?;
        let kept = nms(detections, self.nms_threshold);

        debug!("SCRFD kept {} faces after NMS", kept.len());
        Ok(kept)
    }

    /// Parse InsightFace SCRFD model outputs
    ///
    /// det_10g.onnx has 9 outputs:
    /// - outputs 0-2: scores for stride 8, 16, 32
    /// - outputs 3-5: bbox_preds for stride 8, 16, 32
    /// - outputs 6-8: kps_preds for stride 8, 16, 32
    fn parse_outputs(&self, request: &InferRequest, resize_info: &ResizeInfo) -> Result<Vec<FaceBox>> {
        let mut all_boxes = Vec::new();

        let mut output_count = 0;
        for i in 0..20 {
            if request.get_output_tensor_by_index(i).is_ok() {
                output_count += 1;
            } else {
                break;
            }
        }

        let (fmc, use_kps, num_anchors) = match output_count {
            6 => (3, false, 2),
            9 => (3, true, 2),
            10 => (5, false, 1),
            15 => (5, true, 1),
            _ => {
                warn!("Unknown SCRFD output count: {}, trying default", output_count);
                (3, true, 2)
            }
        };

        let strides: &[i32] = if fmc == 3 { &[8, 16, 32] } else { &[8, 16, 32, 64, 128] };
        let (input_h, input_w) = (DETECTOR_INPUT_SIZE.1 as i32, DETECTOR_INPUT_SIZE.0 as i32);
        let (max_x, max_y) = (resize_info.original_width as f32, resize_info.original_height as f32);

        for (idx, &stride) in strides.iter().enumerate() {
            let scores = read_tensor_f32(&request.get_output_tensor_by_index(idx)?)?;
            let bboxes = read_tensor_f32(&request.get_output_tensor_by_index(idx + fmc)?)?;
            let kps = if use_kps {
                Some(read_tensor_f32(&request.get_output_tensor_by_index(idx + fmc * 2)?)?)
            } else {
                None
            };

            let feat_h = input_h / stride;
            let feat_w = input_w / stride;
            let stride_f = stride as f32;

            let anchor_centers = (0..feat_h).flat_map(move |y| {
                (0..feat_w).flat_map(move |x| {
                    std::iter::repeat((x as f32 * stride_f, y as f32 * stride_f)).take(num_anchors)
                })
            });

            for (i, (cx, cy)) in anchor_centers.enumerate() {
                let Some(&score) = scores.get(i) else { break };
                if score < self.confidence_threshold {
                    continue;
                }

                let bbox_idx = i * 4;
                if bbox_idx + 3 >= bboxes.len() {
                    continue;
                }

                // Distance format: left, top, right, bottom
                let (x1, y1) = resize_info.to_original(
                    cx - bboxes[bbox_idx] * stride_f,
                    cy - bboxes[bbox_idx + 1] * stride_f,
                );
                let (x2, y2) = resize_info.to_original(
                    cx + bboxes[bbox_idx + 2] * stride_f,
                    cy + bboxes[bbox_idx + 3] * stride_f,
                );

                let landmarks = kps.as_ref().and_then(|kps_data| {
                    let kps_idx = i * 10;
                    if kps_idx + 9 >= kps_data.len() {
                        return None;
                    }
                    let mut points = [(0.0f32, 0.0f32); 5];
                    for (j, point) in points.iter_mut().enumerate() {
                        *point = resize_info.to_original(
                            cx + kps_data[kps_idx + j * 2] * stride_f,
                            cy + kps_data[kps_idx + j * 2 + 1] * stride_f,
                        );
                    }
                    Some(points)
                });

                all_boxes.push(FaceBox {
                    x1: x1.clamp(0.0, max_x),
                    y1: y1.clamp(0.0, max_y),
                    x2: x2.clamp(0.0, max_x),
                    y2: y2.clamp(0.0, max_y),
                    confidence: score,
                    landmarks,
                });
            }
        }

        debug!("SCRFD produced {} candidates before NMS", all_boxes.len());
        Ok(all_boxes)
    }
}

impl DetectorBackend for ScrfdDetector {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn detect_faces(&self, image: &DynamicImage, align: bool) -> Result<Vec<RawFace>> {
        self.detect_boxes(image)?
            .into_iter()
            .map(|b| {
                let aligned_face = extract_face(image, (b.x1, b.y1, b.x2, b.y2), b.landmarks.as_ref(), align)?;
                Ok(RawFace {
                    x1: b.x1,
                    y1: b.y1,
                    x2: b.x2,
                    y2: b.y2,
                    confidence: b.confidence,
                    landmarks: b.landmarks,
                    aligned_face,
                })
            })
            .collect()
    }
}

/// Treats the whole image as a single face. Useful for pre-cropped inputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipDetector;

impl SkipDetector {
    pub const NAME: &'static str = "skip";
}

impl DetectorBackend for SkipDetector {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn detect_faces(&self, image: &DynamicImage, _align: bool) -> Result<Vec<RawFace>> {
        let (w, h) = image.dimensions();
        let aligned_face = extract_face(image, (0.0, 0.0, w as f32, h as f32), None, false)?;
        Ok(vec![RawFace {
            x1: 0.0,
            y1: 0.0,
            x2: w as f32,
            y2: h as f32,
            confidence: 0.0,
            landmarks: None,
            aligned_face,
        }])
    }
}

/// Copy f32 data into an OpenVINO tensor
pub(crate) fn copy_into_tensor(tensor: &mut Tensor, data: &[f32]) -> Result<()> {
    let raw = tensor.get_raw_data_mut()?;
    let needed = data.len() * std::mem::size_of::<f32>();
    if raw.len() < needed {
        anyhow::bail!("tensor holds {} bytes, input needs {}", raw.len(), needed);
    }
    for (dst, value) in raw.chunks_exact_mut(4).zip(data) {
        dst.copy_from_slice(&value.to_ne_bytes());
    }
    Ok(())
}

/// Read tensor data as f32 vector
pub(crate) fn read_tensor_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    let raw = tensor.get_raw_data()?;
    Ok(raw
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Non-maximum suppression
pub fn nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| compute_iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Compute intersection over union
pub fn compute_iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);

    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);

    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
