//! Face location
//!
//! Runs one detector backend over one image, then applies clipping,
//! confidence filtering, the face cap and the zero-face policy.

use std::num::NonZeroUsize;

use image::{DynamicImage, GenericImageView};
use serde::Serialize;
use tracing::debug;

use crate::config::ZeroFacePolicy;
use crate::engine::preprocess::{extract_face, fit_exact, FACE_INPUT_SIZE};
use crate::engine::{DetectorBackend, RawFace};
use crate::error::{AnalysisError, Result};

/// Face box in source-image pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FacialArea {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// Eye centers as reported by the detector, when it reports landmarks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_eye: Option<(u32, u32)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_eye: Option<(u32, u32)>,
}

impl FacialArea {
    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }
}

/// A face ready for attribute prediction
#[derive(Debug, Clone)]
pub struct DetectedFace {
    /// `FACE_INPUT_SIZE` crop, aligned when requested and possible
    pub aligned_crop: DynamicImage,
    pub region: FacialArea,
    pub confidence: f32,
    pub source_image_index: usize,
}

/// Knobs of the locate step
#[derive(Debug, Clone)]
pub struct LocateOptions {
    pub enforce_detection: bool,
    pub align: bool,
    /// Detections scoring strictly below this are dropped
    pub min_confidence: f32,
    pub zero_face_policy: ZeroFacePolicy,
    /// Keep only the largest N faces
    pub max_faces: Option<NonZeroUsize>,
}

impl Default for LocateOptions {
    fn default() -> Self {
        Self {
            enforce_detection: true,
            align: true,
            min_confidence: 0.0,
            zero_face_policy: ZeroFacePolicy::WholeImage,
            max_faces: None,
        }
    }
}

/// Locate faces of one image
pub fn locate(
    image: &DynamicImage,
    image_index: usize,
    backend: &dyn DetectorBackend,
    options: &LocateOptions,
) -> Result<Vec<DetectedFace>> {
    let raw = backend
        .detect_faces(image, options.align)
        .map_err(|e| AnalysisError::backend(format!("{} detection on image {}", backend.name(), image_index), e))?;

    let reported = raw.len();
    let mut faces: Vec<DetectedFace> = raw
        .into_iter()
        .filter(|f| f.confidence >= options.min_confidence)
        .filter_map(|f| to_detected(f, image, image_index))
        .collect();

    if let Some(limit) = options.max_faces {
        keep_largest(&mut faces, limit.get());
    }

    debug!(
        "Image {}: {} reported by {}, {} kept",
        image_index,
        reported,
        backend.name(),
        faces.len()
    );

    if faces.is_empty() {
        if options.enforce_detection {
            return Err(AnalysisError::NoFaceDetected { index: image_index });
        }
        if options.zero_face_policy == ZeroFacePolicy::WholeImage {
            faces.push(whole_image_face(image, image_index)?);
        }
    }

    Ok(faces)
}

/// Clip a backend face to the image; degenerate boxes are dropped
fn to_detected(raw: RawFace, image: &DynamicImage, image_index: usize) -> Option<DetectedFace> {
    let (img_w, img_h) = image.dimensions();
    let clip = |v: f32, max: u32| v.max(0.0).min(max as f32) as u32;

    let x = clip(raw.x1, img_w);
    let y = clip(raw.y1, img_h);
    let w = clip(raw.x2, img_w).saturating_sub(x);
    let h = clip(raw.y2, img_h).saturating_sub(y);
    if w == 0 || h == 0 {
        debug!("Image {}: dropping degenerate box {:?}", image_index, (raw.x1, raw.y1, raw.x2, raw.y2));
        return None;
    }

    let eye = |p: (f32, f32)| (clip(p.0, img_w), clip(p.1, img_h));

    Some(DetectedFace {
        aligned_crop: fit_exact(&raw.aligned_face, FACE_INPUT_SIZE),
        region: FacialArea {
            x,
            y,
            w,
            h,
            left_eye: raw.landmarks.map(|l| eye(l[0])),
            right_eye: raw.landmarks.map(|l| eye(l[1])),
        },
        confidence: raw.confidence,
        source_image_index: image_index,
    })
}

/// Keep the `limit` largest faces, preserving detection order
fn keep_largest(faces: &mut Vec<DetectedFace>, limit: usize) {
    if faces.len() <= limit {
        return;
    }
    let mut by_area: Vec<usize> = (0..faces.len()).collect();
    by_area.sort_by(|&a, &b| faces[b].region.area().cmp(&faces[a].region.area()));
    let mut keep = vec![false; faces.len()];
    for &idx in by_area.iter().take(limit) {
        keep[idx] = true;
    }
    let mut flags = keep.into_iter();
    faces.retain(|_| flags.next().unwrap_or(false));
}

/// Whole image as one unaligned face with confidence 0
fn whole_image_face(image: &DynamicImage, image_index: usize) -> Result<DetectedFace> {
    let (w, h) = image.dimensions();
    let crop = extract_face(image, (0.0, 0.0, w as f32, h as f32), None, false)
        .map_err(|e| AnalysisError::backend("whole-image crop", e))?;

    Ok(DetectedFace {
        aligned_crop: crop,
        region: FacialArea { x: 0, y: 0, w, h, left_eye: None, right_eye: None },
        confidence: 0.0,
        source_image_index: image_index,
    })
}
