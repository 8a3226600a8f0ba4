//! Image preprocessing utilities for face analysis

use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb};
use ndarray::{Array4, ArrayViewMut3};
use anyhow::{Result, Context};

/// Standard input size for face detection (SCRFD)
pub const DETECTOR_INPUT_SIZE: (u32, u32) = (640, 640);

/// Size of every face crop handed to attribute predictors
pub const FACE_INPUT_SIZE: (u32, u32) = (224, 224);

/// Input size of the emotion model (grayscale)
pub const EMOTION_INPUT_SIZE: (u32, u32) = (48, 48);

/// Reference 5-point landmarks for a 112x112 aligned face (InsightFace standard)
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),  // left eye
    (73.5318, 51.5014),  // right eye
    (56.0252, 71.7366),  // nose
    (41.5493, 92.3655),  // left mouth
    (70.7299, 92.2041),  // right mouth
];

/// Preprocess image for detection model
/// Resizes to 640x640 with letterbox padding and normalizes to [-1, 1]
pub fn preprocess_for_detection(image: &DynamicImage) -> Result<Array4<f32>> {
    let (target_w, target_h) = DETECTOR_INPUT_SIZE;

    let resized = resize_with_padding(image, target_w, target_h);

    let mut tensor = Array4::<f32>::zeros((1, 3, target_h as usize, target_w as usize));
    write_bgr_normalized(tensor.index_axis_mut(ndarray::Axis(0), 0), &resized);

    Ok(tensor)
}

/// Build an NCHW RGB batch tensor in [0, 1] from face crops
pub fn faces_to_rgb_batch(faces: &[&DynamicImage], size: (u32, u32)) -> Array4<f32> {
    let (target_w, target_h) = size;
    let mut batch = Array4::<f32>::zeros((faces.len(), 3, target_h as usize, target_w as usize));

    for (i, face) in faces.iter().enumerate() {
        let rgb = fit_exact(face, size).to_rgb8();
        let mut slot = batch.index_axis_mut(ndarray::Axis(0), i);
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            slot[[0, y, x]] = pixel[0] as f32 / 255.0;
            slot[[1, y, x]] = pixel[1] as f32 / 255.0;
            slot[[2, y, x]] = pixel[2] as f32 / 255.0;
        }
    }

    batch
}

/// Build an N1HW grayscale batch tensor in [0, 1] from face crops
pub fn faces_to_gray_batch(faces: &[&DynamicImage], size: (u32, u32)) -> Array4<f32> {
    let (target_w, target_h) = size;
    let mut batch = Array4::<f32>::zeros((faces.len(), 1, target_h as usize, target_w as usize));

    for (i, face) in faces.iter().enumerate() {
        let gray = fit_exact(face, size).to_luma8();
        for (x, y, pixel) in gray.enumerate_pixels() {
            batch[[i, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        }
    }

    batch
}

/// Resize only when the dimensions differ
pub fn fit_exact(image: &DynamicImage, size: (u32, u32)) -> DynamicImage {
    if image.dimensions() == size {
        image.clone()
    } else {
        image.resize_exact(size.0, size.1, image::imageops::FilterType::Triangle)
    }
}

/// Resize image with padding to maintain aspect ratio
fn resize_with_padding(image: &DynamicImage, target_w: u32, target_h: u32) -> DynamicImage {
    let info = ResizeInfo::new(image.dimensions(), (target_w, target_h));
    let new_w = ((info.original_width as f32 * info.scale) as u32).max(1);
    let new_h = ((info.original_height as f32 * info.scale) as u32).max(1);

    let resized = image.resize_exact(new_w, new_h, image::imageops::FilterType::Triangle);

    let mut padded = ImageBuffer::from_pixel(target_w, target_h, Rgb([0u8, 0, 0]));
    image::imageops::replace(&mut padded, &resized.to_rgb8(), info.offset_x as i64, info.offset_y as i64);

    DynamicImage::ImageRgb8(padded)
}

/// Write one CHW slot in BGR order normalized to [-1, 1]
/// (SCRFD is trained with swapRB in cv2.dnn.blobFromImage)
fn write_bgr_normalized(mut slot: ArrayViewMut3<f32>, image: &DynamicImage) {
    let rgb = image.to_rgb8();
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        slot[[0, y, x]] = (pixel[2] as f32 - 127.5) / 128.0;
        slot[[1, y, x]] = (pixel[1] as f32 - 127.5) / 128.0;
        slot[[2, y, x]] = (pixel[0] as f32 - 127.5) / 128.0;
    }
}

/// Extract a face region from image given a bounding box
pub fn crop_face(
    image: &DynamicImage,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    margin: f32,
) -> DynamicImage {
    let (img_w, img_h) = image.dimensions();

    let w = x2 - x1;
    let h = y2 - y1;
    let margin_x = w * margin;
    let margin_y = h * margin;

    let x1 = (x1 - margin_x).clamp(0.0, img_w as f32) as u32;
    let y1 = (y1 - margin_y).clamp(0.0, img_h as f32) as u32;
    let x2 = (x2 + margin_x).clamp(0.0, img_w as f32) as u32;
    let y2 = (y2 + margin_y).clamp(0.0, img_h as f32) as u32;

    // Degenerate boxes fall back to a single pixel so the crop is never empty
    let w = x2.saturating_sub(x1).max(1).min(img_w.saturating_sub(x1).max(1));
    let h = y2.saturating_sub(y1).max(1).min(img_h.saturating_sub(y1).max(1));

    image.crop_imm(x1, y1, w, h)
}

/// Crop (and optionally align) a detected face into a predictor-ready crop
pub fn extract_face(
    image: &DynamicImage,
    bbox: (f32, f32, f32, f32),
    landmarks: Option<&[(f32, f32); 5]>,
    align: bool,
) -> Result<DynamicImage> {
    match landmarks {
        Some(points) if align => align_face(image, points, FACE_INPUT_SIZE.0),
        _ => {
            let (x1, y1, x2, y2) = bbox;
            let crop = crop_face(image, x1, y1, x2, y2, 0.0);
            Ok(fit_exact(&crop, FACE_INPUT_SIZE))
        }
    }
}

/// Align face using 5-point landmarks onto a `size`x`size` canvas
pub fn align_face(
    image: &DynamicImage,
    landmarks: &[(f32, f32); 5],
    size: u32,
) -> Result<DynamicImage> {
    let scale = size as f32 / 112.0;
    let mut dst_points = REFERENCE_LANDMARKS_112;
    for point in dst_points.iter_mut() {
        point.0 *= scale;
        point.1 *= scale;
    }

    let transform = estimate_similarity_transform(landmarks, &dst_points)
        .context("Failed to estimate alignment transform")?;

    Ok(apply_affine_transform(image, &transform, size, size))
}

/// Estimate similarity transformation matrix from source to destination points
/// Uses the Umeyama algorithm for 2D similarity transformation
fn estimate_similarity_transform(
    src: &[(f32, f32); 5],
    dst: &[(f32, f32); 5],
) -> Result<[[f32; 3]; 2]> {
    let n = 5.0f32;

    let (mut src_cx, mut src_cy) = (0.0f32, 0.0f32);
    let (mut dst_cx, mut dst_cy) = (0.0f32, 0.0f32);
    for i in 0..5 {
        src_cx += src[i].0;
        src_cy += src[i].1;
        dst_cx += dst[i].0;
        dst_cy += dst[i].1;
    }
    src_cx /= n;
    src_cy /= n;
    dst_cx /= n;
    dst_cy /= n;

    // Sigma = 1/n * sum( (dst_i - dst_mean) * (src_i - src_mean)^T )
    let mut var_src = 0.0f32;
    let (mut a, mut b, mut c, mut d) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
    for i in 0..5 {
        let sx = src[i].0 - src_cx;
        let sy = src[i].1 - src_cy;
        let dx = dst[i].0 - dst_cx;
        let dy = dst[i].1 - dst_cy;

        var_src += sx * sx + sy * sy;
        a += dx * sx;
        b += dx * sy;
        c += dy * sx;
        d += dy * sy;
    }
    var_src /= n;
    a /= n;
    b /= n;
    c /= n;
    d /= n;

    if var_src <= 1e-10 {
        anyhow::bail!("landmarks are degenerate (zero variance)");
    }

    // Closed-form 2x2 SVD
    let e = (a + d) / 2.0;
    let f = (a - d) / 2.0;
    let g = (c + b) / 2.0;
    let h = (c - b) / 2.0;

    let q = (e * e + h * h).sqrt();
    let r = (f * f + g * g).sqrt();

    let s1 = q + r;
    let s2 = (q - r).abs();

    let a1 = h.atan2(e);
    let a2 = g.atan2(f);
    let theta = (a2 - a1) / 2.0;
    let phi = (a2 + a1) / 2.0;

    let det_sigma = a * d - b * c;

    // R = U * diag(1, sign(det)) * V^T, no reflection allowed
    let (r00, r01, r10, r11) = if det_sigma >= 0.0 {
        let angle = phi - theta;
        (angle.cos(), -angle.sin(), angle.sin(), angle.cos())
    } else {
        let angle = phi + theta;
        (angle.cos(), angle.sin(), angle.sin(), -angle.cos())
    };

    let trace_sd = if det_sigma >= 0.0 { s1 + s2 } else { s1 - s2 };
    let scale = trace_sd / var_src;

    let tx = dst_cx - scale * (r00 * src_cx + r01 * src_cy);
    let ty = dst_cy - scale * (r10 * src_cx + r11 * src_cy);

    Ok([
        [scale * r00, scale * r01, tx],
        [scale * r10, scale * r11, ty],
    ])
}

/// Apply affine transformation to image (backward mapping, bilinear)
fn apply_affine_transform(
    image: &DynamicImage,
    transform: &[[f32; 3]; 2],
    out_width: u32,
    out_height: u32,
) -> DynamicImage {
    let rgb = image.to_rgb8();
    let mut output = ImageBuffer::from_pixel(out_width, out_height, Rgb([0u8, 0, 0]));

    let det = transform[0][0] * transform[1][1] - transform[0][1] * transform[1][0];
    if det.abs() < f32::EPSILON || rgb.width() < 2 || rgb.height() < 2 {
        return DynamicImage::ImageRgb8(output);
    }
    let inv = [
        [transform[1][1] / det, -transform[0][1] / det],
        [-transform[1][0] / det, transform[0][0] / det],
    ];

    for y in 0..out_height {
        for x in 0..out_width {
            let dx = x as f32 - transform[0][2];
            let dy = y as f32 - transform[1][2];

            let src_x = inv[0][0] * dx + inv[0][1] * dy;
            let src_y = inv[1][0] * dx + inv[1][1] * dy;

            if src_x >= 0.0 && src_x < (rgb.width() - 1) as f32
                && src_y >= 0.0 && src_y < (rgb.height() - 1) as f32
            {
                let x0 = src_x as u32;
                let y0 = src_y as u32;
                let fx = src_x - x0 as f32;
                let fy = src_y - y0 as f32;

                let p00 = rgb.get_pixel(x0, y0);
                let p01 = rgb.get_pixel(x0, y0 + 1);
                let p10 = rgb.get_pixel(x0 + 1, y0);
                let p11 = rgb.get_pixel(x0 + 1, y0 + 1);

                let mut pixel = [0u8; 3];
                for ch in 0..3 {
                    let v = p00[ch] as f32 * (1.0 - fx) * (1.0 - fy)
                        + p10[ch] as f32 * fx * (1.0 - fy)
                        + p01[ch] as f32 * (1.0 - fx) * fy
                        + p11[ch] as f32 * fx * fy;
                    pixel[ch] = v.clamp(0.0, 255.0) as u8;
                }

                output.put_pixel(x, y, Rgb(pixel));
            }
        }
    }

    DynamicImage::ImageRgb8(output)
}

/// Decode image from bytes with EXIF orientation handling
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(data).context("Failed to decode image")?;
    Ok(apply_exif_orientation(data, image))
}

/// Apply EXIF orientation to correct image rotation
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    use std::io::Cursor;

    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    };

    // See: https://exiftool.org/TagNames/EXIF.html (Orientation)
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Letterbox parameters for mapping detections back to the source image
pub struct ResizeInfo {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub original_width: u32,
    pub original_height: u32,
}

impl ResizeInfo {
    pub fn new(original: (u32, u32), target: (u32, u32)) -> Self {
        let (orig_w, orig_h) = original;
        let (target_w, target_h) = target;

        let scale = f32::min(
            target_w as f32 / orig_w.max(1) as f32,
            target_h as f32 / orig_h.max(1) as f32,
        );

        let new_w = ((orig_w as f32 * scale) as u32).min(target_w);
        let new_h = ((orig_h as f32 * scale) as u32).min(target_h);

        Self {
            scale,
            offset_x: (target_w - new_w) / 2,
            offset_y: (target_h - new_h) / 2,
            original_width: orig_w,
            original_height: orig_h,
        }
    }

    /// Convert detection coordinates back to original image space
    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        let x = (x - self.offset_x as f32) / self.scale;
        let y = (y - self.offset_y as f32) / self.scale;
        (x, y)
    }
}
