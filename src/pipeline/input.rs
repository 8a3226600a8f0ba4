//! Input normalization
//!
//! Resolves the caller's image argument into an ordered list of decoded
//! images plus the batch flag that decides result nesting.

use std::path::PathBuf;

use image::{DynamicImage, GenericImageView, RgbImage};
use ndarray::{Array4, Axis};
use tracing::debug;

use crate::engine::preprocess::decode_image;
use crate::error::{AnalysisError, Result};

/// One image, not yet decoded
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// File on disk
    Path(PathBuf),
    /// Encoded file contents (JPEG, PNG, ...)
    Bytes(Vec<u8>),
    /// Already decoded pixels
    Image(DynamicImage),
}

/// Everything `analyze` accepts
#[derive(Debug, Clone)]
pub enum ImageInput {
    Single(ImageSource),
    List(Vec<ImageSource>),
    /// `N x H x W x 3` RGB pixels
    Stacked(Array4<u8>),
}

impl ImageInput {
    /// Whether results are nested one list per source image
    pub fn batch_mode(&self) -> bool {
        !matches!(self, ImageInput::Single(_))
    }
}

impl From<ImageSource> for ImageInput {
    fn from(source: ImageSource) -> Self {
        ImageInput::Single(source)
    }
}

impl From<&str> for ImageSource {
    fn from(path: &str) -> Self {
        ImageSource::Path(PathBuf::from(path))
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

impl From<DynamicImage> for ImageSource {
    fn from(image: DynamicImage) -> Self {
        ImageSource::Image(image)
    }
}

impl From<&str> for ImageInput {
    fn from(path: &str) -> Self {
        ImageInput::Single(path.into())
    }
}

impl From<PathBuf> for ImageInput {
    fn from(path: PathBuf) -> Self {
        ImageInput::Single(path.into())
    }
}

impl From<DynamicImage> for ImageInput {
    fn from(image: DynamicImage) -> Self {
        ImageInput::Single(image.into())
    }
}

impl<T: Into<ImageSource>> From<Vec<T>> for ImageInput {
    fn from(items: Vec<T>) -> Self {
        ImageInput::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<Array4<u8>> for ImageInput {
    fn from(stack: Array4<u8>) -> Self {
        ImageInput::Stacked(stack)
    }
}

/// Canonical form every later stage works on
#[derive(Debug)]
pub struct NormalizedInput {
    pub images: Vec<DynamicImage>,
    pub batch_mode: bool,
}

/// Decode and flatten the input, eagerly, in source order
pub fn normalize(input: ImageInput) -> Result<NormalizedInput> {
    let batch_mode = input.batch_mode();

    let images = match input {
        ImageInput::Single(source) => vec![load(source, 0)?],
        ImageInput::List(sources) => sources
            .into_iter()
            .enumerate()
            .map(|(index, source)| load(source, index))
            .collect::<Result<Vec<_>>>()?,
        ImageInput::Stacked(stack) => split_stack(&stack)?,
    };

    debug!("Normalized input into {} image(s), batch_mode={}", images.len(), batch_mode);
    Ok(NormalizedInput { images, batch_mode })
}

fn load(source: ImageSource, index: usize) -> Result<DynamicImage> {
    let image = match source {
        ImageSource::Image(image) => image,
        ImageSource::Bytes(bytes) => {
            decode_image(&bytes).map_err(|e| AnalysisError::invalid_image(index, format!("{:#}", e)))?
        }
        ImageSource::Path(path) => {
            let bytes = std::fs::read(&path).map_err(|e| {
                AnalysisError::invalid_image(index, format!("cannot read {}: {}", path.display(), e))
            })?;
            decode_image(&bytes).map_err(|e| {
                AnalysisError::invalid_image(index, format!("{}: {:#}", path.display(), e))
            })?
        }
    };

    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Err(AnalysisError::invalid_image(index, "image has a zero dimension"));
    }
    Ok(image)
}

/// Split an `N x H x W x 3` stack along the batch axis
fn split_stack(stack: &Array4<u8>) -> Result<Vec<DynamicImage>> {
    let (_, h, w, c) = stack.dim();

    stack
        .axis_iter(Axis(0))
        .enumerate()
        .map(|(index, view)| {
            if c != 3 {
                return Err(AnalysisError::invalid_image(
                    index,
                    format!("stacked images must have 3 channels, got {}", c),
                ));
            }
            if h == 0 || w == 0 {
                return Err(AnalysisError::invalid_image(index, "image has a zero dimension"));
            }
            let pixels: Vec<u8> = view.iter().copied().collect();
            RgbImage::from_raw(w as u32, h as u32, pixels)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| AnalysisError::invalid_image(index, "pixel buffer size mismatch"))
        })
        .collect()
}
