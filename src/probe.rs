use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageProbe {
    pub file_bytes: u64,
    pub width: u32,
    pub height: u32,
}

impl ImageProbe {
    pub fn megapixels(&self) -> f64 {
        f64::from(self.width) * f64::from(self.height) / 1_000_000.0
    }

    pub fn file_size_mb(&self) -> f64 {
        self.file_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Size and pixel dimensions of a source image, read from the header only.
///
/// A missing file is an error; a format the decoder does not know is logged
/// and reported with zero dimensions.
pub fn probe_image(path: &Path) -> Result<ImageProbe> {
    let meta = std::fs::metadata(path)
        .map_err(|e| Error::io(format!("stat input image {}", path.display()), e))?;
    let (width, height) = match image::image_dimensions(path) {
        Ok(dims) => dims,
        Err(image::ImageError::IoError(e)) => {
            return Err(Error::io(format!("reading input image {}", path.display()), e));
        }
        Err(e) => {
            warn!("cannot read dimensions of {}: {e}", path.display());
            (0, 0)
        }
    };
    Ok(ImageProbe {
        file_bytes: meta.len(),
        width,
        height,
    })
}
