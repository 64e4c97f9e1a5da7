use image::{DynamicImage, ImageFormat, ImageReader};
use std::fs;
use std::io;
use std::path::Path;

use crate::config::ValidationConfig;

/// A candidate that decoded cleanly and meets the resolution floor.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub format: ImageFormat,
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Outcome of inspecting one candidate file.
#[derive(Debug)]
pub enum Inspection {
    Valid(DecodedImage),
    /// Nothing to inspect: the path is gone or is not a regular file.
    Missing,
    Corrupt { reason: String },
    SubResolution { width: u32, height: u32 },
}

pub struct ImageValidator {
    rules: ValidationConfig,
}

impl ImageValidator {
    pub fn new(rules: ValidationConfig) -> Self {
        Self { rules }
    }

    /// Decode `path` fully and classify it.
    ///
    /// Every decode failure is reported as [`Inspection::Corrupt`]. A path that is gone or
    /// is not a regular file (a directory, a socket) is [`Inspection::Missing`], so nothing
    /// ever tries to delete it. Only failures to reach the file at all come back as `Err`.
    pub fn inspect(&self, path: &Path) -> io::Result<Inspection> {
        match fs::metadata(path) {
            Ok(meta) if !meta.is_file() => return Ok(Inspection::Missing),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Inspection::Missing),
            Err(e) => return Err(e),
        }

        let reader = match ImageReader::open(path) {
            Ok(reader) => reader,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Inspection::Missing),
            Err(e) => return Err(e),
        };

        // Content sniffing wins over the extension; scraped files are often misnamed.
        let reader = match reader.with_guessed_format() {
            Ok(reader) => reader,
            Err(e) => {
                return Ok(Inspection::Corrupt {
                    reason: format!("unreadable header: {}", e),
                });
            }
        };

        let Some(format) = reader.format() else {
            return Ok(Inspection::Corrupt {
                reason: "unrecognized image format".to_string(),
            });
        };

        let image = match reader.decode() {
            Ok(image) => image,
            Err(e) => {
                return Ok(Inspection::Corrupt {
                    reason: e.to_string(),
                });
            }
        };

        Ok(self.classify(DecodedImage { image, format }))
    }

    pub fn classify(&self, decoded: DecodedImage) -> Inspection {
        let (width, height) = (decoded.width(), decoded.height());
        if width < self.rules.min_width || height < self.rules.min_height {
            Inspection::SubResolution { width, height }
        } else {
            Inspection::Valid(decoded)
        }
    }
}
