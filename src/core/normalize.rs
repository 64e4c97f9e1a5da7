use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ImageError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::config::{CanonicalConfig, CanonicalFormat, Colorspace};
use crate::core::image::DecodedImage;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Failed to encode canonical image: {0}")]
    Encode(#[from] ImageError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// What has to happen on disk to make an image canonical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizePlan {
    /// Already canonical.
    Keep,
    /// Encoding is canonical, only the extension is not.
    Rename,
    /// Canonical bytes to write under the canonical extension.
    Reencode { bytes: Vec<u8> },
}

/// A plan plus the pixels the fingerprint must be taken from.
#[derive(Debug)]
pub struct Normalized {
    pub plan: NormalizePlan,
    pub image: DynamicImage,
}

pub struct FormatNormalizer {
    canonical: CanonicalConfig,
}

impl FormatNormalizer {
    pub fn new(canonical: CanonicalConfig) -> Self {
        Self { canonical }
    }

    fn extension(&self) -> &str {
        self.canonical.extension.trim_start_matches('.')
    }

    /// Decide what `source` needs. Touches no files, so it is safe to run in parallel.
    pub fn plan(&self, decoded: DecodedImage, source: &Path) -> Result<Normalized, NormalizeError> {
        let format_ok = decoded.format == self.canonical.format.image_format();
        let color_ok = decoded.image.color() == self.canonical.colorspace.color_type();

        if format_ok && color_ok {
            let plan = if self.has_canonical_extension(source) {
                NormalizePlan::Keep
            } else {
                NormalizePlan::Rename
            };
            return Ok(Normalized {
                plan,
                image: decoded.image,
            });
        }

        let converted = match self.canonical.colorspace {
            Colorspace::Rgb => DynamicImage::ImageRgb8(decoded.image.to_rgb8()),
            Colorspace::Luma => DynamicImage::ImageLuma8(decoded.image.to_luma8()),
        };
        let bytes = self.encode(&converted)?;
        // Fingerprint what will actually be on disk, not the pre-encode pixels.
        let image = image::load_from_memory_with_format(&bytes, self.canonical.format.image_format())?;

        Ok(Normalized {
            plan: NormalizePlan::Reencode { bytes },
            image,
        })
    }

    fn encode(&self, image: &DynamicImage) -> Result<Vec<u8>, ImageError> {
        let mut bytes = Vec::new();
        match self.canonical.format {
            CanonicalFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut bytes, self.canonical.jpeg_quality);
                image.write_with_encoder(encoder)?;
            }
            CanonicalFormat::Png => {
                image.write_with_encoder(PngEncoder::new(&mut bytes))?;
            }
        }
        Ok(bytes)
    }

    pub fn has_canonical_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(self.extension()))
    }

    /// Where `source` ends up under `plan`. Never names an existing file other than `source`.
    pub fn target_for(&self, plan: &NormalizePlan, source: &Path) -> PathBuf {
        match plan {
            NormalizePlan::Keep => source.to_path_buf(),
            NormalizePlan::Rename | NormalizePlan::Reencode { .. } => self.free_target(source),
        }
    }

    fn free_target(&self, source: &Path) -> PathBuf {
        let dir = source.parent().unwrap_or(Path::new(""));
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = self.extension();

        let mut candidate = dir.join(format!("{}.{}", stem, ext));
        let mut n = 1;
        while candidate != source && candidate.exists() {
            candidate = dir.join(format!("{}_{}.{}", stem, n, ext));
            n += 1;
        }
        candidate
    }

    /// Carry out `plan` for `source` and return the final path.
    pub fn apply(&self, plan: &NormalizePlan, source: &Path) -> Result<PathBuf, NormalizeError> {
        let target = self.target_for(plan, source);
        match plan {
            NormalizePlan::Keep => {}
            NormalizePlan::Rename => {
                fs::rename(source, &target).map_err(|e| io_error(&target, e))?;
            }
            NormalizePlan::Reencode { bytes } => {
                write_atomic(&target, bytes)?;
                if target != source {
                    fs::remove_file(source).map_err(|e| io_error(source, e))?;
                }
            }
        }
        Ok(target)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> NormalizeError {
    NormalizeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `bytes` to a sibling temporary file and rename it over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), NormalizeError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_error(path, e))?;
    tmp.write_all(bytes).map_err(|e| io_error(path, e))?;
    tmp.as_file().sync_all().map_err(|e| io_error(path, e))?;
    tmp.persist(path).map_err(|e| io_error(path, e.error))?;
    Ok(())
}
