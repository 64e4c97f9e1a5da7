use image::{ColorType, ImageFormat};
use image_hasher::HashAlg;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const LOCAL_CONFIG_FILE: &str = "wildclean.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub layout: LayoutConfig,

    /// Species processed when none are named on the command line.
    #[serde(default)]
    pub species: Vec<String>,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub canonical: CanonicalConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub parallel: bool,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,

    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,

    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,
}

fn default_raw_dir() -> PathBuf {
    PathBuf::from("data/raw")
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("data/metadata")
}

fn default_metadata_file() -> String {
    "metadata.csv".to_string()
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            raw_dir: default_raw_dir(),
            metadata_dir: default_metadata_dir(),
            metadata_file: default_metadata_file(),
        }
    }
}

impl LayoutConfig {
    /// Re-root both directories under `root`, as `--data-root` does.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            raw_dir: root.join("raw"),
            metadata_dir: root.join("metadata"),
            metadata_file: default_metadata_file(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_min_side")]
    pub min_width: u32,

    #[serde(default = "default_min_side")]
    pub min_height: u32,
}

fn default_min_side() -> u32 {
    224
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_width: default_min_side(),
            min_height: default_min_side(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalFormat {
    #[default]
    Jpeg,
    Png,
}

impl CanonicalFormat {
    pub fn image_format(&self) -> ImageFormat {
        match self {
            CanonicalFormat::Jpeg => ImageFormat::Jpeg,
            CanonicalFormat::Png => ImageFormat::Png,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Colorspace {
    #[default]
    Rgb,
    Luma,
}

impl Colorspace {
    pub fn color_type(&self) -> ColorType {
        match self {
            Colorspace::Rgb => ColorType::Rgb8,
            Colorspace::Luma => ColorType::L8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalConfig {
    #[serde(default)]
    pub format: CanonicalFormat,

    /// Extension without the leading dot.
    #[serde(default = "default_extension")]
    pub extension: String,

    #[serde(default)]
    pub colorspace: Colorspace,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_extension() -> String {
    "jpg".to_string()
}

fn default_jpeg_quality() -> u8 {
    75
}

impl Default for CanonicalConfig {
    fn default() -> Self {
        Self {
            format: CanonicalFormat::default(),
            extension: default_extension(),
            colorspace: Colorspace::default(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndexScope {
    #[default]
    Global,
    PerSpecies,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Exact,
    Near,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintAlgorithm {
    #[default]
    Mean,
    Gradient,
    VertGradient,
    DoubleGradient,
    Blockhash,
}

impl FingerprintAlgorithm {
    pub fn hash_alg(&self) -> HashAlg {
        match self {
            FingerprintAlgorithm::Mean => HashAlg::Mean,
            FingerprintAlgorithm::Gradient => HashAlg::Gradient,
            FingerprintAlgorithm::VertGradient => HashAlg::VertGradient,
            FingerprintAlgorithm::DoubleGradient => HashAlg::DoubleGradient,
            FingerprintAlgorithm::Blockhash => HashAlg::Blockhash,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default)]
    pub scope: IndexScope,

    #[serde(default)]
    pub mode: MatchMode,

    /// Hamming distance still counted as a duplicate in `near` mode.
    #[serde(default)]
    pub max_distance: u32,

    #[serde(default)]
    pub algorithm: FingerprintAlgorithm,

    #[serde(default = "default_hash_size")]
    pub hash_size: u32,

    #[serde(default = "default_dct")]
    pub dct: bool,
}

fn default_hash_size() -> u32 {
    8
}

fn default_dct() -> bool {
    true
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            scope: IndexScope::default(),
            mode: MatchMode::default(),
            max_distance: 0,
            algorithm: FingerprintAlgorithm::default(),
            hash_size: default_hash_size(),
            dct: default_dct(),
        }
    }
}

fn default_chunk_size() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            layout: LayoutConfig::default(),
            species: Vec::new(),
            validation: ValidationConfig::default(),
            canonical: CanonicalConfig::default(),
            dedup: DedupConfig::default(),
            parallel: false,
            chunk_size: default_chunk_size(),
        }
    }
}

impl Config {
    /// Load from `path` if given, else from the first config file found in the
    /// working directory or the user config directory, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::discover(),
        };

        let config = match candidate {
            Some(p) => Self::from_file(&p)?,
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.is_file() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|d| d.join("wildclean").join("config.toml"))
            .filter(|p| p.is_file())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.validation.min_width == 0 || self.validation.min_height == 0 {
            return Err(ConfigError::Invalid(
                "minimum width and height must be at least 1".into(),
            ));
        }
        let ext = self.canonical.extension.trim_start_matches('.');
        if ext.is_empty() || ext.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "canonical extension {:?} is not a usable file extension",
                self.canonical.extension
            )));
        }
        if !(1..=100).contains(&self.canonical.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "jpeg_quality must be within 1..=100, got {}",
                self.canonical.jpeg_quality
            )));
        }
        if self.dedup.hash_size == 0 {
            return Err(ConfigError::Invalid("hash_size must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Canonical extension with any leading dot stripped.
    pub fn canonical_extension(&self) -> &str {
        self.canonical.extension.trim_start_matches('.')
    }
}
