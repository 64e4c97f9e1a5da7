pub mod config;
pub mod core;
pub mod logging;

pub use crate::config::Config;
pub use crate::core::duplicate::FingerprintIndex;
pub use crate::core::scanner::{CleanOptions, CorpusWalker, RunSummary, SpeciesReport, run};
