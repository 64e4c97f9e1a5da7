use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const HISTORY_FILE: &str = ".history.jsonl";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to open history file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to append to history file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to encode history record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HistoryAction {
    DeletedCorrupt { reason: String },
    DeletedSubResolution { width: u32, height: u32 },
    DeletedDuplicate { kept: String, distance: u32 },
    Normalized { to: String },
    TableWritten { kept: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: DateTime<Utc>,
    pub species: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurrence_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(flatten)]
    pub action: HistoryAction,
}

/// Append-only journal of everything a cleaning pass changed on disk.
pub struct History {
    path: PathBuf,
    species: String,
    out: File,
}

impl History {
    pub fn open(dir: &Path, species: &str) -> Result<Self, HistoryError> {
        let path = dir.join(HISTORY_FILE);
        let out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| HistoryError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            species: species.to_string(),
            out,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(
        &mut self,
        occurrence_id: Option<&str>,
        file: Option<&Path>,
        action: HistoryAction,
    ) -> Result<(), HistoryError> {
        let record = HistoryRecord {
            timestamp: Utc::now(),
            species: self.species.clone(),
            occurrence_id: occurrence_id.map(str::to_string),
            file: file.map(|p| p.to_string_lossy().into_owned()),
            action,
        };
        writeln!(self.out, "{}", serde_json::to_string(&record)?).map_err(|source| {
            HistoryError::Write {
                path: self.path.clone(),
                source,
            }
        })
    }
}

/// Read a journal, skipping malformed lines.
pub fn read_history(dir: &Path) -> Result<Vec<HistoryRecord>, HistoryError> {
    let path = dir.join(HISTORY_FILE);
    let f = File::open(&path).map_err(|source| HistoryError::Open {
        path: path.clone(),
        source,
    })?;

    let mut records = Vec::new();
    for (i, line) in BufReader::new(f).lines().enumerate() {
        let line = line.map_err(|source| HistoryError::Open {
            path: path.clone(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoryRecord>(&line) {
            Ok(rec) => records.push(rec),
            Err(err) => tracing::warn!("Skipping malformed history entry {}: {}", i, err),
        }
    }
    Ok(records)
}
