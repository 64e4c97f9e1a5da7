// Read-only table/filesystem consistency check, for reconciling a species after an
// interrupted pass.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use walkdir::WalkDir;

use crate::core::metadata::{TableError, read_table};
use crate::core::scanner::SpeciesPaths;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub species: String,
    pub rows: usize,
    /// `(occurrenceID, imageFile)` of rows whose file does not exist.
    pub missing_files: Vec<(String, String)>,
    /// Files referenced by more than one row.
    pub shared_files: Vec<String>,
    /// Occurrence identifiers appearing on more than one row.
    pub repeated_ids: Vec<String>,
    /// Files in the species directory that no row references.
    pub orphans: Vec<PathBuf>,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_files.is_empty()
            && self.shared_files.is_empty()
            && self.repeated_ids.is_empty()
            && self.orphans.is_empty()
    }
}

pub fn audit_species(paths: &SpeciesPaths) -> Result<AuditReport, TableError> {
    let rows = read_table(&paths.table_path)?.rows;

    let mut report = AuditReport {
        species: paths.species.clone(),
        rows: rows.len(),
        ..AuditReport::default()
    };

    let mut file_uses: BTreeMap<String, usize> = BTreeMap::new();
    let mut id_uses: BTreeMap<&str, usize> = BTreeMap::new();
    for row in &rows {
        *id_uses.entry(row.occurrence_id.as_str()).or_default() += 1;

        let Some(name) = row.file_name() else {
            report
                .missing_files
                .push((row.occurrence_id.clone(), row.image_file.clone()));
            continue;
        };
        *file_uses.entry(name.to_string()).or_default() += 1;
        if !paths.image_dir.join(name).is_file() {
            report
                .missing_files
                .push((row.occurrence_id.clone(), row.image_file.clone()));
        }
    }

    report.shared_files = file_uses
        .iter()
        .filter(|(_, n)| **n > 1)
        .map(|(name, _)| name.clone())
        .collect();
    report.repeated_ids = id_uses
        .iter()
        .filter(|(_, n)| **n > 1)
        .map(|(id, _)| id.to_string())
        .collect();

    let referenced: BTreeSet<&str> = file_uses.keys().map(String::as_str).collect();
    if paths.image_dir.is_dir() {
        for entry in WalkDir::new(&paths.image_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if !referenced.contains(name.as_ref()) {
                report.orphans.push(entry.path().to_path_buf());
            }
        }
    }

    Ok(report)
}
