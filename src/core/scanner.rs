use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::{Config, IndexScope, LayoutConfig};
use crate::core::duplicate::{Admission, FingerprintIndex};
use crate::core::hash::{Fingerprint, Fingerprinter};
use crate::core::history::{History, HistoryAction, HistoryError};
use crate::core::image::{ImageValidator, Inspection};
use crate::core::metadata::{
    MetadataSynchronizer, MetadataTable, ObservationRecord, TableError, read_table,
};
use crate::core::normalize::{FormatNormalizer, NormalizeError, NormalizePlan};

#[derive(Debug, Error)]
pub enum CleanError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Image directory not found: {path}")]
    ImageDirMissing { path: PathBuf },
}

fn io_error(path: &Path, source: io::Error) -> CleanError {
    CleanError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Lower-case with spaces replaced, the way acquisition names species directories.
pub fn sanitize_species_name(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Where one species' images and metadata table live.
#[derive(Debug, Clone)]
pub struct SpeciesPaths {
    pub species: String,
    pub image_dir: PathBuf,
    pub metadata_dir: PathBuf,
    pub table_path: PathBuf,
}

impl SpeciesPaths {
    /// Use `species` verbatim when either of its directories exists, otherwise its
    /// sanitized form.
    pub fn resolve(layout: &LayoutConfig, species: &str) -> Self {
        let verbatim = Self::for_name(layout, species);
        if verbatim.image_dir.is_dir() || verbatim.metadata_dir.is_dir() {
            return verbatim;
        }
        Self::for_name(layout, &sanitize_species_name(species))
    }

    fn for_name(layout: &LayoutConfig, name: &str) -> Self {
        let metadata_dir = layout.metadata_dir.join(name);
        Self {
            species: name.to_string(),
            image_dir: layout.raw_dir.join(name),
            table_path: metadata_dir.join(&layout.metadata_file),
            metadata_dir,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanOptions {
    /// Decide everything but leave disk, table and journal untouched.
    pub dry_run: bool,
    pub show_progress: bool,
}

/// Counts for one species pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpeciesReport {
    pub species: String,
    pub rows: usize,
    pub kept: usize,
    pub missing: usize,
    pub corrupt: usize,
    pub sub_resolution: usize,
    pub duplicates: usize,
    pub shared_files: usize,
    pub normalized: usize,
    pub dry_run: bool,
}

impl SpeciesReport {
    pub fn dropped(&self) -> usize {
        self.rows - self.kept
    }
}

/// Per-row result of the parallelizable stage. Nothing here has touched the disk.
#[derive(Debug)]
enum Prepared {
    Missing,
    Corrupt { reason: String },
    SubResolution { width: u32, height: u32 },
    Candidate { plan: NormalizePlan, fingerprint: Fingerprint },
}

struct PreparedRow {
    path: Option<PathBuf>,
    outcome: Prepared,
}

/// Mutable state of one species pass. Only ever touched sequentially, in row order.
struct PassState<'a> {
    index: &'a mut FingerprintIndex,
    claimed: HashSet<PathBuf>,
    sync: MetadataSynchronizer,
    history: Option<History>,
    report: SpeciesReport,
}

/// Walks a species' metadata rows and drives validate → normalize → dedup → sync.
pub struct CorpusWalker {
    validator: ImageValidator,
    normalizer: FormatNormalizer,
    fingerprinter: Fingerprinter,
    layout: LayoutConfig,
    parallel: bool,
    chunk_size: usize,
    options: CleanOptions,
}

impl CorpusWalker {
    pub fn new(config: &Config, options: CleanOptions) -> Self {
        Self {
            validator: ImageValidator::new(config.validation),
            normalizer: FormatNormalizer::new(config.canonical.clone()),
            fingerprinter: Fingerprinter::new(&config.dedup),
            layout: config.layout.clone(),
            parallel: config.parallel,
            chunk_size: config.chunk_size.max(1),
            options,
        }
    }

    /// Clean one species against `index`. The table is written only if every row was
    /// decided; any fatal error leaves it untouched.
    pub fn clean_species(
        &self,
        species: &str,
        index: &mut FingerprintIndex,
    ) -> Result<SpeciesReport, CleanError> {
        let paths = SpeciesPaths::resolve(&self.layout, species);
        tracing::info!("Cleaning images for species: {}", paths.species);

        let MetadataTable { header, rows } = read_table(&paths.table_path)?;
        if !paths.image_dir.is_dir() {
            return Err(CleanError::ImageDirMissing {
                path: paths.image_dir.clone(),
            });
        }

        let history = if self.options.dry_run {
            None
        } else {
            Some(History::open(&paths.metadata_dir, &paths.species)?)
        };

        let mut state = PassState {
            index,
            claimed: HashSet::new(),
            sync: MetadataSynchronizer::new(&paths.table_path, header),
            history,
            report: SpeciesReport {
                species: paths.species.clone(),
                rows: rows.len(),
                dry_run: self.options.dry_run,
                ..SpeciesReport::default()
            },
        };

        let progress = self.progress_bar(&paths.species, rows.len());

        // Sequential mode prepares and applies one row at a time.
        let chunk_size = if self.parallel { self.chunk_size } else { 1 };
        for chunk in rows.chunks(chunk_size) {
            let prepared: Vec<Result<PreparedRow, CleanError>> = if self.parallel {
                chunk
                    .par_iter()
                    .map(|record| self.prepare(&paths.image_dir, record))
                    .collect()
            } else {
                chunk
                    .iter()
                    .map(|record| self.prepare(&paths.image_dir, record))
                    .collect()
            };

            for (record, prepared) in chunk.iter().zip(prepared) {
                self.apply(record.clone(), prepared?, &mut state)?;
                progress.inc(1);
            }
        }
        progress.finish_and_clear();

        let PassState {
            sync,
            mut history,
            mut report,
            ..
        } = state;
        report.kept = sync.kept().len();

        if self.options.dry_run {
            return Ok(report);
        }

        let table_path = sync.table_path().to_path_buf();
        match sync.commit() {
            Ok(kept) => {
                if let Some(history) = history.as_mut() {
                    history.record(None, None, HistoryAction::TableWritten { kept })?;
                }
                tracing::info!(
                    "Cleaned {}: {} of {} entries retained",
                    report.species,
                    kept,
                    report.rows
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(
                    "Failed to write {} ({} kept rows); file changes already applied are listed in {}",
                    table_path.display(),
                    report.kept,
                    history
                        .as_ref()
                        .map(|h| h.path().display().to_string())
                        .unwrap_or_default()
                );
                Err(e.into())
            }
        }
    }

    fn progress_bar(&self, species: &str, len: usize) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::with_template("{msg} [{bar:40.green/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.set_message(format!("Processing {}", species));
        pb
    }

    /// Validate, plan normalization and fingerprint one row. Reads only.
    fn prepare(&self, image_dir: &Path, record: &ObservationRecord) -> Result<PreparedRow, CleanError> {
        let Some(name) = record.file_name() else {
            return Ok(PreparedRow {
                path: None,
                outcome: Prepared::Missing,
            });
        };
        let path = image_dir.join(name);

        let outcome = match self.validator.inspect(&path).map_err(|e| io_error(&path, e))? {
            Inspection::Missing => Prepared::Missing,
            Inspection::Corrupt { reason } => Prepared::Corrupt { reason },
            Inspection::SubResolution { width, height } => Prepared::SubResolution { width, height },
            Inspection::Valid(decoded) => match self.normalizer.plan(decoded, &path) {
                Ok(normalized) => Prepared::Candidate {
                    fingerprint: self.fingerprinter.fingerprint(&normalized.image),
                    plan: normalized.plan,
                },
                Err(NormalizeError::Encode(e)) => Prepared::Corrupt {
                    reason: format!("cannot re-encode: {}", e),
                },
                Err(e) => return Err(e.into()),
            },
        };

        Ok(PreparedRow {
            path: Some(path),
            outcome,
        })
    }

    /// Apply one row's decision. Runs strictly in row order.
    fn apply(
        &self,
        mut record: ObservationRecord,
        prepared: PreparedRow,
        state: &mut PassState<'_>,
    ) -> Result<(), CleanError> {
        let Some(path) = prepared.path else {
            tracing::debug!("{}: unusable imageFile {:?}", record.occurrence_id, record.image_file);
            state.report.missing += 1;
            return Ok(());
        };

        // A file already owned by an earlier row is not this row's to delete.
        if !state.claimed.insert(path.clone()) {
            tracing::debug!(
                "{}: {} already claimed by an earlier row",
                record.occurrence_id,
                path.display()
            );
            state.report.shared_files += 1;
            return Ok(());
        }

        let id = record.occurrence_id.clone();
        match prepared.outcome {
            Prepared::Missing => {
                tracing::debug!("{}: missing {}", id, path.display());
                state.report.missing += 1;
            }
            Prepared::Corrupt { reason } => {
                tracing::warn!("{}: corrupt {}: {}", id, path.display(), reason);
                self.remove(&path)?;
                self.journal(state, &id, &path, HistoryAction::DeletedCorrupt { reason })?;
                state.report.corrupt += 1;
            }
            Prepared::SubResolution { width, height } => {
                tracing::debug!("{}: {}x{} below floor, removing {}", id, width, height, path.display());
                self.remove(&path)?;
                self.journal(
                    state,
                    &id,
                    &path,
                    HistoryAction::DeletedSubResolution { width, height },
                )?;
                state.report.sub_resolution += 1;
            }
            Prepared::Candidate { plan, fingerprint } => {
                // The index only learns the final path once the file is actually there.
                let admission = state.index.admit_with(fingerprint, || {
                    if self.options.dry_run {
                        Ok(self.normalizer.target_for(&plan, &path))
                    } else {
                        self.normalizer.apply(&plan, &path)
                    }
                })?;
                match admission {
                    Admission::Duplicate { kept, distance } => {
                        tracing::debug!(
                            "{}: {} duplicates {} (distance {})",
                            id,
                            path.display(),
                            kept.display(),
                            distance
                        );
                        self.remove(&path)?;
                        self.journal(
                            state,
                            &id,
                            &path,
                            HistoryAction::DeletedDuplicate {
                                kept: kept.to_string_lossy().into_owned(),
                                distance,
                            },
                        )?;
                        state.report.duplicates += 1;
                    }
                    Admission::Kept(final_path) => {
                        if plan != NormalizePlan::Keep {
                            self.journal(
                                state,
                                &id,
                                &path,
                                HistoryAction::Normalized {
                                    to: final_path.to_string_lossy().into_owned(),
                                },
                            )?;
                            state.report.normalized += 1;
                        }
                        if let Some(name) = final_path.file_name() {
                            record.set_file_name(&name.to_string_lossy());
                        }
                        state.claimed.insert(final_path);
                        state.sync.keep(record);
                    }
                }
            }
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<(), CleanError> {
        if self.options.dry_run {
            return Ok(());
        }
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(path, e)),
        }
    }

    fn journal(
        &self,
        state: &mut PassState<'_>,
        occurrence_id: &str,
        path: &Path,
        action: HistoryAction,
    ) -> Result<(), CleanError> {
        if let Some(history) = state.history.as_mut() {
            history.record(Some(occurrence_id), Some(path), action)?;
        }
        Ok(())
    }
}

/// Outcome of a multi-species run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<SpeciesReport>,
    pub failures: Vec<(String, CleanError)>,
}

impl RunSummary {
    pub fn total_kept(&self) -> usize {
        self.reports.iter().map(|r| r.kept).sum()
    }
}

/// Clean every species in order. A failed species is logged and skipped; the rest
/// still run. The fingerprint index lives for the whole run unless scoped per species.
pub fn run(config: &Config, species: &[String], options: CleanOptions) -> RunSummary {
    let walker = CorpusWalker::new(config, options);
    let mut index = FingerprintIndex::new(&config.dedup);
    let mut summary = RunSummary::default();

    for name in species {
        if config.dedup.scope == IndexScope::PerSpecies {
            index = FingerprintIndex::new(&config.dedup);
        }
        match walker.clean_species(name, &mut index) {
            Ok(report) => summary.reports.push(report),
            Err(e) => {
                tracing::error!("Cleaning {} aborted: {}", name, e);
                summary.failures.push((name.clone(), e));
            }
        }
    }

    tracing::debug!("Fingerprint index holds {} keys", index.len());
    summary
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{MatchMode, ValidationConfig};
    use crate::core::history::read_history;
    use crate::core::image::tests::create_test_image;
    use crate::core::metadata::tests::record;
    use crate::core::metadata::{TableHeader, write_table};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    /// A data root with `data/raw/<species>` and `data/metadata/<species>`.
    pub(crate) struct Fixture {
        pub temp_dir: TempDir,
        pub config: Config,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let config = Config {
                layout: LayoutConfig::rooted_at(temp_dir.path()),
                ..Config::default()
            };
            Self { temp_dir, config }
        }

        pub(crate) fn paths(&self, species: &str) -> SpeciesPaths {
            SpeciesPaths::resolve(&self.config.layout, species)
        }

        pub(crate) fn image_dir(&self, species: &str) -> PathBuf {
            let dir = self.config.layout.raw_dir.join(species);
            fs::create_dir_all(&dir).unwrap();
            dir
        }

        pub(crate) fn image(&self, species: &str, name: &str, width: u32, height: u32, seed: u32) {
            create_test_image(&self.image_dir(species).join(name), width, height, seed).unwrap();
        }

        pub(crate) fn table(&self, species: &str, rows: &[(&str, &str)]) {
            let dir = self.config.layout.metadata_dir.join(species);
            fs::create_dir_all(&dir).unwrap();
            self.image_dir(species);
            let records: Vec<_> = rows.iter().map(|(id, file)| record(id, file)).collect();
            write_table(&dir.join("metadata.csv"), &TableHeader::default(), &records).unwrap();
        }

        pub(crate) fn rows(&self, species: &str) -> Vec<ObservationRecord> {
            read_table(&self.paths(species).table_path).unwrap().rows
        }

        pub(crate) fn files(&self, species: &str) -> BTreeSet<String> {
            fs::read_dir(self.image_dir(species))
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        }

        fn clean(&self, species: &str) -> SpeciesReport {
            let mut index = FingerprintIndex::new(&self.config.dedup);
            CorpusWalker::new(&self.config, CleanOptions::default())
                .clean_species(species, &mut index)
                .unwrap()
        }
    }

    fn ids(rows: &[ObservationRecord]) -> Vec<&str> {
        rows.iter().map(|r| r.occurrence_id.as_str()).collect()
    }

    #[test]
    fn test_missing_file_row_dropped() {
        let fx = Fixture::new();
        for (i, seed) in [(1, 11), (2, 12), (4, 14), (5, 15)] {
            fx.image("fox", &format!("{}.jpg", i), 256, 256, seed);
        }
        fx.table(
            "fox",
            &[("1", "1.jpg"), ("2", "2.jpg"), ("3", "3.jpg"), ("4", "4.jpg"), ("5", "5.jpg")],
        );

        let report = fx.clean("fox");

        assert_eq!(ids(&fx.rows("fox")), vec!["1", "2", "4", "5"]);
        assert_eq!(report.rows, 5);
        assert_eq!(report.kept, 4);
        assert_eq!(report.missing, 1);
        assert_eq!(report.dropped(), 1);
    }

    #[test]
    fn test_sub_resolution_deleted() {
        let fx = Fixture::new();
        fx.image("fox", "small.jpg", 100, 300, 1);
        fx.image("fox", "big.jpg", 300, 300, 2);
        fx.table("fox", &[("s", "small.jpg"), ("b", "big.jpg")]);

        let report = fx.clean("fox");

        assert_eq!(ids(&fx.rows("fox")), vec!["b"]);
        assert!(!fx.image_dir("fox").join("small.jpg").exists());
        assert_eq!(report.sub_resolution, 1);
    }

    #[test]
    fn test_corrupt_deleted() {
        let fx = Fixture::new();
        fx.image("fox", "good.jpg", 256, 256, 1);
        fs::write(fx.image_dir("fox").join("bad.jpg"), b"\xff\xd8\xff garbage").unwrap();
        fx.table("fox", &[("bad", "bad.jpg"), ("good", "good.jpg")]);

        let report = fx.clean("fox");

        assert_eq!(ids(&fx.rows("fox")), vec!["good"]);
        assert!(!fx.image_dir("fox").join("bad.jpg").exists());
        assert_eq!(report.corrupt, 1);
    }

    #[test]
    fn test_same_content_different_encodings_deduplicated() {
        let fx = Fixture::new();
        fx.image("fox", "a.png", 300, 300, 9);
        fx.image("fox", "b.jpg", 300, 300, 9);
        fx.table("fox", &[("a", "a.png"), ("b", "b.jpg")]);

        let report = fx.clean("fox");

        let rows = fx.rows("fox");
        assert_eq!(ids(&rows), vec!["a"]);
        assert_eq!(rows[0].image_file, "a.jpg");
        assert_eq!(fx.files("fox"), BTreeSet::from(["a.jpg".to_string()]));
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.normalized, 1);
    }

    #[test]
    fn test_earlier_row_wins_tie_break() {
        let fx = Fixture::new();
        fx.image("fox", "late.jpg", 256, 256, 4);
        fs::copy(
            fx.image_dir("fox").join("late.jpg"),
            fx.image_dir("fox").join("early.jpg"),
        )
        .unwrap();
        // Row order, not file name order, decides.
        fx.table("fox", &[("late", "late.jpg"), ("early", "early.jpg")]);

        fx.clean("fox");

        assert_eq!(ids(&fx.rows("fox")), vec!["late"]);
        assert_eq!(fx.files("fox"), BTreeSet::from(["late.jpg".to_string()]));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let build = |parallel: bool| {
            let mut fx = Fixture::new();
            fx.config.parallel = parallel;
            fx.config.chunk_size = 3;
            let mut rows = Vec::new();
            for i in 0..10u32 {
                // Seeds repeat every 4 rows, so rows 4..9 duplicate rows 0..3 / 4..5.
                fx.image("fox", &format!("{}.png", i), 256, 256, 20 + i % 4);
                rows.push((i.to_string(), format!("{}.png", i)));
            }
            fx.image("fox", "small.jpg", 64, 64, 99);
            rows.push(("small".to_string(), "small.jpg".to_string()));
            let borrowed: Vec<(&str, &str)> =
                rows.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
            fx.table("fox", &borrowed);
            let report = fx.clean("fox");
            (ids(&fx.rows("fox")).iter().map(|s| s.to_string()).collect::<Vec<_>>(), fx.files("fox"), report)
        };

        let (seq_rows, seq_files, seq_report) = build(false);
        let (par_rows, par_files, par_report) = build(true);

        assert_eq!(seq_rows, vec!["0", "1", "2", "3"]);
        assert_eq!(seq_rows, par_rows);
        assert_eq!(seq_files, par_files);
        assert_eq!(seq_report, par_report);
        assert_eq!(par_report.duplicates, 6);
        assert_eq!(par_report.sub_resolution, 1);
    }

    #[test]
    fn test_idempotent_second_pass() {
        let fx = Fixture::new();
        fx.image("fox", "a.png", 300, 300, 1);
        fx.image("fox", "b.jpeg", 300, 300, 2);
        fx.image("fox", "c.jpg", 300, 300, 1);
        fx.image("fox", "d.jpg", 50, 50, 3);
        fx.table("fox", &[("a", "a.png"), ("b", "b.jpeg"), ("c", "c.jpg"), ("d", "d.jpg")]);

        fx.clean("fox");
        let table_once = fs::read(fx.paths("fox").table_path).unwrap();
        let files_once = fx.files("fox");
        let bytes_once: Vec<Vec<u8>> = files_once
            .iter()
            .map(|f| fs::read(fx.image_dir("fox").join(f)).unwrap())
            .collect();

        let report = fx.clean("fox");
        let bytes_twice: Vec<Vec<u8>> = fx
            .files("fox")
            .iter()
            .map(|f| fs::read(fx.image_dir("fox").join(f)).unwrap())
            .collect();

        assert_eq!(fs::read(fx.paths("fox").table_path).unwrap(), table_once);
        assert_eq!(fx.files("fox"), files_once);
        assert_eq!(bytes_twice, bytes_once);
        assert_eq!(report.kept, report.rows);
        assert_eq!(report.normalized, 0);
    }

    #[test]
    fn test_table_and_files_consistent() {
        let fx = Fixture::new();
        fx.image("fox", "a.png", 300, 300, 1);
        fx.image("fox", "b.jpg", 300, 300, 1);
        fx.image("fox", "c.gif", 300, 300, 2);
        fx.image("fox", "d.jpg", 300, 100, 3);
        fx.table(
            "fox",
            &[("a", "a.png"), ("b", "b.jpg"), ("c", "c.gif"), ("d", "d.jpg"), ("e", "e.jpg")],
        );

        fx.clean("fox");

        let rows = fx.rows("fox");
        let referenced: BTreeSet<String> = rows.iter().map(|r| r.image_file.clone()).collect();
        assert_eq!(referenced.len(), rows.len());
        assert_eq!(referenced, fx.files("fox"));

        let validator = ImageValidator::new(ValidationConfig::default());
        for file in &referenced {
            assert!(matches!(
                validator.inspect(&fx.image_dir("fox").join(file)).unwrap(),
                Inspection::Valid(_)
            ));
        }
    }

    #[test]
    fn test_shared_file_not_deleted() {
        let fx = Fixture::new();
        fx.image("fox", "a.jpg", 256, 256, 1);
        fx.table("fox", &[("1", "a.jpg"), ("2", "a.jpg")]);

        let report = fx.clean("fox");

        assert_eq!(ids(&fx.rows("fox")), vec!["1"]);
        assert!(fx.image_dir("fox").join("a.jpg").exists());
        assert_eq!(report.shared_files, 1);
    }

    #[test]
    fn test_prefix_preserved_on_rename() {
        let fx = Fixture::new();
        fx.image("fox", "7.png", 256, 256, 1);
        fx.table("fox", &[("7", "data/raw/fox/7.png")]);

        fx.clean("fox");

        assert_eq!(fx.rows("fox")[0].image_file, "data/raw/fox/7.jpg");
        assert!(fx.image_dir("fox").join("7.jpg").exists());
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let fx = Fixture::new();
        fx.image("fox", "a.png", 300, 300, 1);
        fx.image("fox", "b.jpg", 300, 300, 1);
        fx.image("fox", "c.jpg", 10, 10, 2);
        fx.table("fox", &[("a", "a.png"), ("b", "b.jpg"), ("c", "c.jpg")]);
        let table_before = fs::read(fx.paths("fox").table_path).unwrap();
        let files_before = fx.files("fox");

        let mut index = FingerprintIndex::new(&fx.config.dedup);
        let options = CleanOptions {
            dry_run: true,
            ..CleanOptions::default()
        };
        let report = CorpusWalker::new(&fx.config, options)
            .clean_species("fox", &mut index)
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.kept, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.sub_resolution, 1);
        assert_eq!(fs::read(fx.paths("fox").table_path).unwrap(), table_before);
        assert_eq!(fx.files("fox"), files_before);
        assert!(read_history(&fx.paths("fox").metadata_dir).is_err());
    }

    #[test]
    fn test_journal_records_changes() {
        let fx = Fixture::new();
        fx.image("fox", "a.png", 300, 300, 1);
        fx.image("fox", "b.jpg", 300, 300, 1);
        fx.image("fox", "c.jpg", 10, 10, 2);
        fx.table("fox", &[("a", "a.png"), ("b", "b.jpg"), ("c", "c.jpg")]);

        fx.clean("fox");

        let actions: Vec<_> = read_history(&fx.paths("fox").metadata_dir)
            .unwrap()
            .into_iter()
            .map(|r| r.action)
            .collect();
        assert_eq!(actions.len(), 4);
        assert!(matches!(actions[0], HistoryAction::Normalized { .. }));
        assert!(matches!(actions[1], HistoryAction::DeletedDuplicate { distance: 0, .. }));
        assert!(matches!(actions[2], HistoryAction::DeletedSubResolution { width: 10, height: 10 }));
        assert_eq!(actions[3], HistoryAction::TableWritten { kept: 1 });
    }

    #[test]
    fn test_missing_table_is_fatal_and_writes_nothing() {
        let fx = Fixture::new();
        fx.image("fox", "a.jpg", 256, 256, 1);

        let mut index = FingerprintIndex::new(&fx.config.dedup);
        let err = CorpusWalker::new(&fx.config, CleanOptions::default())
            .clean_species("fox", &mut index)
            .unwrap_err();

        assert!(matches!(err, CleanError::Table(TableError::NotFound { .. })));
        assert!(fx.image_dir("fox").join("a.jpg").exists());
    }

    #[test]
    fn test_missing_image_dir_keeps_table() {
        let fx = Fixture::new();
        fx.table("fox", &[("1", "1.jpg")]);
        fs::remove_dir(fx.config.layout.raw_dir.join("fox")).unwrap();
        let before = fs::read(fx.paths("fox").table_path).unwrap();

        let mut index = FingerprintIndex::new(&fx.config.dedup);
        let err = CorpusWalker::new(&fx.config, CleanOptions::default())
            .clean_species("fox", &mut index)
            .unwrap_err();

        assert!(matches!(err, CleanError::ImageDirMissing { .. }));
        assert_eq!(fs::read(fx.paths("fox").table_path).unwrap(), before);
    }

    #[test]
    fn test_io_failure_mid_pass_keeps_table() {
        let fx = Fixture::new();
        fx.image("fox", "a.png", 300, 300, 1);
        // Longer than any file system allows for one component.
        let unreachable = format!("{}.jpg", "x".repeat(300));
        fx.table("fox", &[("a", "a.png"), ("x", unreachable.as_str()), ("c", "c.jpg")]);
        let before = fs::read(fx.paths("fox").table_path).unwrap();

        let mut index = FingerprintIndex::new(&fx.config.dedup);
        let err = CorpusWalker::new(&fx.config, CleanOptions::default())
            .clean_species("fox", &mut index)
            .unwrap_err();

        assert!(matches!(err, CleanError::Io { .. }), "{:?}", err);
        // The first row was already applied when the pass aborted.
        assert_eq!(fx.files("fox"), BTreeSet::from(["a.jpg".to_string()]));
        assert_eq!(fs::read(fx.paths("fox").table_path).unwrap(), before);
        let actions: Vec<_> = read_history(&fx.paths("fox").metadata_dir)
            .unwrap()
            .into_iter()
            .map(|r| r.action)
            .collect();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], HistoryAction::Normalized { .. }));
    }

    #[test]
    fn test_directory_reference_dropped_and_left_alone() {
        let fx = Fixture::new();
        fx.image("fox", "a.png", 300, 300, 1);
        fs::create_dir(fx.image_dir("fox").join("d.jpg")).unwrap();
        fx.table("fox", &[("a", "a.png"), ("d", "d.jpg")]);

        let report = fx.clean("fox");

        assert_eq!(ids(&fx.rows("fox")), vec!["a"]);
        assert_eq!(report.missing, 1);
        assert!(fx.image_dir("fox").join("d.jpg").is_dir());
    }

    #[test]
    fn test_foreign_columns_survive_clean() {
        let fx = Fixture::new();
        fx.image("fox", "a.png", 300, 300, 1);
        fx.image("fox", "b.jpg", 300, 300, 2);
        fx.image("fox", "c.jpg", 300, 300, 1);
        let table_path = fx.paths("fox").table_path;
        fs::create_dir_all(table_path.parent().unwrap()).unwrap();
        fs::write(
            &table_path,
            "occurrenceID,imageFile,decimalLatitude,basisOfRecord
             1,a.png,-33.8688000,HUMAN_OBSERVATION
             2,b.jpg,unknown,PRESERVED_SPECIMEN
             3,c.jpg,12,HUMAN_OBSERVATION
",
        )
        .unwrap();

        let report = fx.clean("fox");

        assert_eq!(report.duplicates, 1);
        assert_eq!(
            fs::read_to_string(&table_path).unwrap(),
            "occurrenceID,imageFile,decimalLatitude,basisOfRecord
             1,a.jpg,-33.8688000,HUMAN_OBSERVATION
             2,b.jpg,unknown,PRESERVED_SPECIMEN
"
        );
    }

    #[test]
    fn test_global_scope_dedups_across_species() {
        let fx = Fixture::new();
        fx.image("fox", "a.jpg", 256, 256, 5);
        fx.image("toad", "a.jpg", 256, 256, 5);
        fx.table("fox", &[("f", "a.jpg")]);
        fx.table("toad", &[("t", "a.jpg")]);

        let summary = run(
            &fx.config,
            &["fox".to_string(), "toad".to_string()],
            CleanOptions::default(),
        );

        assert!(summary.failures.is_empty());
        assert_eq!(summary.total_kept(), 1);
        assert_eq!(fx.rows("toad").len(), 0);
        assert!(!fx.image_dir("toad").join("a.jpg").exists());
    }

    #[test]
    fn test_per_species_scope_keeps_both() {
        let mut fx = Fixture::new();
        fx.config.dedup.scope = IndexScope::PerSpecies;
        fx.image("fox", "a.jpg", 256, 256, 5);
        fx.image("toad", "a.jpg", 256, 256, 5);
        fx.table("fox", &[("f", "a.jpg")]);
        fx.table("toad", &[("t", "a.jpg")]);

        let summary = run(
            &fx.config,
            &["fox".to_string(), "toad".to_string()],
            CleanOptions::default(),
        );

        assert_eq!(summary.total_kept(), 2);
    }

    #[test]
    fn test_failed_species_does_not_stop_run() {
        let fx = Fixture::new();
        fx.image("fox", "a.jpg", 256, 256, 5);
        fx.table("fox", &[("f", "a.jpg")]);

        let summary = run(
            &fx.config,
            &["ghost".to_string(), "fox".to_string()],
            CleanOptions::default(),
        );

        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, "ghost");
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.total_kept(), 1);
    }

    #[test]
    fn test_near_mode_catches_rescaled_copy() {
        let mut fx = Fixture::new();
        fx.config.dedup.mode = MatchMode::Near;
        fx.config.dedup.max_distance = 8;
        fx.image("fox", "big.jpg", 512, 512, 6);
        fx.image("fox", "small.jpg", 300, 300, 6);
        fx.image("fox", "other.jpg", 300, 300, 7);
        fx.table("fox", &[("big", "big.jpg"), ("small", "small.jpg"), ("other", "other.jpg")]);

        let report = fx.clean("fox");

        assert_eq!(ids(&fx.rows("fox")), vec!["big", "other"]);
        assert_eq!(report.duplicates, 1);
    }

    #[test]
    fn test_species_name_sanitized() {
        let fx = Fixture::new();
        fx.image("vulpes_vulpes", "a.jpg", 256, 256, 1);
        fx.table("vulpes_vulpes", &[("1", "a.jpg")]);

        let paths = fx.paths("Vulpes vulpes");
        assert_eq!(paths.species, "vulpes_vulpes");
        assert_eq!(fx.clean("Vulpes vulpes").kept, 1);
        assert_eq!(sanitize_species_name(" Rhinella marina "), "rhinella_marina");
    }
}
