// Fingerprint index shared by every species pass in a run.
//
// Exact mode is a plain hash-map lookup. Near mode compares against every
// registered key, so it costs O(keys) per candidate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::{DedupConfig, MatchMode};
use crate::core::hash::Fingerprint;

/// Result of looking a fingerprint up in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Unique,
    /// Matches a previously kept image.
    Duplicate { kept: PathBuf, distance: u32 },
}

/// Result of [`FingerprintIndex::admit_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Unique, now registered under this path.
    Kept(PathBuf),
    Duplicate { kept: PathBuf, distance: u32 },
}

#[derive(Debug, Default)]
pub struct FingerprintIndex {
    mode: MatchMode,
    max_distance: u32,
    entries: HashMap<Fingerprint, Vec<PathBuf>>,
    // Keys in insertion order so near-mode matches resolve to the earliest kept image.
    order: Vec<Fingerprint>,
}

impl FingerprintIndex {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            mode: config.mode,
            max_distance: config.max_distance,
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Lookup {
        if self.mode == MatchMode::Near && self.max_distance > 0 {
            // Registration order, so an exact hit never shadows an earlier near one.
            for key in &self.order {
                let distance = key.distance(fingerprint);
                if distance <= self.max_distance {
                    if let Some(kept) = self.entries.get(key).and_then(|p| p.first()) {
                        return Lookup::Duplicate {
                            kept: kept.clone(),
                            distance,
                        };
                    }
                }
            }
            return Lookup::Unique;
        }

        match self.entries.get(fingerprint).and_then(|p| p.first()) {
            Some(kept) => Lookup::Duplicate {
                kept: kept.clone(),
                distance: 0,
            },
            None => Lookup::Unique,
        }
    }

    /// Append `path` under `fingerprint`.
    pub fn register(&mut self, fingerprint: Fingerprint, path: &Path) {
        let paths = self.entries.entry(fingerprint.clone()).or_default();
        if paths.is_empty() {
            self.order.push(fingerprint);
        }
        paths.push(path.to_path_buf());
    }

    /// Look up and, when unique, register in one step. Exclusive access through
    /// `&mut self` keeps the check and the insert atomic.
    pub fn admit(&mut self, fingerprint: Fingerprint, path: &Path) -> Lookup {
        let lookup = self.lookup(&fingerprint);
        if lookup == Lookup::Unique {
            self.register(fingerprint, path);
        }
        lookup
    }

    /// Like [`admit`](Self::admit), but a unique image is registered under whatever path
    /// `place` returns, and only if `place` succeeds. A failed placement leaves the index
    /// unchanged.
    pub fn admit_with<E>(
        &mut self,
        fingerprint: Fingerprint,
        place: impl FnOnce() -> Result<PathBuf, E>,
    ) -> Result<Admission, E> {
        match self.lookup(&fingerprint) {
            Lookup::Duplicate { kept, distance } => Ok(Admission::Duplicate { kept, distance }),
            Lookup::Unique => {
                let path = place()?;
                self.register(fingerprint, &path);
                Ok(Admission::Kept(path))
            }
        }
    }

    pub fn paths(&self, fingerprint: &Fingerprint) -> &[PathBuf] {
        self.entries
            .get(fingerprint)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
