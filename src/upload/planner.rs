//! Batch planning: walk inputs, classify files, and bin-fill batches.
//!
//! Files that cannot be uploaded (unsupported type, oversized, shadowed by a newer
//! file of the same name, broken metadata sidecar) get their final outcome here
//! and never reach the network.

use super::types::{
    Batch, ByteRecord, FileId, FileOutcome, FileRecord, SkipReason, TextRecord, UploadOutcome,
    DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_BATCH_SIZE,
};
use crate::error::{IngestError, IngestResult};
use crate::validation::{
    file_extension, is_metadata_sidecar, parse_metadata, resolve_allowed_types, sidecar_path,
    validate_file_size,
};
use indexmap::{IndexMap, IndexSet};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Batches to upload plus the outcomes already decided during planning
#[derive(Debug, Default)]
pub struct Plan {
    pub batches: Vec<Batch>,
    pub outcomes: Vec<FileOutcome>,
}

impl Plan {
    /// Number of files that will be uploaded
    pub fn upload_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    pub fn upload_bytes(&self) -> u64 {
        self.batches.iter().map(Batch::total_bytes).sum()
    }

    pub fn total_files(&self) -> usize {
        self.upload_count() + self.outcomes.len()
    }
}

/// Walked file with the facts planning needs
struct Candidate {
    id: FileId,
    path: PathBuf,
    name: String,
    size: u64,
    modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct BatchPlanner {
    max_batch_size: usize,
    max_batch_bytes: u64,
}

impl Default for BatchPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_BATCH_BYTES)
    }
}

impl BatchPlanner {
    pub fn new(max_batch_size: usize, max_batch_bytes: u64) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            max_batch_bytes,
        }
    }

    pub fn max_batch_bytes(&self) -> u64 {
        self.max_batch_bytes
    }

    /// Greedy bin-fill of records into batches, in input order.
    ///
    /// Records larger than the byte ceiling are skipped as oversized.
    pub fn plan(&self, records: Vec<FileRecord>) -> Plan {
        let mut plan = Plan::default();
        let mut current: Vec<FileRecord> = Vec::new();
        let mut current_bytes = 0u64;

        for record in records {
            if let Err(IngestError::OversizedFile { size, max }) =
                validate_file_size(record.size, self.max_batch_bytes)
            {
                warn!(file = %record.name, size, max, "⚠ Skipping oversized file");
                plan.outcomes.push(FileOutcome::for_record(
                    &record,
                    UploadOutcome::Skipped {
                        reason: SkipReason::OversizedFile { size, max },
                    },
                ));
                continue;
            }

            let full = current.len() >= self.max_batch_size
                || current_bytes + record.size > self.max_batch_bytes;
            if full && !current.is_empty() {
                let index = plan.batches.len();
                plan.batches.push(Batch {
                    index,
                    files: std::mem::take(&mut current),
                });
                current_bytes = 0;
            }

            current_bytes += record.size;
            current.push(record);
        }

        if !current.is_empty() {
            let index = plan.batches.len();
            plan.batches.push(Batch {
                index,
                files: current,
            });
        }

        debug!(
            batches = plan.batches.len(),
            files = plan.upload_count(),
            skipped = plan.outcomes.len(),
            "Planned upload batches"
        );
        plan
    }

    /// Plan text records; ids follow input order
    pub fn plan_texts(&self, records: Vec<TextRecord>) -> Plan {
        let records = records
            .into_iter()
            .enumerate()
            .map(|(id, record)| FileRecord::from_text(id, record))
            .collect();
        self.plan(records)
    }

    /// Plan binary records; ids follow input order
    pub fn plan_bytes(&self, records: Vec<ByteRecord>) -> Plan {
        let records = records
            .into_iter()
            .enumerate()
            .map(|(id, record)| FileRecord::from_bytes(id, record))
            .collect();
        self.plan(records)
    }

    /// Walk `paths`, classify what was found, and plan the uploadable files.
    ///
    /// Directories are read one level deep unless `recursive` is set.
    pub fn plan_paths(
        &self,
        paths: &[PathBuf],
        recursive: bool,
        allowed_types: Option<&[String]>,
    ) -> IngestResult<Plan> {
        let allowed = resolve_allowed_types(allowed_types);
        let walked = collect_files(paths, recursive)?;

        let (sidecars, files): (Vec<PathBuf>, Vec<PathBuf>) =
            walked.into_iter().partition(|p| is_metadata_sidecar(p));
        let sidecars: HashSet<PathBuf> = sidecars.into_iter().collect();

        let mut outcomes = Vec::new();
        let mut candidates = Vec::new();

        for (id, path) in files.into_iter().enumerate() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let stat = match std::fs::metadata(&path) {
                Ok(stat) => stat,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot read file metadata");
                    outcomes.push(FileOutcome {
                        id,
                        name,
                        path: Some(path),
                        size: 0,
                        outcome: UploadOutcome::failed(e),
                    });
                    continue;
                }
            };

            let extension = file_extension(&name);
            if !allowed.contains(&extension) {
                debug!(file = %name, extension = %extension, "Skipping unsupported file type");
                outcomes.push(FileOutcome {
                    id,
                    name,
                    path: Some(path),
                    size: stat.len(),
                    outcome: UploadOutcome::Skipped {
                        reason: SkipReason::UnsupportedType { extension },
                    },
                });
                continue;
            }

            candidates.push(Candidate {
                id,
                path,
                name,
                size: stat.len(),
                modified: stat.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        let (kept, duplicates) = keep_most_recent(candidates);
        for duplicate in duplicates {
            info!(file = %duplicate.path.display(), "Skipping older file with duplicate name");
            outcomes.push(FileOutcome {
                id: duplicate.id,
                name: duplicate.name,
                path: Some(duplicate.path),
                size: duplicate.size,
                outcome: UploadOutcome::Skipped {
                    reason: SkipReason::DuplicateName,
                },
            });
        }

        let mut used_sidecars = HashSet::new();
        let mut records = Vec::with_capacity(kept.len());
        for candidate in kept {
            let metadata = match sidecar_path(&candidate.path).filter(|p| sidecars.contains(p)) {
                Some(sidecar) => {
                    let loaded = load_sidecar(&sidecar);
                    used_sidecars.insert(sidecar);
                    match loaded {
                        Ok(metadata) => Some(metadata),
                        Err(e) => {
                            warn!(file = %candidate.name, error = %e, "✗ Invalid metadata sidecar");
                            outcomes.push(FileOutcome {
                                id: candidate.id,
                                name: candidate.name,
                                path: Some(candidate.path),
                                size: candidate.size,
                                outcome: UploadOutcome::failed(e),
                            });
                            continue;
                        }
                    }
                }
                None => None,
            };
            records.push(FileRecord::from_path(
                candidate.id,
                candidate.path,
                candidate.size,
                metadata,
            ));
        }

        for orphan in sidecars.difference(&used_sidecars) {
            warn!(path = %orphan.display(), "Metadata file has no matching upload file, ignoring");
        }

        let mut plan = self.plan(records);
        plan.outcomes.extend(outcomes);
        plan.outcomes.sort_by_key(|o| o.id);
        Ok(plan)
    }
}

/// Expand input paths into a de-duplicated, ordered list of files
fn collect_files(paths: &[PathBuf], recursive: bool) -> IngestResult<Vec<PathBuf>> {
    let mut files = IndexSet::new();

    for path in paths {
        let expanded = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref());

        if expanded.is_file() {
            files.insert(expanded);
            continue;
        }

        if !expanded.is_dir() {
            warn!(path = %expanded.display(), "Path does not exist, nothing to upload");
            continue;
        }

        let max_depth = if recursive { usize::MAX } else { 1 };
        for entry in WalkDir::new(&expanded)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if e.depth() == 0 {
                        return Err(IngestError::Io(std::io::Error::other(e.to_string())));
                    }
                    warn!(error = %e, "Skipping unreadable directory entry");
                    continue;
                }
            };
            if entry.file_type().is_file() {
                files.insert(entry.into_path());
            }
        }
    }

    Ok(files.into_iter().collect())
}

/// Split candidates into the most recently modified file per name and the rest
fn keep_most_recent(candidates: Vec<Candidate>) -> (Vec<Candidate>, Vec<Candidate>) {
    let mut by_name: IndexMap<String, Vec<Candidate>> = IndexMap::new();
    for candidate in candidates {
        by_name
            .entry(candidate.name.clone())
            .or_default()
            .push(candidate);
    }

    let mut kept = Vec::new();
    let mut duplicates = Vec::new();
    for (_, mut group) in by_name {
        let newest = group
            .iter()
            .enumerate()
            .max_by_key(|(_, c)| c.modified)
            .map(|(i, _)| i)
            .unwrap_or(0);
        kept.push(group.swap_remove(newest));
        duplicates.extend(group);
    }

    kept.sort_by_key(|c| c.id);
    (kept, duplicates)
}

fn load_sidecar(path: &Path) -> IngestResult<super::types::Metadata> {
    let content = std::fs::read_to_string(path)?;
    parse_metadata(path, &content)
}
