//! File-backed store of per-stage context documents.
//!
//! Each stage's document lives at `<dir>/<stage-id>-summary.json`. Writes
//! go through a temp file and a rename, so a reader never observes a
//! half-written document and a crash leaves the previous version intact.
//! Reads are scoped to the store's run; documents left by other runs stay
//! on disk for audit and are reachable through [`ContextStore::read_any`].

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use strata_common::{ContextDocument, StageId};

use crate::errors::StoreError;

const DOCUMENT_SUFFIX: &str = "-summary.json";

#[derive(Debug, Clone)]
pub struct ContextStore {
    dir: PathBuf,
    run_id: String,
}

impl ContextStore {
    pub fn open(dir: &Path, run_id: &str) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            run_id: run_id.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path_for(&self, stage: &StageId) -> PathBuf {
        self.dir.join(format!("{stage}{DOCUMENT_SUFFIX}"))
    }

    /// Persist `doc`, replacing any earlier document for the same stage.
    pub fn write(&self, doc: &ContextDocument) -> Result<PathBuf, StoreError> {
        let path = self.path_for(&doc.stage);
        let json = serde_json::to_string_pretty(doc).map_err(|source| StoreError::Serialize {
            stage: doc.stage.clone(),
            source,
        })?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|source| StoreError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;

        tracing::debug!(stage = %doc.stage, path = %path.display(), "context document written");
        Ok(path)
    }

    /// This run's document for `stage`, or `None` if the stage has not
    /// written one yet.
    pub fn read(&self, stage: &StageId) -> Result<Option<ContextDocument>, StoreError> {
        Ok(self
            .read_any(stage)?
            .filter(|doc| doc.run_id == self.run_id))
    }

    /// The document on disk for `stage`, whichever run wrote it.
    pub fn read_any(&self, stage: &StageId) -> Result<Option<ContextDocument>, StoreError> {
        load(&self.path_for(stage))
    }

    /// Every document this run has written so far.
    pub fn read_all(&self) -> Result<BTreeMap<StageId, ContextDocument>, StoreError> {
        Ok(self
            .read_all_runs()?
            .into_iter()
            .filter(|(_, doc)| doc.run_id == self.run_id)
            .collect())
    }

    /// Every document in the directory. Files that are not valid documents
    /// are skipped with a warning.
    pub fn read_all_runs(&self) -> Result<BTreeMap<StageId, ContextDocument>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut docs = BTreeMap::new();
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(DOCUMENT_SUFFIX))
            else {
                continue;
            };
            let Ok(stage) = StageId::new(stem) else {
                continue;
            };
            match load(&path) {
                Ok(Some(doc)) if doc.stage == stage => {
                    docs.insert(stage, doc);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "skipping unreadable context document"),
            }
        }
        Ok(docs)
    }
}

fn load(path: &Path) -> Result<Option<ContextDocument>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Malformed {
            path: path.to_path_buf(),
            source,
        })
}
