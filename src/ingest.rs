use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::history::{expand_history_paths, parse_history_file};

#[derive(Debug)]
pub enum FileOutcome {
    Ingested {
        path: PathBuf,
        parsed: usize,
        inserted: usize,
        skipped: usize,
    },
    /// The file could not be read; other files were still processed.
    Failed { path: Option<PathBuf>, error: Error },
}

#[derive(Debug, Default)]
pub struct CollectReport {
    pub files: Vec<FileOutcome>,
}

impl CollectReport {
    pub fn inserted(&self) -> usize {
        self.files.iter().map(|f| match f {
            FileOutcome::Ingested { inserted, .. } => *inserted,
            FileOutcome::Failed { .. } => 0,
        }).sum()
    }

    pub fn skipped(&self) -> usize {
        self.files.iter().map(|f| match f {
            FileOutcome::Ingested { skipped, .. } => *skipped,
            FileOutcome::Failed { .. } => 0,
        }).sum()
    }

    pub fn failures(&self) -> usize {
        self.files.iter().filter(|f| matches!(f, FileOutcome::Failed { .. })).count()
    }
}

/// Ingest one file. Read errors come back as `Failed`; store errors abort.
pub fn collect_file(db: &mut Database, path: &Path) -> Result<FileOutcome> {
    let records = match parse_history_file(path) {
        Ok(records) => records,
        Err(error) => {
            warn!("skipping {}: {}", path.display(), error);
            return Ok(FileOutcome::Failed {
                path: Some(path.to_path_buf()),
                error,
            });
        }
    };

    let (inserted, skipped) = db.insert_batch(&records).map_err(|e| Error::Ingest {
        path: path.to_path_buf(),
        source: Box::new(e),
    })?;
    info!("{}: {} parsed, {} new, {} skipped", path.display(), records.len(), inserted, skipped);

    Ok(FileOutcome::Ingested {
        path: path.to_path_buf(),
        parsed: records.len(),
        inserted,
        skipped,
    })
}

/// Expand `paths` and ingest every history file found, in order.
pub fn collect(db: &mut Database, paths: &[PathBuf]) -> Result<CollectReport> {
    let (files, failures) = expand_history_paths(paths);
    let mut report = CollectReport::default();

    for error in failures {
        let path = match &error {
            Error::Io { path, .. } => Some(path.clone()),
            Error::Walk(e) => e.path().map(Path::to_path_buf),
            _ => None,
        };
        warn!("{}", error);
        report.files.push(FileOutcome::Failed { path, error });
    }

    for file in &files {
        report.files.push(collect_file(db, file)?);
    }

    Ok(report)
}
