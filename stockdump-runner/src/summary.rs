//! Process exit status and run-report output.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to serialize run report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write run report {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome class of a whole run.
///
/// `Partial` means the run completed but recorded per-symbol failures;
/// `Fatal` means setup failed before any per-symbol work began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    Partial,
    Fatal,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Fatal => 1,
            ExitStatus::Partial => 2,
        }
    }

    pub fn is_success(self) -> bool {
        self == ExitStatus::Success
    }
}

/// Write a run summary as pretty JSON.
///
/// The report goes to a temp file next to `path` and is renamed into place,
/// so an existing report is either kept or fully replaced.
pub fn write_report<T: Serialize>(path: &Path, report: &T) -> Result<(), ReportError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let io_err = |path: &Path, source: io::Error| ReportError::Io {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_vec_pretty(report)?;
    fs::create_dir_all(&parent).map_err(|e| io_err(&parent, e))?;

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("report");
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".tmp")
        .tempfile_in(&parent)
        .map_err(|e| io_err(&parent, e))?;
    tmp.write_all(&json)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| io_err(path, e))?;
    tmp.persist(path).map_err(|e| io_err(path, e.error))?;
    Ok(())
}
