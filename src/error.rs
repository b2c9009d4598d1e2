//
// error.rs
// Study-Anonymizer-rs
//
// Typed error kinds for scanning, identifier construction, the study ledger, per-record work and whole runs.
//
// Thales Matheus Mendonça Santos - November 2025

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("directory not found or not readable: {0}")]
    DirectoryNotFound(PathBuf),
    #[error("failed to walk {root}: {source}")]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Reasons a pseudonym cannot be built. The caller must surface these, never substitute a default.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("project identifier is empty")]
    MissingProject,
    #[error("modality is empty")]
    MissingModality,
    #[error("patient sequence is empty")]
    MissingPatientSequence,
    #[error("patient sequence {0:?} does not match Pat<digits>")]
    MalformedPatientSequence(String),
    #[error("study sequence number must be at least 1, got {0}")]
    InvalidStudyNumber(u32),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("project identifier {0:?} cannot be turned into a ledger filename")]
    InvalidProjectId(String),
    #[error("ledger {path} has a malformed header: missing column {column}")]
    MalformedHeader { path: PathBuf, column: &'static str },
    #[error("ledger {path} already records study {study_number} for {patient_seq}")]
    DuplicateStudy {
        path: PathBuf,
        patient_seq: String,
        study_number: u32,
    },
    #[error("ledger I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ledger {path} is not valid CSV: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Failure of one record. Isolated at the record boundary; never aborts a run.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: dicom::object::ReadError,
    },
    #[error("failed to copy {path} to {target}: {source}")]
    Copy {
        path: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write anonymized {target}: {source}")]
    Anonymize {
        target: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Errors fatal to a whole study run. All of them fire before any file work begins.
#[derive(Debug, Error)]
pub enum StudyError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no records found under {0}")]
    NoRecordsFound(PathBuf),
    #[error("invalid identifier: {0}")]
    IdentifierInvalid(#[from] IdentifierError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Scan(ScanError),
    #[error("failed to start worker pool: {0}")]
    Worker(String),
}

impl From<ScanError> for StudyError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::DirectoryNotFound(path) => {
                StudyError::InvalidInput(format!("source directory {} is not readable", path.display()))
            }
            other => StudyError::Scan(other),
        }
    }
}
