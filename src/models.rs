//
// models.rs
// Study-Anonymizer-rs
//
// Defines serializable data structures for study metadata, ledger rows, patient lookups and run reports.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StudyError;

/// Study date recorded when no included record carries one.
pub const UNKNOWN_STUDY_DATE: &str = "unknown";

/// Operator input for one study run, validated once and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyMetadata {
    project_id: String,
    modality: String,
    first_name: String,
    last_name: String,
    patient_seq: String,
    requested_study_number: Option<u32>,
}

impl StudyMetadata {
    pub fn new(
        project_id: &str,
        modality: &str,
        first_name: &str,
        last_name: &str,
        patient_seq: &str,
        requested_study_number: Option<u32>,
    ) -> Result<Self, StudyError> {
        let project_id = project_id.trim();
        let modality = modality.trim();
        let patient_seq = patient_seq.trim();

        if project_id.is_empty() {
            return Err(StudyError::InvalidInput("project identifier is required".into()));
        }
        if modality.is_empty() {
            return Err(StudyError::InvalidInput("modality is required".into()));
        }
        if patient_seq.is_empty() {
            return Err(StudyError::InvalidInput("patient sequence is required".into()));
        }

        Ok(Self {
            project_id: project_id.to_string(),
            modality: modality.to_string(),
            first_name: first_name.trim().to_string(),
            last_name: last_name.trim().to_string(),
            patient_seq: patient_seq.to_string(),
            requested_study_number,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn modality(&self) -> &str {
        &self.modality
    }

    pub fn first_name(&self) -> &str {
        &self.first_name
    }

    pub fn last_name(&self) -> &str {
        &self.last_name
    }

    pub fn patient_seq(&self) -> &str {
        &self.patient_seq
    }

    /// Study number the operator saw suggested; cross-checked against the ledger before use.
    pub fn requested_study_number(&self) -> Option<u32> {
        self.requested_study_number
    }
}

/// Source and destination roots of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyPaths {
    pub source_root: PathBuf,
    pub originals_root: PathBuf,
    pub anonymized_root: PathBuf,
}

/// One ledger entry, appended once per completed study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyRow {
    pub patient_id: String,
    pub first_name: String,
    pub last_name: String,
    pub study_date: String,
    pub project_id: String,
    pub modality: String,
    pub patient_seq: String,
    pub study_number: u32,
}

/// Patient lookup result shown in pickers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientMatch {
    pub display_label: String,
    pub first_name: String,
    pub last_name: String,
    pub patient_seq: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Scanning,
    Processing,
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
    Cancelled,
}

/// Final summary of a run, produced whether or not every record succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyReport {
    pub status: RunStatus,
    pub pseudonym: String,
    pub folder_name: String,
    pub study_number: u32,
    pub study_date: String,
    pub discovered: usize,
    pub excluded: usize,
    pub copied: usize,
    pub anonymized: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<String>,
    pub ledger_written: bool,
    pub ledger_error: Option<String>,
    pub originals_dir: PathBuf,
    pub anonymized_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StudyReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}
