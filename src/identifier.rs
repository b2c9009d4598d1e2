//
// identifier.rs
// Study-Anonymizer-rs
//
// Builds the deterministic pseudonym written into anonymized records and used to name output folders.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::IdentifierError;

pub const PSEUDONYM_PREFIX: &str = "ANON";
pub const FIELD_SEPARATOR: &str = "||";
pub const INDEX_SEPARATOR: &str = ".";

fn patient_seq_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^Pat\d+$").expect("static pattern"))
}

/// True when `value` is `Pat` followed by one or more digits.
pub fn is_patient_seq(value: &str) -> bool {
    patient_seq_pattern().is_match(value)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pseudonym(String);

impl Pseudonym {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory-safe form of the pseudonym used for the per-study output subtrees.
    pub fn folder_name(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for Pseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `PREFIX^PROJECT||MODALITY.<study_number - 1>||<patient_seq>`
pub fn build(
    project: &str,
    modality: &str,
    study_number: u32,
    patient_seq: &str,
) -> Result<Pseudonym, IdentifierError> {
    let project = project.trim();
    let modality = modality.trim();
    let patient_seq = patient_seq.trim();

    if project.is_empty() {
        return Err(IdentifierError::MissingProject);
    }
    if modality.is_empty() {
        return Err(IdentifierError::MissingModality);
    }
    if patient_seq.is_empty() {
        return Err(IdentifierError::MissingPatientSequence);
    }
    if !is_patient_seq(patient_seq) {
        return Err(IdentifierError::MalformedPatientSequence(patient_seq.to_string()));
    }
    if study_number < 1 {
        return Err(IdentifierError::InvalidStudyNumber(study_number));
    }

    let study_index = study_number - 1;
    Ok(Pseudonym(format!(
        "{PSEUDONYM_PREFIX}^{project}{FIELD_SEPARATOR}{modality}{INDEX_SEPARATOR}{study_index}{FIELD_SEPARATOR}{patient_seq}"
    )))
}
