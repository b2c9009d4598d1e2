//
// lib.rs
// Study-Anonymizer-rs
//
// Exposes the crate's modules and re-exports the CLI entry point for both binary and library consumers.
//
// Thales Matheus Mendonça Santos - November 2025

// Public surface of the library: the study pipeline and the pieces it is built from.
pub mod anonymize;
pub mod classify;
pub mod cli;
pub mod config;
pub mod dicom_access;
pub mod error;
pub mod identifier;
pub mod ledger;
pub mod models;
pub mod pipeline;
pub mod scan;
pub mod storage;
pub mod web;

pub use cli::{run as run_cli, Cli, Commands};
pub use error::{IdentifierError, LedgerError, RecordError, ScanError, StudyError};
pub use ledger::SequenceLedger;
pub use models::{StudyMetadata, StudyPaths, StudyReport, StudyRow};
pub use pipeline::{StudyHandle, StudyPipeline};
