//
// classify.rs
// Study-Anonymizer-rs
//
// Decides whether a file is a DICOM record at all and whether a parsed record must be left out of a study.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use dicom::core::Tag;
use dicom::object::OpenFileOptions;
use serde::Serialize;
use tracing::warn;

use crate::dicom_access::ElementAccess;

pub const RECORD_EXTENSIONS: [&str; 4] = ["dcm", "dicom", "dic", "ima"];
pub const MAGIC_OFFSET: usize = 128;
pub const MAGIC_MARKER: &[u8; 4] = b"DICM";

pub const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);
pub const SERIES_DESCRIPTION: Tag = Tag(0x0008, 0x103E);
/// Private vendor element flagging report/summary objects.
pub const REPORT_TYPE: Tag = Tag(0x0029, 0x1008);

pub const REPORT_SENTINEL: &str = "REPORT";
pub const PLACEHOLDER_PAYLOADS: [&[u8]; 2] = [b"--", b"NONE"];
pub const SUMMARY_MARKER: &str = "STATISTICS";

/// Result of the candidate test for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidacy {
    Accepted,
    /// `looked_like_record` is set when a cheap check passed but parsing failed.
    Rejected { looked_like_record: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExclusionReason {
    ReportType,
    PlaceholderPayload,
    SummaryDescription,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExclusionReason::ReportType => "report-type record",
            ExclusionReason::PlaceholderPayload => "placeholder pixel payload",
            ExclusionReason::SummaryDescription => "statistics/summary series",
        };
        f.write_str(text)
    }
}

pub fn has_record_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| {
            RECORD_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

pub fn has_magic_marker(path: &Path) -> bool {
    let mut head = [0u8; MAGIC_OFFSET + 4];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut head))
        .map(|_| &head[MAGIC_OFFSET..] == MAGIC_MARKER)
        .unwrap_or(false)
}

/// Parse everything up to the pixel payload. This is the authoritative check.
pub fn parses_as_record(path: &Path) -> bool {
    OpenFileOptions::new()
        .read_until(PIXEL_DATA)
        .open_file(path)
        .is_ok()
}

pub fn classify_candidate(path: &Path) -> Candidacy {
    let looked_like_record = has_record_extension(path) || has_magic_marker(path);
    if parses_as_record(path) {
        Candidacy::Accepted
    } else {
        Candidacy::Rejected { looked_like_record }
    }
}

pub fn is_candidate(path: &Path) -> bool {
    classify_candidate(path) == Candidacy::Accepted
}

/// First exclusion rule that fires, in order: report type, placeholder payload, summary description.
pub fn exclusion_reason<T: ElementAccess>(record: &T) -> Option<ExclusionReason> {
    if let Some(raw) = record.element_bytes(REPORT_TYPE) {
        match decode_text(&raw) {
            Some(text) if text == REPORT_SENTINEL => return Some(ExclusionReason::ReportType),
            Some(_) => {}
            None => warn!("report-type element is not decodable text, ignoring it"),
        }
    }

    // The description marker is only consulted for records that carry a payload element.
    if record.has_element(PIXEL_DATA) {
        if let Some(raw) = record.element_bytes(PIXEL_DATA) {
            let payload = trim_padding(&raw);
            if PLACEHOLDER_PAYLOADS.iter().any(|p| payload == *p) {
                return Some(ExclusionReason::PlaceholderPayload);
            }
        }

        let is_summary = record
            .element_str(SERIES_DESCRIPTION)
            .map_or(false, |d| d.to_uppercase().contains(SUMMARY_MARKER));
        if is_summary {
            return Some(ExclusionReason::SummaryDescription);
        }
    }

    None
}

pub fn should_exclude<T: ElementAccess>(record: &T) -> bool {
    exclusion_reason(record).is_some()
}

fn trim_padding(raw: &[u8]) -> &[u8] {
    let end = raw
        .iter()
        .rposition(|b| *b != 0 && *b != b' ')
        .map_or(0, |i| i + 1);
    &raw[..end]
}

/// Strict ASCII first, UTF-8 as the fallback.
fn decode_text(raw: &[u8]) -> Option<String> {
    let raw = trim_padding(raw);
    if raw.is_ascii() {
        return Some(raw.iter().map(|b| *b as char).collect());
    }
    std::str::from_utf8(raw).ok().map(str::to_string)
}
