//
// ledger.rs
// Study-Anonymizer-rs
//
// Per-project append-only CSV ledger that hands out patient and study sequence numbers and records finished studies.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::models::{PatientMatch, StudyRow};
use crate::storage::sanitize_filename;

pub const LEDGER_SUFFIX: &str = "_metadata.csv";
pub const MAX_PROJECT_STEM: usize = 64;

pub const COL_PATIENT_ID: &str = "PatientID";
pub const COL_FIRST_NAME: &str = "FirstName";
pub const COL_LAST_NAME: &str = "LastName";
pub const COL_STUDY_DATE: &str = "StudyDate";
pub const COL_PROJECT_ID: &str = "ProjectID";
pub const COL_MODALITY: &str = "Modality";
pub const COL_PATIENT_SEQUENCE: &str = "PatientSequence";
pub const COL_STUDY_SEQUENCE: &str = "StudySequence";

/// Column order of a freshly created ledger. `StudySequence` follows `PatientSequence`.
pub const HEADER: [&str; 8] = [
    COL_PATIENT_ID,
    COL_FIRST_NAME,
    COL_LAST_NAME,
    COL_STUDY_DATE,
    COL_PROJECT_ID,
    COL_MODALITY,
    COL_PATIENT_SEQUENCE,
    COL_STUDY_SEQUENCE,
];

fn patient_number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^pat(\d+)$").expect("static pattern"))
}

/// Ledger file name for a project: unsafe characters replaced, length capped, fixed suffix.
pub fn ledger_file_name(project_id: &str) -> Result<String, LedgerError> {
    let stem = sanitize_filename(project_id, MAX_PROJECT_STEM);
    if stem.is_empty() {
        return Err(LedgerError::InvalidProjectId(project_id.to_string()));
    }
    Ok(format!("{stem}{LEDGER_SUFFIX}"))
}

/// Whole ledger file held in memory for one operation.
struct LedgerTable {
    headers: StringRecord,
    records: Vec<StringRecord>,
}

impl LedgerTable {
    fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.trim() == name)
    }

    fn field<'a>(record: &'a StringRecord, column: Option<usize>) -> &'a str {
        column.and_then(|idx| record.get(idx)).unwrap_or("").trim()
    }

    /// Whether a row for the same patient and study number is already recorded.
    fn contains_study(&self, row: &StudyRow) -> bool {
        let id_col = self.column(COL_PATIENT_ID);
        let seq_col = self.column(COL_PATIENT_SEQUENCE);
        let study_col = self.column(COL_STUDY_SEQUENCE);
        let study_number = row.study_number.to_string();
        self.records.iter().any(|r| {
            Self::field(r, id_col) == row.patient_id
                || (study_col.is_some()
                    && Self::field(r, seq_col) == row.patient_seq
                    && Self::field(r, study_col) == study_number)
        })
    }
}

type ReservationKey = (String, String, u32);

/// Project-scoped study ledger. Every operation re-reads the file under the project's lock.
///
/// Study numbers handed to running studies are reserved until their row is appended, so two
/// runs in this process never share one. Separate processes can still observe the same
/// "next" number between a suggestion and the later append.
#[derive(Debug)]
pub struct SequenceLedger {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    reserved: Mutex<HashSet<ReservationKey>>,
}

/// A study number held for one run. Released on drop.
#[derive(Debug)]
pub struct StudyReservation<'a> {
    ledger: &'a SequenceLedger,
    key: ReservationKey,
}

impl StudyReservation<'_> {
    pub fn number(&self) -> u32 {
        self.key.2
    }
}

impl Drop for StudyReservation<'_> {
    fn drop(&mut self) {
        self.ledger
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl SequenceLedger {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            locks: Mutex::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ledger_path(&self, project_id: &str) -> Result<PathBuf, LedgerError> {
        Ok(self.dir.join(ledger_file_name(project_id)?))
    }

    fn project_lock(&self, file_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(file_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` on the parsed ledger while holding the project's lock. `None` means no file.
    fn with_table<T>(
        &self,
        project_id: &str,
        f: impl FnOnce(Option<&LedgerTable>) -> T,
    ) -> Result<T, LedgerError> {
        let file_name = ledger_file_name(project_id)?;
        let path = self.dir.join(&file_name);
        let lock = self.project_lock(&file_name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let table = read_table(&path)?;
        Ok(f(table.as_ref()))
    }

    /// Next free `Pat<N>` for the project; `Pat1` when nothing usable is recorded.
    pub fn next_patient_number(&self, project_id: &str) -> Result<String, LedgerError> {
        self.with_table(project_id, |table| {
            let Some(table) = table else {
                return "Pat1".to_string();
            };
            let Some(column) = table.column(COL_PATIENT_SEQUENCE) else {
                return "Pat1".to_string();
            };

            let mut highest: Option<u64> = None;
            for record in &table.records {
                let value = LedgerTable::field(record, Some(column));
                let Some(caps) = patient_number_pattern().captures(value) else {
                    continue;
                };
                match caps[1].parse::<u64>() {
                    Ok(n) => highest = Some(highest.map_or(n, |h| h.max(n))),
                    Err(err) => warn!(value, %err, "skipping malformed patient sequence"),
                }
            }

            match highest {
                Some(n) => format!("Pat{}", n.saturating_add(1)),
                None => "Pat1".to_string(),
            }
        })
    }

    /// Next study number for one patient: max recorded + 1, or row count + 1 on legacy ledgers.
    /// Numbers reserved by running studies are skipped.
    pub fn next_study_number(&self, project_id: &str, patient_seq: &str) -> Result<u32, LedgerError> {
        let patient_seq = patient_seq.trim();
        let file_name = ledger_file_name(project_id)?;
        self.with_table(project_id, |table| {
            let reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
            first_unreserved(&reserved, &file_name, patient_seq, recorded_next(table, patient_seq))
        })
    }

    /// Hold the next study number for one patient until the returned reservation is dropped.
    pub fn reserve_study_number(
        &self,
        project_id: &str,
        patient_seq: &str,
    ) -> Result<StudyReservation<'_>, LedgerError> {
        let patient_seq = patient_seq.trim();
        let file_name = ledger_file_name(project_id)?;
        let key = self.with_table(project_id, |table| {
            let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
            let number =
                first_unreserved(&reserved, &file_name, patient_seq, recorded_next(table, patient_seq));
            let key = (file_name.clone(), patient_seq.to_string(), number);
            reserved.insert(key.clone());
            key
        })?;
        debug!(patient_seq, study_number = key.2, "reserved study number");
        Ok(StudyReservation { ledger: self, key })
    }

    /// Patients whose last name contains `query` (case-insensitive). An empty query lists every
    /// patient. Results are deduplicated per patient sequence for every query, not only the empty
    /// one, and sorted by display label.
    pub fn search_by_surname(
        &self,
        project_id: &str,
        query: &str,
    ) -> Result<Vec<PatientMatch>, LedgerError> {
        let needle = query.trim().to_lowercase();
        self.with_table(project_id, |table| {
            let Some(table) = table else {
                return Vec::new();
            };
            let (Some(first_col), Some(last_col), Some(seq_col)) = (
                table.column(COL_FIRST_NAME),
                table.column(COL_LAST_NAME),
                table.column(COL_PATIENT_SEQUENCE),
            ) else {
                return Vec::new();
            };

            let mut seen = HashSet::new();
            let mut matches = Vec::new();
            for record in &table.records {
                let last_name = LedgerTable::field(record, Some(last_col));
                if !needle.is_empty() && !last_name.to_lowercase().contains(&needle) {
                    continue;
                }
                let patient_seq = LedgerTable::field(record, Some(seq_col));
                if !seen.insert(patient_seq.to_string()) {
                    continue;
                }
                let first_name = LedgerTable::field(record, Some(first_col));
                matches.push(PatientMatch {
                    display_label: format!("{last_name}, {first_name} ({patient_seq})"),
                    first_name: first_name.to_string(),
                    last_name: last_name.to_string(),
                    patient_seq: patient_seq.to_string(),
                });
            }

            matches.sort_by(|a, b| a.display_label.cmp(&b.display_label));
            matches
        })
    }

    /// Every recorded study, in file order. Legacy rows get their ordinal as study number.
    pub fn rows(&self, project_id: &str) -> Result<Vec<StudyRow>, LedgerError> {
        self.with_table(project_id, |table| {
            let Some(table) = table else {
                return Vec::new();
            };
            let col = |name| table.column(name);
            let (id, first, last, date, project, modality, seq, study) = (
                col(COL_PATIENT_ID),
                col(COL_FIRST_NAME),
                col(COL_LAST_NAME),
                col(COL_STUDY_DATE),
                col(COL_PROJECT_ID),
                col(COL_MODALITY),
                col(COL_PATIENT_SEQUENCE),
                col(COL_STUDY_SEQUENCE),
            );

            let mut ordinals: HashMap<String, u32> = HashMap::new();
            table
                .records
                .iter()
                .map(|r| {
                    let patient_seq = LedgerTable::field(r, seq).to_string();
                    let ordinal = ordinals.entry(patient_seq.clone()).or_insert(0);
                    *ordinal += 1;
                    let study_number = LedgerTable::field(r, study)
                        .parse::<u32>()
                        .unwrap_or(*ordinal);
                    StudyRow {
                        patient_id: LedgerTable::field(r, id).to_string(),
                        first_name: LedgerTable::field(r, first).to_string(),
                        last_name: LedgerTable::field(r, last).to_string(),
                        study_date: LedgerTable::field(r, date).to_string(),
                        project_id: LedgerTable::field(r, project).to_string(),
                        modality: LedgerTable::field(r, modality).to_string(),
                        patient_seq,
                        study_number,
                    }
                })
                .collect()
        })
    }

    /// Append one row, writing the header first when the file is new or empty.
    pub fn append(&self, row: &StudyRow) -> Result<PathBuf, LedgerError> {
        let file_name = ledger_file_name(&row.project_id)?;
        let path = self.dir.join(&file_name);
        let lock = self.project_lock(&file_name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let io_err = |source| LedgerError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();

        let headers: Vec<String> = if len == 0 {
            HEADER.iter().map(|h| h.to_string()).collect()
        } else {
            let table = read_table(&path)?.ok_or_else(|| {
                io_err(io::Error::new(io::ErrorKind::NotFound, "ledger vanished during append"))
            })?;
            let headers: Vec<String> = table.headers.iter().map(|h| h.trim().to_string()).collect();
            for required in [COL_PATIENT_ID, COL_PATIENT_SEQUENCE] {
                if !headers.iter().any(|h| h == required) {
                    return Err(LedgerError::MalformedHeader {
                        path: path.clone(),
                        column: required,
                    });
                }
            }
            if table.contains_study(row) {
                return Err(LedgerError::DuplicateStudy {
                    path: path.clone(),
                    patient_seq: row.patient_seq.clone(),
                    study_number: row.study_number,
                });
            }
            if !ends_with_newline(&mut file).map_err(io_err)? {
                // A previous writer died mid-line; start the new row on its own line.
                file.write_all(b"\n").map_err(io_err)?;
            }
            headers
        };

        let fields: Vec<String> = headers.iter().map(|h| field_for(row, h)).collect();
        let csv_err = |source| LedgerError::Csv {
            path: path.clone(),
            source,
        };
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        if len == 0 {
            writer.write_record(&headers).map_err(csv_err)?;
        }
        writer.write_record(&fields).map_err(csv_err)?;
        writer.flush().map_err(io_err)?;

        info!(
            ledger = %path.display(),
            patient_seq = %row.patient_seq,
            study_number = row.study_number,
            "appended study row"
        );
        Ok(path)
    }
}

fn field_for(row: &StudyRow, column: &str) -> String {
    match column.trim() {
        COL_PATIENT_ID => row.patient_id.clone(),
        COL_FIRST_NAME => row.first_name.clone(),
        COL_LAST_NAME => row.last_name.clone(),
        COL_STUDY_DATE => row.study_date.clone(),
        COL_PROJECT_ID => row.project_id.clone(),
        COL_MODALITY => row.modality.clone(),
        COL_PATIENT_SEQUENCE => row.patient_seq.clone(),
        COL_STUDY_SEQUENCE => row.study_number.to_string(),
        _ => String::new(),
    }
}

fn read_table(path: &Path) -> Result<Option<LedgerTable>, LedgerError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LedgerError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let csv_err = |source| LedgerError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file);
    let headers = reader.headers().map_err(csv_err)?.clone();
    let records = reader
        .records()
        .collect::<Result<Vec<_>, _>>()
        .map_err(csv_err)?;

    Ok(Some(LedgerTable { headers, records }))
}

/// Max recorded study number + 1 for the patient; row count + 1 when no number is recorded.
fn recorded_next(table: Option<&LedgerTable>, patient_seq: &str) -> u32 {
    let Some(table) = table else {
        return 1;
    };
    let Some(seq_column) = table.column(COL_PATIENT_SEQUENCE) else {
        return 1;
    };
    let study_column = table.column(COL_STUDY_SEQUENCE);

    let matching: Vec<&StringRecord> = table
        .records
        .iter()
        .filter(|r| LedgerTable::field(r, Some(seq_column)) == patient_seq)
        .collect();
    let count = u32::try_from(matching.len()).unwrap_or(u32::MAX);

    let Some(study_column) = study_column else {
        debug!(patient_seq, "legacy ledger without study column, counting rows");
        return count.saturating_add(1);
    };

    let highest = matching
        .iter()
        .filter_map(|r| {
            let raw = LedgerTable::field(r, Some(study_column));
            match raw.parse::<u32>() {
                Ok(n) => Some(n),
                Err(_) => {
                    if !raw.is_empty() {
                        warn!(patient_seq, value = raw, "skipping malformed study number");
                    }
                    None
                }
            }
        })
        .max();

    match highest {
        Some(n) => n.saturating_add(1),
        None => count.saturating_add(1),
    }
}

fn first_unreserved(
    reserved: &HashSet<ReservationKey>,
    file_name: &str,
    patient_seq: &str,
    mut candidate: u32,
) -> u32 {
    while reserved.contains(&(file_name.to_string(), patient_seq.to_string(), candidate)) {
        candidate = candidate.saturating_add(1);
    }
    candidate
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
