//
// study_workflows.rs
// Study-Anonymizer-rs
//
// Integration-style tests covering scanning, exclusion, copy/anonymize mirroring, ledger rows, cancellation and idempotent output.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;

use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use study_anonymizer::anonymize::{self, AnonymizationPolicy};
use study_anonymizer::identifier;
use study_anonymizer::models::{PipelineState, RunStatus};
use study_anonymizer::pipeline::{PipelineOptions, RunControl, StatusEvent};
use study_anonymizer::{
    SequenceLedger, StudyError, StudyMetadata, StudyPaths, StudyPipeline,
};
use tempfile::{tempdir, TempDir};
use walkdir::WalkDir;

fn build_record(study_date: &str) -> InMemDicomObject<StandardDataDictionary> {
    // Tiny Secondary Capture instance with identifying attributes filled in.
    let mut obj = InMemDicomObject::new_empty_with_dict(StandardDataDictionary);
    obj.put(DataElement::new(
        Tag(0x0010, 0x0010),
        VR::PN,
        PrimitiveValue::from("Test^Patient"),
    ));
    obj.put(DataElement::new(
        Tag(0x0010, 0x0020),
        VR::LO,
        PrimitiveValue::from("PAT123"),
    ));
    obj.put(DataElement::new(
        Tag(0x0010, 0x0030),
        VR::DA,
        PrimitiveValue::from("19700101"),
    ));
    obj.put(DataElement::new(
        Tag(0x0008, 0x0080),
        VR::LO,
        PrimitiveValue::from("General Hospital"),
    ));
    obj.put(DataElement::new(
        Tag(0x0008, 0x0060),
        VR::CS,
        PrimitiveValue::from("CT"),
    ));
    obj.put(DataElement::new(
        Tag(0x0008, 0x0020),
        VR::DA,
        PrimitiveValue::from(study_date),
    ));
    obj.put(DataElement::new(
        Tag(0x0008, 0x0016),
        VR::UI,
        PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.7"),
    ));
    obj.put(DataElement::new(
        Tag(0x0008, 0x0018),
        VR::UI,
        PrimitiveValue::from("1.2.826.0.1.3680043.2.1125.1"),
    ));
    obj.put(DataElement::new(
        Tag(0x7fe0, 0x0010),
        VR::OB,
        PrimitiveValue::from(vec![0_u8, 64, 128, 255]),
    ));
    obj
}

fn write_record(path: &Path, obj: InMemDicomObject<StandardDataDictionary>) {
    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
        .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
        .media_storage_sop_instance_uid("1.2.826.0.1.3680043.2.1125.1")
        .build()
        .expect("meta");

    let mut file_obj = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
    for elem in obj {
        file_obj.put(elem);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    file_obj.write_to_file(path).expect("write test dicom");
}

fn placeholder_record() -> InMemDicomObject<StandardDataDictionary> {
    let mut obj = build_record("20230101");
    obj.put(DataElement::new(
        Tag(0x7fe0, 0x0010),
        VR::OB,
        PrimitiveValue::from(b"--".to_vec()),
    ));
    obj
}

fn report_record() -> InMemDicomObject<StandardDataDictionary> {
    let mut obj = build_record("20220101");
    obj.put(DataElement::new(
        Tag(0x0029, 0x1008),
        VR::LO,
        PrimitiveValue::from("REPORT"),
    ));
    obj
}

struct Workspace {
    _dir: TempDir,
    source: PathBuf,
    paths: StudyPaths,
    ledger_dir: PathBuf,
}

fn workspace() -> Workspace {
    let dir = tempdir().expect("tempdir");
    let source = dir.path().join("source");
    fs::create_dir_all(&source).expect("source dir");
    let paths = StudyPaths {
        source_root: source.clone(),
        originals_root: dir.path().join("originals"),
        anonymized_root: dir.path().join("anonymized"),
    };
    let ledger_dir = dir.path().join("ledger");
    Workspace {
        _dir: dir,
        source,
        paths,
        ledger_dir,
    }
}

fn pipeline(ws: &Workspace) -> StudyPipeline {
    let ledger = Arc::new(SequenceLedger::new(&ws.ledger_dir));
    StudyPipeline::new(
        ledger,
        PipelineOptions {
            workers: 2,
            policy: AnonymizationPolicy::default(),
        },
    )
}

fn metadata(patient_seq: &str, study_number: Option<u32>) -> StudyMetadata {
    StudyMetadata::new("SD", "CT", "Ana", "Smith", patient_seq, study_number).expect("metadata")
}

fn relative_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(root).expect("prefix").to_path_buf())
        .collect();
    files.sort();
    files
}

fn element_text(path: &Path, tag: Tag) -> String {
    let obj = dicom::object::open_file(path).expect("open output");
    let text = obj.element(tag).expect("element").to_str().expect("text").into_owned();
    text.trim_end_matches(['\0', ' ']).to_string()
}

#[test]
fn end_to_end_mirrors_included_records_and_appends_one_row() {
    let ws = workspace();
    write_record(&ws.source.join("a.dcm"), build_record("20240101"));
    write_record(&ws.source.join("series1/b.dcm"), build_record("20240101"));
    write_record(&ws.source.join("series1/deep/IM0003"), build_record("20240101"));
    write_record(&ws.source.join("series2/placeholder.dcm"), placeholder_record());
    fs::write(ws.source.join("notes.txt"), b"operator notes").expect("write notes");

    let pipeline = pipeline(&ws);
    let report = pipeline
        .run(&metadata("Pat7", None), &ws.paths, &RunControl::default())
        .expect("run");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.discovered, 4);
    assert_eq!(report.excluded, 1);
    assert_eq!(report.copied, 3);
    assert_eq!(report.anonymized, 3);
    assert_eq!(report.failed, 0);
    assert!(report.ledger_written);
    assert_eq!(report.pseudonym, "ANON^SD||CT.0||Pat7");
    assert_eq!(report.study_date, "20240101");

    let expected = vec![
        PathBuf::from("a.dcm"),
        PathBuf::from("series1/b.dcm"),
        PathBuf::from("series1/deep/IM0003"),
    ];
    let folder = &report.folder_name;
    assert_eq!(relative_files(&ws.paths.originals_root.join(folder)), expected);
    assert_eq!(relative_files(&ws.paths.anonymized_root.join(folder)), expected);

    // Originals are byte-for-byte copies.
    let original = fs::read(ws.source.join("series1/b.dcm")).expect("read source");
    let copied = fs::read(ws.paths.originals_root.join(folder).join("series1/b.dcm")).expect("read copy");
    assert_eq!(original, copied);

    // Anonymized outputs carry the pseudonym and no identity.
    let anon_path = ws.paths.anonymized_root.join(folder).join("series1/b.dcm");
    assert_eq!(element_text(&anon_path, Tag(0x0010, 0x0020)), "ANON^SD||CT.0||Pat7");
    assert_eq!(element_text(&anon_path, Tag(0x0010, 0x0010)), "");
    assert_eq!(element_text(&anon_path, Tag(0x0008, 0x0080)), "");
    assert_eq!(element_text(&anon_path, Tag(0x0010, 0x0030)), "");

    // Source files are untouched.
    assert_eq!(element_text(&ws.source.join("series1/b.dcm"), Tag(0x0010, 0x0020)), "PAT123");

    let rows = pipeline.ledger().rows("SD").expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].patient_seq, "Pat7");
    assert_eq!(rows[0].study_number, 1);
    assert_eq!(rows[0].last_name, "Smith");
    assert_eq!(rows[0].study_date, "20240101");
}

#[test]
fn report_type_records_are_not_counted_or_dated() {
    let ws = workspace();
    write_record(&ws.source.join("a_report.dcm"), report_record());
    write_record(&ws.source.join("b_undated.dcm"), build_record(""));
    write_record(&ws.source.join("c_image.dcm"), build_record("20240303"));

    let report = pipeline(&ws)
        .run(&metadata("Pat1", None), &ws.paths, &RunControl::default())
        .expect("run");

    assert_eq!(report.discovered, 3);
    assert_eq!(report.excluded, 1);
    assert_eq!(report.copied, 2);
    assert_eq!(report.anonymized, 2);
    assert_eq!(report.study_date, "20240303");
    assert!(!ws
        .paths
        .anonymized_root
        .join(&report.folder_name)
        .join("a_report.dcm")
        .exists());
}

#[test]
fn missing_study_date_records_unknown() {
    let ws = workspace();
    write_record(&ws.source.join("a.dcm"), build_record(""));

    let report = pipeline(&ws)
        .run(&metadata("Pat1", None), &ws.paths, &RunControl::default())
        .expect("run");
    assert_eq!(report.study_date, "unknown");
}

#[test]
fn repeated_studies_take_the_next_number_from_the_ledger() {
    let ws = workspace();
    write_record(&ws.source.join("a.dcm"), build_record("20240101"));
    let pipeline = pipeline(&ws);

    let first = pipeline
        .run(&metadata("Pat2", Some(1)), &ws.paths, &RunControl::default())
        .expect("first run");
    assert_eq!(first.study_number, 1);

    // The operator form still shows the stale suggestion.
    let second = pipeline
        .run(&metadata("Pat2", Some(1)), &ws.paths, &RunControl::default())
        .expect("second run");
    assert_eq!(second.study_number, 2);
    assert_eq!(second.pseudonym, "ANON^SD||CT.1||Pat2");
    assert_ne!(first.folder_name, second.folder_name);

    assert_eq!(pipeline.suggest_next_study_number("SD", "Pat2").expect("next"), 3);
    assert_eq!(pipeline.suggest_next_patient_number("SD").expect("next"), "Pat3");
    let found = pipeline.search_patients("SD", "smi").expect("search");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].patient_seq, "Pat2");
}

#[test]
fn preflight_failures_abort_before_file_work() {
    let ws = workspace();
    let pipeline = pipeline(&ws);

    let err = pipeline
        .run(&metadata("Pat1", None), &ws.paths, &RunControl::default())
        .unwrap_err();
    assert!(matches!(err, StudyError::NoRecordsFound(_)));
    assert!(!ws.paths.originals_root.exists());
    assert!(!ws.paths.anonymized_root.exists());

    let mut missing = ws.paths.clone();
    missing.source_root = ws.source.join("absent");
    let err = pipeline
        .run(&metadata("Pat1", None), &missing, &RunControl::default())
        .unwrap_err();
    assert!(matches!(err, StudyError::InvalidInput(_)));

    write_record(&ws.source.join("a.dcm"), build_record("20240101"));
    let control = RunControl::default();
    let err = pipeline
        .run(&metadata("Patient1", None), &ws.paths, &control)
        .unwrap_err();
    assert!(matches!(err, StudyError::IdentifierInvalid(_)));
    assert_eq!(control.progress.state(), PipelineState::Failed);
    assert!(relative_files(&ws.paths.anonymized_root).is_empty());
    assert!(pipeline.ledger().rows("SD").expect("rows").is_empty());
}

#[test]
fn unreadable_record_is_isolated() {
    let ws = workspace();
    write_record(&ws.source.join("a.dcm"), build_record("20240101"));
    let truncated = ws.source.join("b.dcm");
    write_record(&truncated, build_record("20240101"));
    let bytes = fs::read(&truncated).expect("read");
    fs::write(&truncated, &bytes[..bytes.len() - 2]).expect("truncate");

    let report = pipeline(&ws)
        .run(&metadata("Pat1", None), &ws.paths, &RunControl::default())
        .expect("run");

    assert_eq!(report.discovered, 2);
    assert_eq!(report.copied, 1);
    assert_eq!(report.anonymized, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.status, RunStatus::CompletedWithErrors);
    assert!(report.ledger_written);
}

#[test]
fn cancelled_run_leaves_the_ledger_alone() {
    let ws = workspace();
    write_record(&ws.source.join("a.dcm"), build_record("20240101"));
    write_record(&ws.source.join("b.dcm"), build_record("20240101"));

    let control = RunControl::default();
    control.cancel.cancel();
    let pipeline = pipeline(&ws);
    let report = pipeline
        .run(&metadata("Pat1", None), &ws.paths, &control)
        .expect("run");

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.copied, 0);
    assert!(!report.ledger_written);
    assert!(pipeline.ledger().rows("SD").expect("rows").is_empty());
}

#[test]
fn background_run_reports_progress_and_status() {
    let ws = workspace();
    for name in ["a.dcm", "b.dcm", "c.dcm"] {
        write_record(&ws.source.join(name), build_record("20240101"));
    }

    let pipeline = Arc::new(pipeline(&ws));
    let handle = pipeline.start_study(metadata("Pat1", None), ws.paths.clone());
    let events: Vec<StatusEvent> = handle.events().iter().collect();
    assert_eq!(handle.progress().fraction(), 1.0);
    assert_eq!(handle.progress().state(), PipelineState::Done);

    let report = handle.join().expect("join");
    assert_eq!(report.anonymized, 3);

    let fractions: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::Progress(f) => Some(*f),
            StatusEvent::Status(_) => None,
        })
        .collect();
    assert_eq!(fractions.len(), 3);
    assert!(fractions.iter().all(|f| (0.0..=1.0).contains(f)));
    assert!(fractions.iter().any(|f| (*f - 1.0).abs() < f64::EPSILON));
    assert!(events
        .iter()
        .any(|e| matches!(e, StatusEvent::Status(s) if s.starts_with("Processed 3 records"))));
}

#[test]
fn anonymizing_twice_is_byte_identical() {
    let ws = workspace();
    let source = ws.source.join("a.dcm");
    write_record(&source, build_record("20240101"));
    let record = dicom::object::open_file(&source).expect("open");
    let pseudonym = identifier::build("SD", "CT", 1, "Pat7").expect("pseudonym");

    let first = ws.paths.anonymized_root.join("one/a.dcm");
    let second = ws.paths.anonymized_root.join("two/a.dcm");
    anonymize::anonymize_to(&record, &pseudonym, AnonymizationPolicy::default(), &first).expect("first");
    anonymize::anonymize_to(&record, &pseudonym, AnonymizationPolicy::default(), &second).expect("second");

    assert_eq!(fs::read(first).expect("read"), fs::read(second).expect("read"));
}

#[test]
fn copy_failure_still_anonymizes_the_record() {
    let ws = workspace();
    write_record(&ws.source.join("a.dcm"), build_record("20240101"));
    write_record(&ws.source.join("b.dcm"), build_record("20240101"));

    // A directory squatting on the copy target makes the copy fail.
    let folder = identifier::build("SD", "CT", 1, "Pat1").expect("pseudonym").folder_name();
    fs::create_dir_all(ws.paths.originals_root.join(&folder).join("a.dcm")).expect("squat");

    let report = pipeline(&ws)
        .run(&metadata("Pat1", None), &ws.paths, &RunControl::default())
        .expect("run");

    assert_eq!(report.status, RunStatus::CompletedWithErrors);
    assert_eq!(report.copied, 1);
    assert_eq!(report.anonymized, 2);
    assert!(report.copied < report.anonymized);
    assert_eq!(report.failed, 1);
    assert!(report.failures[0].contains("a.dcm"));
    assert!(ws.paths.anonymized_root.join(&folder).join("a.dcm").is_file());
    assert!(report.ledger_written);
}

#[test]
fn ledger_write_failure_is_reported_not_fatal() {
    let ws = workspace();
    write_record(&ws.source.join("a.dcm"), build_record("20240101"));
    fs::create_dir_all(&ws.ledger_dir).expect("ledger dir");
    fs::write(ws.ledger_dir.join("SD_metadata.csv"), "Name,Date\na,b\n").expect("broken ledger");

    let report = pipeline(&ws)
        .run(&metadata("Pat1", None), &ws.paths, &RunControl::default())
        .expect("run");

    assert_eq!(report.status, RunStatus::CompletedWithErrors);
    assert_eq!(report.anonymized, 1);
    assert_eq!(report.failed, 0);
    assert!(!report.ledger_written);
    let message = report.ledger_error.expect("ledger error");
    assert!(message.contains("PatientID"));
}

#[test]
fn concurrent_runs_for_one_patient_get_distinct_study_numbers() {
    let ws = workspace();
    for n in 0..20 {
        write_record(&ws.source.join(format!("img{n:02}.dcm")), build_record("20240101"));
    }

    let pipeline = Arc::new(pipeline(&ws));
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            let barrier = Arc::clone(&barrier);
            let paths = ws.paths.clone();
            thread::spawn(move || {
                barrier.wait();
                pipeline
                    .run(&metadata("Pat1", None), &paths, &RunControl::default())
                    .expect("run")
            })
        })
        .collect();
    let mut reports: Vec<_> = handles.into_iter().map(|h| h.join().expect("join")).collect();
    reports.sort_by_key(|r| r.study_number);

    assert_eq!(reports[0].study_number, 1);
    assert_eq!(reports[1].study_number, 2);
    assert_ne!(reports[0].folder_name, reports[1].folder_name);
    for report in &reports {
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.anonymized, 20);
    }

    let mut numbers: Vec<u32> = pipeline
        .ledger()
        .rows("SD")
        .expect("rows")
        .iter()
        .map(|r| r.study_number)
        .collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![1, 2]);
    assert_eq!(pipeline.suggest_next_study_number("SD", "Pat1").expect("next"), 3);
}
