use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::classify::{self, Candidacy};
use crate::error::ScanError;

/// Outcome of one full enumeration of a source tree.
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    /// Source-relative paths of valid records, in scan order.
    pub records: Vec<PathBuf>,
    /// Files that looked like records but failed to parse.
    pub rejected: Vec<PathBuf>,
    /// Entries below the root that could not be read; skipped, the rest of the tree is still scanned.
    pub unreadable: Vec<PathBuf>,
}

/// Enumerate every regular file under `root` once and keep those that parse as records.
pub fn scan(root: &Path) -> Result<ScanSummary, ScanError> {
    if !root.is_dir() {
        return Err(ScanError::DirectoryNotFound(root.to_path_buf()));
    }

    let mut summary = ScanSummary::default();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(source) if source.depth() == 0 => {
                return Err(ScanError::Walk {
                    root: root.to_path_buf(),
                    source,
                })
            }
            Err(err) => {
                warn!(%err, "cannot read entry, skipping it");
                let relative = err
                    .path()
                    .and_then(|p| p.strip_prefix(root).ok())
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                summary.unreadable.push(relative);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = match path.strip_prefix(root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };

        match classify::classify_candidate(path) {
            Candidacy::Accepted => summary.records.push(relative),
            Candidacy::Rejected {
                looked_like_record: true,
            } => {
                warn!(path = %path.display(), "looks like a DICOM record but failed to parse, skipping");
                summary.rejected.push(relative);
            }
            Candidacy::Rejected { .. } => debug!(path = %path.display(), "not a record"),
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn missing_root_is_reported() {
        let dir = tempdir().expect("tmpdir");
        let missing = dir.path().join("nope");
        assert!(matches!(scan(&missing), Err(ScanError::DirectoryNotFound(_))));
    }

    #[test]
    fn junk_files_are_dropped_and_fake_records_rejected() {
        let dir = tempdir().expect("tmpdir");
        fs::write(dir.path().join("notes.txt"), b"hello").expect("write");
        fs::create_dir_all(dir.path().join("series")).expect("mkdir");
        fs::write(dir.path().join("series/broken.dcm"), b"not dicom at all").expect("write");

        let summary = scan(dir.path()).expect("scan");
        assert!(summary.records.is_empty());
        assert_eq!(summary.rejected, vec![PathBuf::from("series/broken.dcm")]);
        assert!(summary.unreadable.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_subdirectory_does_not_stop_the_scan() {
        use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
        use dicom::dictionary_std::StandardDataDictionary;
        use dicom::object::{FileDicomObject, FileMetaTableBuilder};
        use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().expect("tmpdir");
        let meta = FileMetaTableBuilder::new()
            .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
            .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
            .media_storage_sop_instance_uid("1.2.826.0.1.3680043.2.1125.1")
            .build()
            .expect("meta");
        let mut obj = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
        obj.put(DataElement::new(Tag(0x0010, 0x0020), VR::LO, PrimitiveValue::from("PAT1")));
        obj.write_to_file(dir.path().join("a.dcm")).expect("write");

        let locked = dir.path().join("locked");
        fs::create_dir_all(&locked).expect("mkdir");
        fs::write(locked.join("b.dcm"), b"hidden").expect("write");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).expect("chmod");
        let blocked = fs::read_dir(&locked).is_err();

        let summary = scan(dir.path());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod back");

        let summary = summary.expect("scan");
        assert_eq!(summary.records, vec![PathBuf::from("a.dcm")]);
        if blocked {
            // Only observable when permissions are enforced (not as root).
            assert_eq!(summary.unreadable, vec![PathBuf::from("locked")]);
        }
    }
}
