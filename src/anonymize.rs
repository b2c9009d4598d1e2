use std::path::Path;

use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::object::{DefaultDicomObject, InMemDicomObject};
use tracing::debug;

use crate::error::RecordError;
use crate::identifier::Pseudonym;
use crate::storage::ensure_parent;

pub const PATIENT_ID: Tag = Tag(0x0010, 0x0020);
/// Kept as an empty sequence; its items carry other identifiers of the patient.
pub const OTHER_PATIENT_IDS_SEQUENCE: Tag = Tag(0x0010, 0x1002);

/// Identifying attributes emptied in every anonymized record. The elements are kept with their VR.
pub const CLEARED_TAGS: [Tag; 21] = [
    Tag(0x0010, 0x0010), // PatientName
    Tag(0x0010, 0x0030), // PatientBirthDate
    Tag(0x0010, 0x0040), // PatientSex
    Tag(0x0010, 0x1010), // PatientAge
    Tag(0x0010, 0x1040), // PatientAddress
    Tag(0x0010, 0x2154), // PatientTelephoneNumbers
    Tag(0x0008, 0x0090), // ReferringPhysicianName
    Tag(0x0008, 0x1050), // PerformingPhysicianName
    Tag(0x0008, 0x1070), // OperatorsName
    Tag(0x0008, 0x0080), // InstitutionName
    Tag(0x0008, 0x0081), // InstitutionAddress
    Tag(0x0010, 0x4000), // PatientComments
    Tag(0x0010, 0x1000), // OtherPatientIDs
    Tag(0x0010, 0x1001), // OtherPatientNames
    Tag(0x0008, 0x103E), // SeriesDescription
    Tag(0x0008, 0x1030), // StudyDescription
    Tag(0x0032, 0x1032), // RequestingPhysician
    Tag(0x0010, 0x1090), // MedicalRecordLocator
    Tag(0x0010, 0x2160), // EthnicGroup
    Tag(0x0010, 0x2180), // Occupation
    Tag(0x0010, 0x21B0), // AdditionalPatientHistory
];

#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymizationPolicy {
    /// Drop every element in an odd (private) group as well.
    pub strip_private_tags: bool,
}

/// Produce the de-identified variant of `record`. The input object is left untouched.
pub fn anonymize(
    record: &DefaultDicomObject,
    pseudonym: &Pseudonym,
    policy: AnonymizationPolicy,
) -> DefaultDicomObject {
    let mut obj = record.clone();

    obj.put(DataElement::new(
        PATIENT_ID,
        VR::LO,
        PrimitiveValue::from(pseudonym.as_str()),
    ));

    for tag in CLEARED_TAGS {
        let vr = match obj.element(tag) {
            Ok(elem) => elem.vr(),
            Err(_) => continue,
        };
        obj.put(DataElement::new(tag, vr, PrimitiveValue::Empty));
    }

    scrub_nested(&mut obj);

    if policy.strip_private_tags {
        let private: Vec<Tag> = obj
            .iter()
            .map(|e| e.header().tag)
            .filter(|t| t.group() % 2 == 1)
            .collect();
        for tag in private {
            obj.remove_element(tag);
        }
    }

    obj
}

/// Empty every person name in the data set and its sequence items, and drop the
/// items of OtherPatientIDsSequence. Elements keep their tag and VR.
fn scrub_nested(obj: &mut InMemDicomObject) {
    let mut names = Vec::new();
    let mut sequences = Vec::new();
    for elem in obj.iter() {
        let tag = elem.header().tag;
        match elem.vr() {
            VR::PN => names.push(tag),
            VR::SQ => {
                if let Some(items) = elem.items() {
                    sequences.push((tag, items.to_vec()));
                }
            }
            _ => {}
        }
    }

    for tag in names {
        obj.put(DataElement::new(tag, VR::PN, PrimitiveValue::Empty));
    }
    for (tag, mut items) in sequences {
        if tag == OTHER_PATIENT_IDS_SEQUENCE {
            items.clear();
        } else {
            items.iter_mut().for_each(scrub_nested);
        }
        obj.put(DataElement::new(tag, VR::SQ, DataSetSequence::from(items)));
    }
}

/// Anonymize `record` and write it to `output`, creating parent directories.
pub fn anonymize_to(
    record: &DefaultDicomObject,
    pseudonym: &Pseudonym,
    policy: AnonymizationPolicy,
    output: &Path,
) -> Result<(), RecordError> {
    let anonymized = anonymize(record, pseudonym, policy);

    ensure_parent(output).map_err(|e| RecordError::Anonymize {
        target: output.to_path_buf(),
        source: Box::new(e),
    })?;
    anonymized
        .write_to_file(output)
        .map_err(|e| RecordError::Anonymize {
            target: output.to_path_buf(),
            source: Box::new(e),
        })?;

    debug!(output = %output.display(), "wrote anonymized record");
    Ok(())
}
