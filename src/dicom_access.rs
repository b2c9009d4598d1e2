use dicom::core::Tag;
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{DefaultDicomObject, InMemDicomObject};

/// Small helper trait to pull text and raw bytes from different DICOM object shapes.
pub trait ElementAccess {
    fn element_str(&self, tag: Tag) -> Option<String>;
    fn element_bytes(&self, tag: Tag) -> Option<Vec<u8>>;
    fn has_element(&self, tag: Tag) -> bool;
}

impl ElementAccess for InMemDicomObject<StandardDataDictionary> {
    fn element_str(&self, tag: Tag) -> Option<String> {
        self.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
    }

    fn element_bytes(&self, tag: Tag) -> Option<Vec<u8>> {
        self.element(tag)
            .ok()
            .and_then(|e| e.value().primitive())
            .map(|v| v.to_bytes().into_owned())
    }

    fn has_element(&self, tag: Tag) -> bool {
        self.element(tag).is_ok()
    }
}

impl ElementAccess for DefaultDicomObject {
    fn element_str(&self, tag: Tag) -> Option<String> {
        (**self).element_str(tag)
    }

    fn element_bytes(&self, tag: Tag) -> Option<Vec<u8>> {
        (**self).element_bytes(tag)
    }

    fn has_element(&self, tag: Tag) -> bool {
        (**self).has_element(tag)
    }
}
