//
// storage.rs
// Study-Anonymizer-rs
//
// Mirrors source-relative paths into per-study output trees and sanitizes names derived from operator input.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// One destination subtree, `<root>/<folder>`, that mirrors the source layout.
#[derive(Debug, Clone)]
pub struct OutputTree {
    base: PathBuf,
}

impl OutputTree {
    pub fn new(root: impl AsRef<Path>, folder: &str) -> Self {
        Self {
            base: root.as_ref().join(folder),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Destination for a source-relative path. Absolute paths and `..` are refused.
    pub fn target_for(&self, relative: &Path) -> io::Result<PathBuf> {
        let mut target = self.base.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => target.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{} escapes the output tree", relative.display()),
                    ))
                }
            }
        }
        Ok(target)
    }

    /// Copy the unmodified source bytes to the mirrored location.
    pub fn copy_original(&self, source: &Path, relative: &Path) -> io::Result<PathBuf> {
        let target = self.target_for(relative)?;
        ensure_parent(&target)?;
        fs::copy(source, &target)?;
        Ok(target)
    }
}

/// Create the parent directory of `path` if needed.
pub fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Whether `create_dir_all(path)` can work without creating anything yet: the nearest existing
/// ancestor (or the path itself) must be a directory.
pub fn is_creatable_dir(path: &Path) -> bool {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .map_or(true, Path::is_dir)
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_` and cap the length.
pub fn sanitize_filename(input: &str, max_len: usize) -> String {
    input
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(max_len)
        .collect()
}
