//! Choosing the document to parse inside an archive

use std::fs::File;
use std::path::Path;

use super::ExtractError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedDocument {
    pub name: String,
    /// Uncompressed size
    pub size: u64,
    /// Number of XML entries considered
    pub candidates: usize,
}

/// Largest `.xml` entry wins; ties go to the lexicographically smaller name.
pub fn choose_document<I>(entries: I) -> Option<SelectedDocument>
where
    I: IntoIterator<Item = (String, u64)>,
{
    let mut candidates = 0;
    let mut best: Option<(String, u64)> = None;

    for (name, size) in entries {
        if !name.to_lowercase().ends_with(".xml") {
            continue;
        }
        candidates += 1;
        let better = match &best {
            None => true,
            Some((best_name, best_size)) => {
                size > *best_size || (size == *best_size && name < *best_name)
            },
        };
        if better {
            best = Some((name, size));
        }
    }

    best.map(|(name, size)| SelectedDocument {
        name,
        size,
        candidates,
    })
}

/// Inspect the archive's central directory without decompressing anything.
pub fn select_document(archive_path: &Path) -> Result<Option<SelectedDocument>, ExtractError> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| ExtractError::zip(archive_path, e))?;

    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|e| ExtractError::zip(archive_path, e))?;
        if entry.is_dir() {
            continue;
        }
        entries.push((entry.name().to_string(), entry.size()));
    }

    Ok(choose_document(entries))
}
