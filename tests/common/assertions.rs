//! Assertions over output trees and zip segments

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Every regular file below `root`, relative to it, sorted
pub fn files_below(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(root).unwrap().to_path_buf())
        .collect();
    files.sort();
    files
}

/// Entry name to content for every entry of every segment
pub fn segment_entries(segments: &[PathBuf]) -> BTreeMap<String, Vec<u8>> {
    let mut entries = BTreeMap::new();
    for segment in segments {
        let mut archive = zip::ZipArchive::new(std::fs::File::open(segment).unwrap()).unwrap();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            let previous = entries.insert(entry.name().to_string(), data);
            assert!(previous.is_none(), "entry {} appears twice", entry.name());
        }
    }
    entries
}
