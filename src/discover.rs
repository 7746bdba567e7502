//! Input file discovery.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Collects the regular files in `dir` whose name satisfies the predicate.
///
/// The result is sorted by path so callers always see the same ingestion
/// order regardless of directory iteration order. Entries with non-UTF-8
/// names never match.
pub fn discover_files<P>(dir: &Path, mut predicate: P) -> io::Result<Vec<PathBuf>>
where
    P: FnMut(&str) -> bool,
{
    let mut files = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if predicate(name) {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    return Ok(files);
}
