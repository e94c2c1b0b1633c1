//! Reading route source files.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Error returned by file loading collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    NotFound(PathBuf),
    Invalid(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::NotFound(path) => write!(f, "{} does not exist", path.display()),
            LoadError::Invalid(reason) => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for LoadError {}

/// Source of route text.
///
/// The preprocessor reads included files through this trait,
///     which lets tests and hosts supply files that are not on disk.
pub trait SourceLoader {
    fn read(&self, path: &Path) -> Result<String, LoadError>;

    fn exists(&self, path: &Path) -> bool;
}

/// Loader that reads files from the local file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSystem;

impl SourceLoader for FileSystem {
    fn read(&self, path: &Path) -> Result<String, LoadError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(decode(&bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(LoadError::NotFound(path.into()))
            }
            Err(err) => Err(LoadError::Invalid(err.to_string())),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Loader backed by an in-memory map from paths to file contents.
#[derive(Debug, Default, Clone)]
pub struct InMemorySources(HashMap<PathBuf, String>);

impl InMemorySources {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, source: impl Into<String>) {
        self.0.insert(normalize(&path.into()), source.into());
    }
}

impl SourceLoader for InMemorySources {
    fn read(&self, path: &Path) -> Result<String, LoadError> {
        self.0
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| LoadError::NotFound(path.into()))
    }

    fn exists(&self, path: &Path) -> bool {
        self.0.contains_key(&normalize(path))
    }
}

/// Decodes the bytes of a route file.
///
/// UTF-16 files are recognized by their byte order mark.
/// Everything else is decoded as UTF-8, with invalid sequences replaced.
pub fn decode(bytes: &[u8]) -> String {
    match bytes {
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        [0xFF, 0xFE, rest @ ..] => decode_utf16(rest, u16::from_le_bytes),
        [0xFE, 0xFF, rest @ ..] => decode_utf16(rest, u16::from_be_bytes),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn decode_utf16(bytes: &[u8], f: fn([u8; 2]) -> u16) -> String {
    let units = bytes.chunks_exact(2).map(|c| f([c[0], c[1]]));
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Resolves a file name written in a route file relative to a folder.
///
/// Route files are usually written on Windows, so backslashes separate folders too.
pub fn resolve(folder: &Path, file: &str) -> PathBuf {
    let mut path = folder.to_path_buf();
    for part in file.trim().split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                path.pop();
            }
            part => path.push(part),
        }
    }
    path
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_strips_utf8_bom() {
        assert_eq!(decode(b"\xEF\xBB\xBFTrack.Sta A"), "Track.Sta A");
    }

    #[test]
    fn decode_utf16_little_endian() {
        assert_eq!(decode(&[0xFF, 0xFE, b'A', 0, b'1', 0]), "A1");
    }

    #[test]
    fn decode_invalid_utf8_is_lossy() {
        assert_eq!(decode(b"a\xFFb"), "a\u{FFFD}b");
    }

    #[test]
    fn resolve_backslashes() {
        assert_eq!(
            resolve(Path::new("/routes/line"), "..\\objects\\rail.csv"),
            PathBuf::from("/routes/objects/rail.csv")
        );
    }

    #[test]
    fn in_memory_sources() {
        let mut sources = InMemorySources::new();
        sources.insert("/r/inc.csv", "Track.Pitch 1");
        assert!(sources.exists(&resolve(Path::new("/r/sub"), "../inc.csv")));
        assert_eq!(sources.read(Path::new("/r/./inc.csv")), Ok("Track.Pitch 1".to_string()));
        assert_eq!(
            sources.read(Path::new("/r/missing.csv")),
            Err(LoadError::NotFound("/r/missing.csv".into()))
        );
    }

    #[test]
    fn file_system_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("route.csv");
        std::fs::write(&path, "\u{FEFF}With Track").unwrap();
        assert!(FileSystem.exists(&path));
        assert_eq!(FileSystem.read(&path), Ok("With Track".to_string()));
        assert!(!FileSystem.exists(&dir.path().join("other.csv")));
    }
}
