//! Capability-scoped file access for templates, workflows and artifacts.

use std::io;

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Errors raised by file access.
#[derive(Debug, Error)]
pub enum FileError {
    /// The path names a directory rather than a file.
    #[error("path has no file name: {path}")]
    NoFileName {
        /// Offending path.
        path: String,
    },
    /// The parent directory could not be opened.
    #[error("cannot open directory `{path}`: {source}")]
    OpenDir {
        /// Directory path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The file could not be read.
    #[error("cannot read `{path}`: {source}")]
    Read {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The file could not be written.
    #[error("cannot write `{path}`: {source}")]
    Write {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Expands a leading `~` to the user's home directory.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if (path == "~" || path.starts_with("~/"))
        && let Some(home) = std::env::var_os("HOME")
    {
        let suffix = path.trim_start_matches('~');
        return format!("{}{suffix}", home.to_string_lossy());
    }
    path.to_owned()
}

fn open_parent(path: &Utf8Path) -> Result<(Dir, &str), FileError> {
    let file_name = path.file_name().ok_or_else(|| FileError::NoFileName {
        path: path.to_string(),
    })?;
    let parent = match path.parent() {
        Some(dir) if !dir.as_str().is_empty() => dir,
        _ => Utf8Path::new("."),
    };
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|source| {
        FileError::OpenDir {
            path: parent.to_string(),
            source,
        }
    })?;
    Ok((dir, file_name))
}

/// Reads a UTF-8 file through an ambient directory capability.
///
/// # Errors
///
/// Returns [`FileError`] when the directory cannot be opened or the file
/// cannot be read.
pub fn read_to_string(path: &str) -> Result<String, FileError> {
    let expanded = expand_tilde(path);
    let (dir, file_name) = open_parent(Utf8Path::new(&expanded))?;
    dir.read_to_string(file_name).map_err(|source| FileError::Read {
        path: expanded.clone(),
        source,
    })
}

/// Writes `bytes` to a file, replacing any existing content.
///
/// # Errors
///
/// Returns [`FileError`] when the directory cannot be opened or the file
/// cannot be written.
pub fn write_bytes(path: &str, bytes: &[u8]) -> Result<(), FileError> {
    let expanded = expand_tilde(path);
    let (dir, file_name) = open_parent(Utf8Path::new(&expanded))?;
    dir.write(file_name, bytes).map_err(|source| FileError::Write {
        path: expanded.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn utf8_path(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn write_then_read_round_trips_text() {
        let dir = TempDir::new().expect("tempdir");
        let path = utf8_path(&dir, "graph.json");

        write_bytes(&path, b"{\"1\": {}}").expect("write");

        assert_eq!(read_to_string(&path).expect("read"), "{\"1\": {}}");
    }

    #[test]
    fn reading_missing_file_reports_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = utf8_path(&dir, "absent.json");

        let err = read_to_string(&path).expect_err("missing file");

        assert!(
            matches!(err, FileError::Read { path: ref failed, .. } if *failed == path),
            "{err:?}"
        );
        assert!(err.to_string().contains("absent.json"), "{err}");
    }

    #[test]
    fn writing_into_missing_directory_names_the_directory() {
        let dir = TempDir::new().expect("tempdir");
        let path = utf8_path(&dir, "missing/out.png");

        let err = write_bytes(&path, b"png").expect_err("no parent directory");

        assert!(matches!(err, FileError::OpenDir { .. }), "{err:?}");
        assert!(err.to_string().contains("missing"), "{err}");
    }

    #[test]
    fn directory_path_has_no_file_name() {
        let err = read_to_string("/tmp/..").expect_err("no file name");

        assert!(matches!(err, FileError::NoFileName { .. }), "{err:?}");
    }

    #[test]
    fn tilde_is_left_alone_mid_path() {
        assert_eq!(expand_tilde("/tmp/~/x"), "/tmp/~/x");
    }
}
