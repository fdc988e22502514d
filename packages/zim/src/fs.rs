//! Filesystem operations tailored to `zim`.
//!
//! Thin wrappers over `std::fs` that attach the path to every error.
//! Inside this module we refer to `std::fs` by its fully qualified path to
//! make it maximally clear what we are using.

use std::time::SystemTime;

use color_eyre::{Result, eyre::Context};
use tracing::trace;

use crate::path::{AbsDirPath, AbsFilePath};

/// Open the file for reading.
pub fn open_file(path: &AbsFilePath) -> Result<std::fs::File> {
    std::fs::File::open(path.as_std_path()).with_context(|| format!("open {path}"))
}

/// Read the entire file into a buffer.
pub fn read(path: &AbsFilePath) -> Result<Vec<u8>> {
    std::fs::read(path.as_std_path()).with_context(|| format!("read {path}"))
}

/// Read the entire file as UTF-8.
pub fn read_to_string(path: &AbsFilePath) -> Result<String> {
    std::fs::read_to_string(path.as_std_path()).with_context(|| format!("read {path}"))
}

/// Write the buffer to the file, creating parent directories as needed.
pub fn write(path: &AbsFilePath, contents: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(&parent)?;
    }
    let contents = contents.as_ref();
    trace!(%path, bytes = contents.len(), "write file");
    std::fs::write(path.as_std_path(), contents).with_context(|| format!("write {path}"))
}

/// Create the directory and all of its parents.
pub fn create_dir_all(path: &AbsDirPath) -> Result<()> {
    std::fs::create_dir_all(path.as_std_path()).with_context(|| format!("create dir {path}"))
}

/// Copy a file, creating the destination's parent directories as needed.
pub fn copy_file(src: &AbsFilePath, dst: &AbsFilePath) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        create_dir_all(&parent)?;
    }
    std::fs::copy(src.as_std_path(), dst.as_std_path())
        .with_context(|| format!("copy {src} to {dst}"))
}

/// Remove a file if it exists.
pub fn remove_file(path: &AbsFilePath) -> Result<()> {
    match std::fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {path}")),
    }
}

/// Report whether the path names an existing file.
pub fn is_file(path: &AbsFilePath) -> bool {
    path.as_std_path().is_file()
}

/// Report whether the path names an existing directory.
pub fn is_dir(path: &AbsDirPath) -> bool {
    path.as_std_path().is_dir()
}

/// Report whether anything exists at the path.
pub fn exists(path: &std::path::Path) -> bool {
    path.exists()
}

/// The modification time of the file, if it exists.
pub fn modified(path: &AbsFilePath) -> Result<SystemTime> {
    std::fs::metadata(path.as_std_path())
        .and_then(|m| m.modified())
        .with_context(|| format!("stat {path}"))
}
