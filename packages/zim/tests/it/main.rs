use std::sync::Arc;

use tempfile::TempDir;
use zim::{
    path::AbsDirPath,
    project::{Project, ProjectOptions},
};

pub mod caching;
pub mod commands;
pub mod conditions;
pub mod keys;

#[track_caller]
pub fn temporary_directory() -> (TempDir, AbsDirPath) {
    let dir = TempDir::new().expect("create temporary directory");
    let path = AbsDirPath::try_from(dir.path()).expect("read temp dir as abs dir");
    (dir, path)
}

#[track_caller]
pub fn write(root: &AbsDirPath, rel: &str, contents: &str) {
    let path = root.as_std_path().join(rel);
    std::fs::create_dir_all(path.parent().expect("relative path has a parent"))
        .expect("create parent directories");
    std::fs::write(path, contents).expect("write fixture file");
}

#[track_caller]
pub fn load(root: &AbsDirPath) -> Arc<Project> {
    Project::load(root, ProjectOptions::default()).expect("load project")
}

/// Whether a program is available on the PATH; tests that shell out to
/// optional tools skip themselves when it isn't.
pub fn installed(program: &str) -> bool {
    std::process::Command::new("which")
        .arg(program)
        .stdout(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
