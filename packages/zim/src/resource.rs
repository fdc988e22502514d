//! Resources and the providers that produce them.
//!
//! A [`Resource`] is anything a rule can consume or produce: its identity
//! is an absolute path, and it knows whether it exists, how to hash itself,
//! and when it last changed. A [`Provider`] is the factory for a backend's
//! resources. Only the filesystem provider ships here; the registry keyed
//! by name leaves room for container-image or stack backends without
//! changing callers.

use std::{sync::Arc, time::SystemTime};

use color_eyre::{Result, eyre::Context};

use crate::{
    fs, glob,
    hash::Sha1Digest,
    path::{AbsDirPath, AbsFilePath},
};

/// A single input or output of a rule.
pub trait Resource: Send + Sync {
    /// Identity: the absolute path of the resource.
    fn path(&self) -> &AbsFilePath;

    /// Whether the resource is backed by the local filesystem.
    fn on_filesystem(&self) -> bool;

    /// Whether the resource may be stored in and restored from the cache.
    fn cacheable(&self) -> bool;

    /// Whether the resource currently exists.
    fn exists(&self) -> bool;

    /// Content hash of the resource.
    fn hash(&self) -> Result<Sha1Digest>;

    /// When the resource last changed, if it exists.
    fn last_modified(&self) -> Result<SystemTime>;
}

/// Factory for a backend's resources.
pub trait Provider: Send + Sync {
    /// Wrap a single path as a resource.
    fn new_resource(&self, path: AbsFilePath) -> Arc<dyn Resource>;

    /// Expand patterns under `dir`, remove paths matched by the ignore
    /// patterns, and return the union as a deterministically sorted list.
    fn match_resources(
        &self,
        dir: &AbsDirPath,
        patterns: &[String],
        ignores: &[String],
    ) -> Result<Vec<Arc<dyn Resource>>>;
}

/// A regular file on the local filesystem.
#[derive(Clone, Debug)]
pub struct FileResource {
    path: AbsFilePath,
}

impl FileResource {
    pub fn new(path: AbsFilePath) -> Self {
        Self { path }
    }
}

impl Resource for FileResource {
    fn path(&self) -> &AbsFilePath {
        &self.path
    }

    fn on_filesystem(&self) -> bool {
        true
    }

    fn cacheable(&self) -> bool {
        true
    }

    fn exists(&self) -> bool {
        fs::is_file(&self.path)
    }

    fn hash(&self) -> Result<Sha1Digest> {
        Sha1Digest::from_file(&self.path).with_context(|| format!("hash {}", self.path))
    }

    fn last_modified(&self) -> Result<SystemTime> {
        fs::modified(&self.path)
    }
}

/// The default provider: resources are files, matched by glob patterns.
#[derive(Clone, Debug, Default)]
pub struct FileSystemProvider;

impl Provider for FileSystemProvider {
    fn new_resource(&self, path: AbsFilePath) -> Arc<dyn Resource> {
        Arc::new(FileResource::new(path))
    }

    fn match_resources(
        &self,
        dir: &AbsDirPath,
        patterns: &[String],
        ignores: &[String],
    ) -> Result<Vec<Arc<dyn Resource>>> {
        let paths = glob::match_patterns(dir, patterns, ignores)?;
        Ok(paths
            .into_iter()
            .map(|p| self.new_resource(p))
            .collect())
    }
}

/// Construct the provider registered under `name`.
///
/// The empty name selects the filesystem provider, matching manifests that
/// don't say otherwise.
pub fn create(name: &str) -> Result<Arc<dyn Provider>> {
    match name {
        "" | "file" | "filesystem" => Ok(Arc::new(FileSystemProvider)),
        other => color_eyre::eyre::bail!("unknown resource provider: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn file_resource_reports_existence_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.go");
        std::fs::write(&path, b"some source code").unwrap();
        let resource = FileResource::new(AbsFilePath::try_from(path).unwrap());
        assert!(resource.exists());
        assert!(resource.on_filesystem());
        assert_eq!(
            resource.hash().unwrap(),
            Sha1Digest::from_buffer(b"some source code"),
        );

        let missing = FileResource::new(
            AbsFilePath::try_from(dir.path().join("missing.go")).unwrap(),
        );
        assert!(!missing.exists());
        assert!(missing.hash().is_err());
    }

    #[test]
    fn provider_matches_and_ignores() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.go"), "a").unwrap();
        std::fs::write(dir.path().join("a_test.go"), "t").unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let provider = FileSystemProvider;
        let matched = provider
            .match_resources(&root, &["*.go".into()], &["*_test.go".into()])
            .unwrap();
        let names: Vec<_> = matched
            .iter()
            .map(|r| r.path().file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.go"]);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(create("cfn-stack").is_err());
        assert!(create("").is_ok());
    }
}
