//! Path types tailored to `zim`.
//!
//! The cache key stores repo-relative paths while the runner and executors
//! deal in absolute ones, and mixing the two up silently breaks key
//! portability across machines. These types make the distinction explicit:
//! a [`TypedPath`] is parameterized over its base (absolute or relative)
//! and its kind (file or directory), and conversions between the two are
//! spelled out at the call site.
//!
//! Paths are stored exactly as provided; no normalization is performed.
//! `some/path` and `some/path/` are not considered equivalent.

use std::{
    borrow::Cow,
    ffi::OsStr,
    marker::PhantomData,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

use color_eyre::{
    Report, Result,
    eyre::{Context, bail},
};
use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tap::Pipe;

pub type RelFilePath = TypedPath<Rel, File>;
pub type RelDirPath = TypedPath<Rel, Dir>;
pub type AbsFilePath = TypedPath<Abs, File>;
pub type AbsDirPath = TypedPath<Abs, Dir>;

/// Make an instance of a [`RelFilePath`] from a literal.
///
/// Panics if the literal is not a relative path, so this is only for
/// statically known segments.
#[macro_export]
macro_rules! mk_rel_file {
    ($path:literal) => {
        $crate::path::RelFilePath::try_from($path).unwrap()
    };
}

/// Make an instance of a [`RelDirPath`] from a literal.
///
/// Panics if the literal is not a relative path, so this is only for
/// statically known segments.
#[macro_export]
macro_rules! mk_rel_dir {
    ($path:literal) => {
        $crate::path::RelDirPath::try_from($path).unwrap()
    };
}

/// An absolute path begins at the filesystem root.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Abs;

/// A relative path describes steps from some yet-unnamed starting point.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Rel;

/// A directory contains other file system entities.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Dir;

/// A file contains data.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct File;

/// A location on the file system according to the type modifiers.
///
/// This type is about _intent_ within the working program; it does not
/// validate that the resource exists on disk or is of the stated kind.
/// Validation at construction would make it impossible to name outputs
/// that don't exist yet, and is race-prone anyway.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
#[display("{}", self.inner.display())]
pub struct TypedPath<Base, Kind> {
    base: PhantomData<Base>,
    kind: PhantomData<Kind>,
    inner: PathBuf,
}

impl<B, K> TypedPath<B, K> {
    /// View the path as a standard path.
    pub fn as_std_path(&self) -> &Path {
        &self.inner
    }

    /// View the path as a lossily-converted string.
    pub fn as_str_lossy(&self) -> Cow<'_, str> {
        self.inner.to_string_lossy()
    }

    /// Returns the final component of the path, if there is one.
    pub fn file_name(&self) -> Option<&OsStr> {
        self.inner.file_name()
    }

    /// Get the parent of the path, if one exists.
    ///
    /// Unlike the standard library, this returns `None` for the parent of a
    /// single-component relative path.
    pub fn parent(&self) -> Option<TypedPath<B, Dir>> {
        self.inner
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| TypedPath::new_unchecked(p.to_owned()))
    }

    /// Iterate through the components of the path.
    pub fn components(&self) -> impl DoubleEndedIterator<Item = Component<'_>> {
        self.inner.components()
    }

    fn new_unchecked(inner: impl Into<PathBuf>) -> Self {
        Self {
            base: PhantomData,
            kind: PhantomData,
            inner: inner.into(),
        }
    }
}

/// Fallible construction is powered by [`Validator`] implementations on the
/// base marker: the operation succeeds iff the validator accepts the path.
pub trait Validator {
    fn validate(path: &Path) -> Result<()>;
}

impl Validator for Abs {
    fn validate(path: &Path) -> Result<()> {
        if !path.is_absolute() {
            bail!("path is not absolute: {path:?}");
        }
        Ok(())
    }
}

impl Validator for Rel {
    fn validate(path: &Path) -> Result<()> {
        if !path.is_relative() {
            bail!("path is not relative: {path:?}");
        }
        Ok(())
    }
}

impl Validator for Dir {
    fn validate(_: &Path) -> Result<()> {
        Ok(())
    }
}

impl Validator for File {
    fn validate(_: &Path) -> Result<()> {
        Ok(())
    }
}

macro_rules! impl_try_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl<B: Validator, K: Validator> TryFrom<$ty> for TypedPath<B, K> {
                type Error = Report;

                fn try_from(value: $ty) -> Result<Self> {
                    let value = PathBuf::from(value);
                    B::validate(&value)?;
                    K::validate(&value)?;
                    Ok(Self::new_unchecked(value))
                }
            }
        )*
    };
}

impl_try_from!(PathBuf, &PathBuf, &Path, String, &String, &str);

impl<B: Validator, K: Validator> FromStr for TypedPath<B, K> {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self> {
        Self::try_from(s)
    }
}

impl<B, K> AsRef<TypedPath<B, K>> for TypedPath<B, K> {
    fn as_ref(&self) -> &TypedPath<B, K> {
        self
    }
}

impl<B, K> AsRef<Path> for TypedPath<B, K> {
    fn as_ref(&self) -> &Path {
        &self.inner
    }
}

impl<B, K> From<TypedPath<B, K>> for PathBuf {
    fn from(value: TypedPath<B, K>) -> Self {
        value.inner
    }
}

impl<'de, B: Validator, K: Validator> Deserialize<'de> for TypedPath<B, K> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let p = PathBuf::deserialize(deserializer)?;
        Self::try_from(p).map_err(serde::de::Error::custom)
    }
}

impl<B, K> Serialize for TypedPath<B, K> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.inner.serialize(serializer)
    }
}

impl<B, K> std::fmt::Debug for TypedPath<B, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.inner)
    }
}

impl AbsDirPath {
    /// Get the current working directory for the process.
    pub fn current() -> Result<AbsDirPath> {
        std::env::current_dir()
            .context("get current dir")?
            .pipe(AbsDirPath::try_from)
    }

    /// Canonicalize the directory, resolving symlinks and `..` segments.
    pub fn canonicalize(&self) -> Result<AbsDirPath> {
        self.inner
            .canonicalize()
            .with_context(|| format!("canonicalize {:?}", self.inner))?
            .pipe(AbsDirPath::try_from)
    }
}

/// Infallibly joins known valid paths together.
pub trait JoinWith<Other> {
    type Output;

    fn join(&self, other: Other) -> Self::Output;
}

impl JoinWith<&RelDirPath> for AbsDirPath {
    type Output = AbsDirPath;

    fn join(&self, other: &RelDirPath) -> AbsDirPath {
        TypedPath::new_unchecked(self.inner.join(&other.inner))
    }
}

impl JoinWith<&RelFilePath> for AbsDirPath {
    type Output = AbsFilePath;

    fn join(&self, other: &RelFilePath) -> AbsFilePath {
        TypedPath::new_unchecked(self.inner.join(&other.inner))
    }
}

/// Creates and joins a path from a free-form segment.
///
/// Segments come from manifests, so they're only checked at runtime: joining
/// an absolute segment onto a directory is an error rather than the silent
/// replacement `PathBuf::join` performs.
pub trait TryJoinWith {
    fn try_join_dir(&self, dir: impl AsRef<str>) -> Result<AbsDirPath>;
    fn try_join_file(&self, file: impl AsRef<str>) -> Result<AbsFilePath>;
}

impl TryJoinWith for AbsDirPath {
    fn try_join_dir(&self, dir: impl AsRef<str>) -> Result<AbsDirPath> {
        let dir = dir.as_ref();
        Rel::validate(Path::new(dir))?;
        self.inner.join(dir).pipe(AbsDirPath::try_from)
    }

    fn try_join_file(&self, file: impl AsRef<str>) -> Result<AbsFilePath> {
        let file = file.as_ref();
        Rel::validate(Path::new(file))?;
        self.inner.join(file).pipe(AbsFilePath::try_from)
    }
}

/// Functionality for making a path relative using a base path.
pub trait RelativeTo<Other> {
    type Output;

    /// Make `self` relative to `other`, erroring when `other` is not a
    /// prefix of `self`.
    fn relative_to(&self, other: Other) -> Self::Output;
}

impl<K: Validator> RelativeTo<&AbsDirPath> for TypedPath<Abs, K> {
    type Output = Result<TypedPath<Rel, K>>;

    fn relative_to(&self, other: &AbsDirPath) -> Self::Output {
        self.inner
            .strip_prefix(&other.inner)
            .with_context(|| format!("make {:?} relative to {:?}", self.inner, other.inner))?
            .to_owned()
            .pipe(TypedPath::try_from)
    }
}

impl<K> TypedPath<Abs, K> {
    /// Compute the relative path from `base` to `self`, inserting `..`
    /// segments where `base` is not a prefix. Both paths must be absolute
    /// and already normalized.
    pub fn relative_from(&self, base: &AbsDirPath) -> TypedPath<Rel, K> {
        let mut target = self.inner.components().peekable();
        let mut from = base.inner.components().peekable();
        while let (Some(a), Some(b)) = (target.peek(), from.peek()) {
            if a != b {
                break;
            }
            target.next();
            from.next();
        }
        let mut out = PathBuf::new();
        for _ in from {
            out.push("..");
        }
        for c in target {
            out.push(c.as_os_str());
        }
        TypedPath::new_unchecked(out)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rejects_mismatched_base() {
        assert!(AbsDirPath::try_from("relative/dir").is_err());
        assert!(RelFilePath::try_from("/abs/file").is_err());
    }

    #[test]
    fn joins_are_typed() {
        let root = AbsDirPath::try_from("/repo").unwrap();
        let file = root.join(&mk_rel_file!("src/main.go"));
        assert_eq!(file.as_std_path(), Path::new("/repo/src/main.go"));
    }

    #[test]
    fn relative_to_strips_prefix() {
        let root = AbsDirPath::try_from("/repo").unwrap();
        let file = AbsFilePath::try_from("/repo/widget/main.go").unwrap();
        let rel = file.relative_to(&root).unwrap();
        assert_eq!(rel.as_std_path(), Path::new("widget/main.go"));
    }

    #[test]
    fn relative_from_inserts_parent_segments() {
        let base = AbsDirPath::try_from("/repo/widget").unwrap();
        let target = AbsFilePath::try_from("/repo/artifacts/widget-exe").unwrap();
        let rel = target.relative_from(&base);
        assert_eq!(rel.as_std_path(), Path::new("../artifacts/widget-exe"));
    }

    #[test]
    fn try_join_rejects_absolute_segments() {
        let root = AbsDirPath::try_from("/repo").unwrap();
        assert!(root.try_join_file("/etc/passwd").is_err());
        assert!(root.try_join_file("etc/passwd").is_ok());
    }
}
