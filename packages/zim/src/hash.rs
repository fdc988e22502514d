//! Hashing operations and types.
//!
//! Everything that enters a cache key goes through [`Sha1Digest`], rendered
//! as lowercase hex. SHA1 is not used for security here, only as a stable
//! content fingerprint, and the choice is load-bearing: changing the
//! algorithm invalidates every previously stored cache entry.

use color_eyre::Result;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::trace;

use crate::{fs, path::AbsFilePath};

/// A SHA1 hash rendered as lowercase hex.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
pub struct Sha1Digest(String);

impl Sha1Digest {
    /// Hash the contents of the file at the specified path.
    ///
    /// The file is streamed through a buffered reader; it is never fully
    /// buffered in memory.
    pub fn from_file(path: &AbsFilePath) -> Result<Self> {
        let file = fs::open_file(path)?;
        let mut reader = std::io::BufReader::new(file);
        let mut hasher = Sha1::new();
        let bytes = std::io::copy(&mut reader, &mut hasher)?;

        let hash = hex::encode(hasher.finalize());
        trace!(%path, %hash, bytes, "hash file");
        Ok(Self(hash))
    }

    /// Hash the contents of a buffer.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let buffer = buffer.as_ref();
        let hash = hex::encode(Sha1::digest(buffer));
        trace!(%hash, bytes = buffer.len(), "hash buffer");
        Self(hash)
    }

    /// Hash the bytes of a UTF-8 string.
    pub fn from_text(text: impl AsRef<str>) -> Self {
        Self::from_buffer(text.as_ref().as_bytes())
    }

    /// View the hash as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unwrap the hash into its hex string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for Sha1Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<Sha1Digest> for String {
    fn from(hash: Sha1Digest) -> Self {
        hash.0
    }
}
