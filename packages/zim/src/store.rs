//! Blob stores.
//!
//! The cache middleware talks to a [`Store`] through three operations:
//! `head`, `get`, and `put`, each independent and safe for concurrent
//! calls. There are no transactions; last write wins. The filesystem
//! implementation keeps each blob next to a small JSON metadata file.

use std::collections::BTreeMap;

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

use crate::{
    fs,
    path::{AbsDirPath, AbsFilePath, TryJoinWith},
};

/// Metadata key carrying the hex SHA1 of the stored output.
pub const META_HASH: &str = "Hash";
/// Metadata key carrying an opaque user identity.
pub const META_USER: &str = "User";

/// What `head` reveals about a stored item.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ItemInfo {
    pub metadata: BTreeMap<String, String>,
}

/// A blob store addressed by cache key.
pub trait Store: Send + Sync {
    /// Look up an item without fetching it. `Ok(None)` is a cache miss;
    /// errors are store failures.
    fn head(&self, key: &str) -> Result<Option<ItemInfo>>;

    /// Download the item to `dst`.
    fn get(&self, key: &str, dst: &AbsFilePath) -> Result<()>;

    /// Upload the file at `src` under `key` with the given metadata.
    fn put(&self, key: &str, src: &AbsFilePath, metadata: BTreeMap<String, String>) -> Result<()>;

    /// Upload raw bytes under `key` with the given metadata.
    fn put_bytes(&self, key: &str, bytes: &[u8], metadata: BTreeMap<String, String>)
    -> Result<()>;
}

/// Filesystem-backed store: one file per blob, one `.meta.json` per blob.
#[derive(Clone, Debug)]
pub struct FsStore {
    root: AbsDirPath,
}

impl FsStore {
    /// Open a store rooted at `root`, creating the directory as needed.
    pub fn open(root: &AbsDirPath) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self { root: root.clone() })
    }

    fn blob_path(&self, key: &str) -> Result<AbsFilePath> {
        self.root.try_join_file(key)
    }

    fn meta_path(&self, key: &str) -> Result<AbsFilePath> {
        self.root.try_join_file(format!("{key}.meta.json"))
    }

    fn write_meta(&self, key: &str, metadata: BTreeMap<String, String>) -> Result<()> {
        let info = ItemInfo { metadata };
        let encoded = serde_json::to_vec_pretty(&info).context("encode metadata")?;
        fs::write(&self.meta_path(key)?, encoded)
    }
}

impl Store for FsStore {
    #[instrument(name = "FsStore::head", skip(self))]
    fn head(&self, key: &str) -> Result<Option<ItemInfo>> {
        let blob = self.blob_path(key)?;
        if !fs::is_file(&blob) {
            trace!(%key, "miss");
            return Ok(None);
        }
        let meta = self.meta_path(key)?;
        let info = if fs::is_file(&meta) {
            let raw = fs::read_to_string(&meta)?;
            serde_json::from_str(&raw).with_context(|| format!("decode metadata for {key}"))?
        } else {
            ItemInfo::default()
        };
        Ok(Some(info))
    }

    #[instrument(name = "FsStore::get", skip(self))]
    fn get(&self, key: &str, dst: &AbsFilePath) -> Result<()> {
        let blob = self.blob_path(key)?;
        fs::copy_file(&blob, dst).with_context(|| format!("fetch {key}"))?;
        Ok(())
    }

    #[instrument(name = "FsStore::put", skip(self, metadata))]
    fn put(&self, key: &str, src: &AbsFilePath, metadata: BTreeMap<String, String>) -> Result<()> {
        let blob = self.blob_path(key)?;
        fs::copy_file(src, &blob).with_context(|| format!("store {key}"))?;
        self.write_meta(key, metadata)
    }

    #[instrument(name = "FsStore::put_bytes", skip(self, bytes, metadata))]
    fn put_bytes(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        fs::write(&self.blob_path(key)?, bytes)?;
        self.write_meta(key, metadata)
    }
}
