//! Persisted index cache: one JSON snapshot of every indexed file's parse result, read at load
//! to skip re-parsing files whose modification time is unchanged.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::{error::TreeError, fs::FileSystem, node::Timestamp, parser::ParsedContent};

pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedIndex {
    pub modified: Timestamp,
    pub hash: String,
    pub parsed: ParsedContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCache {
    pub version: u32,
    pub entries: BTreeMap<String, CachedIndex>,
}

impl Default for IndexCache {
    fn default() -> Self {
        IndexCache {
            version: IndexCache::VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl IndexCache {
    pub const VERSION: u32 = 1;

    /// Reads the cache at `path`. A missing file or an older format yields None.
    pub async fn read(fs: &dyn FileSystem, path: &str) -> Result<Option<IndexCache>, TreeError> {
        if fs.stat(path).await?.is_none() {
            return Ok(None);
        }
        let cache: IndexCache = serde_json::from_str(&fs.read_file(path).await?)?;
        if cache.version != IndexCache::VERSION {
            tracing::info!(
                "[IndexCache] discarding cache version {} (expected {})",
                cache.version,
                IndexCache::VERSION
            );
            return Ok(None);
        }
        Ok(Some(cache))
    }

    pub async fn write(&self, fs: &dyn FileSystem, path: &str) -> Result<(), TreeError> {
        fs.write_file(path, &serde_json::to_string(self)?).await
    }

    /// The cached parse for `path` if it was recorded at `modified`.
    pub fn fresh(&self, path: &str, modified: Timestamp) -> Option<&CachedIndex> {
        self.entries
            .get(path)
            .filter(|entry| entry.modified == modified)
    }
}
