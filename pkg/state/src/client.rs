use serde::Serialize;
use serde::de::DeserializeOwned;
use slatedb::Db;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::path::Path;
use std::sync::Arc;
use tracing::info;

/// Persistent state store backed by SlateDB on a local filesystem.
/// Holds published endpoint sets and ordinal status snapshots as JSON.
#[derive(Clone)]
pub struct StateStore {
    db: Db,
}

impl StateStore {
    /// Open (or create) a store rooted at the directory `path`.
    pub async fn new(path: &str) -> anyhow::Result<Self> {
        info!("Opening state store at {}", path);
        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("cannot create data directory {}: {}", path, e))?;

        let object_store =
            Arc::new(LocalFileSystem::new_with_prefix(path).map_err(store_err("open"))?);
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(store_err("open"))?;
        Ok(Self { db })
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.db
            .put(key.as_bytes(), value)
            .await
            .map(|_| ())
            .map_err(store_err("put"))
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let value = self
            .db
            .get(key.as_bytes())
            .await
            .map_err(store_err("get"))?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    /// Remove `key`. Removing a missing key is not an error.
    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.db
            .delete(key.as_bytes())
            .await
            .map(|_| ())
            .map_err(store_err("delete"))
    }

    /// Every `(key, value)` pair whose key starts with `prefix`, in key order.
    pub async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut iter = self
            .db
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(store_err("scan"))?;
        let mut entries = Vec::new();
        while let Some(kv) = iter.next().await.map_err(store_err("scan"))? {
            entries.push((String::from_utf8_lossy(&kv.key).into_owned(), kv.value.to_vec()));
        }
        Ok(entries)
    }

    /// Serialize `value` as JSON and store it under `key`.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let data = serde_json::to_vec(value)?;
        self.put(key, &data).await
    }

    /// Decode every JSON value under `prefix`, skipping entries that fail to parse.
    pub async fn list_json<T: DeserializeOwned>(&self, prefix: &str) -> anyhow::Result<Vec<T>> {
        Ok(self
            .list_prefix(prefix)
            .await?
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_slice(&v).ok())
            .collect())
    }

    /// Gracefully close the state store.
    pub async fn close(self) -> anyhow::Result<()> {
        info!("Closing state store");
        self.db.close().await.map_err(store_err("close"))
    }
}

fn store_err<E: std::fmt::Display>(op: &'static str) -> impl FnOnce(E) -> anyhow::Error {
    move |e| anyhow::anyhow!("state store {} failed: {}", op, e)
}
