//! File data storage contract
//!
//! File content is addressed by a [`FileDataKey`] (file id plus stream id)
//! and stored as fragments no larger than the store's maximum fragment size.
//! Several files can be packed into a single bundle for bulk transfer.
//!
//! Stores are only reachable through an authenticated session; see
//! [`crate::session::ServerSession::data_store`].

use crate::auth::Principal;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Stream id of a file's main data stream
pub const MAIN_STREAM: u32 = 0;

/// Default fragment size of [`MemoryDataStore`] (64KB)
pub const DEFAULT_FRAGMENT_SIZE: usize = 65536;

/// Composite key of one file data stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileDataKey {
    pub file_id: u64,
    pub stream_id: u32,
}

impl FileDataKey {
    pub fn new(file_id: u64, stream_id: u32) -> Self {
        Self { file_id, stream_id }
    }

    pub fn main(file_id: u64) -> Self {
        Self::new(file_id, MAIN_STREAM)
    }
}

impl fmt::Display for FileDataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.stream_id)
    }
}

/// Stored layout of one file data stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDataDetails {
    pub key: FileDataKey,
    pub length: u64,
    pub fragments: usize,
    /// Bundle holding this stream, if it was exported
    pub bundle_id: Option<u64>,
    pub modified: DateTime<Utc>,
}

/// Backing store for file content
#[async_trait]
pub trait FileDataStore: Send + Sync {
    /// Layout of a stored stream, `None` if nothing is stored under `key`
    async fn file_data_details(&self, key: FileDataKey) -> Result<Option<FileDataDetails>>;

    /// Largest fragment the store writes in one piece
    fn max_fragment_size(&self) -> usize;

    /// Load the full content of a stream
    async fn load_file_data(&self, key: FileDataKey) -> Result<Bytes>;

    /// Replace the content of a stream, returning the number of fragments
    /// written
    async fn save_file_data(&self, key: FileDataKey, data: Bytes) -> Result<usize>;

    async fn delete_file_data(&self, key: FileDataKey) -> Result<()>;

    /// Pack the given streams into a new bundle, returning its id
    async fn export_bundle(&self, keys: &[FileDataKey]) -> Result<u64>;

    /// Unpack a bundle, restoring each stream it holds. Returns the restored
    /// keys.
    async fn import_bundle(&self, bundle_id: u64) -> Result<Vec<FileDataKey>>;

    async fn delete_bundle(&self, bundle_id: u64) -> Result<()>;
}

/// Store access granted to an authenticated session
pub struct AuthorizedStore<'a, S: ?Sized> {
    store: &'a S,
    principal: Principal,
}

impl<'a, S: ?Sized> AuthorizedStore<'a, S> {
    pub(crate) fn new(store: &'a S, principal: Principal) -> Self {
        Self { store, principal }
    }

    /// Identity the access was granted to
    pub fn principal(&self) -> &Principal {
        &self.principal
    }
}

impl<S: ?Sized> Deref for AuthorizedStore<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.store
    }
}

#[derive(Debug)]
struct StoredStream {
    fragments: Vec<Bytes>,
    length: u64,
    bundle_id: Option<u64>,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    streams: HashMap<FileDataKey, StoredStream>,
    bundles: HashMap<u64, BTreeMap<FileDataKey, Bytes>>,
}

/// In-memory [`FileDataStore`]
#[derive(Debug)]
pub struct MemoryDataStore {
    fragment_size: usize,
    state: RwLock<MemoryState>,
    next_bundle: AtomicU64,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::with_fragment_size(DEFAULT_FRAGMENT_SIZE)
    }

    pub fn with_fragment_size(fragment_size: usize) -> Self {
        Self {
            fragment_size: fragment_size.max(1),
            state: RwLock::new(MemoryState::default()),
            next_bundle: AtomicU64::new(1),
        }
    }

    fn fragment(&self, data: &Bytes) -> Vec<Bytes> {
        let mut fragments = Vec::with_capacity(data.len() / self.fragment_size + 1);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.fragment_size).min(data.len());
            fragments.push(data.slice(offset..end));
            offset = end;
        }
        fragments
    }

    fn join(fragments: &[Bytes]) -> Bytes {
        match fragments {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => {
                let mut buf = BytesMut::with_capacity(many.iter().map(Bytes::len).sum());
                for fragment in many {
                    buf.extend_from_slice(fragment);
                }
                buf.freeze()
            }
        }
    }
}

impl Default for MemoryDataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileDataStore for MemoryDataStore {
    async fn file_data_details(&self, key: FileDataKey) -> Result<Option<FileDataDetails>> {
        let state = self.state.read().await;
        Ok(state.streams.get(&key).map(|stream| FileDataDetails {
            key,
            length: stream.length,
            fragments: stream.fragments.len(),
            bundle_id: stream.bundle_id,
            modified: stream.modified,
        }))
    }

    fn max_fragment_size(&self) -> usize {
        self.fragment_size
    }

    async fn load_file_data(&self, key: FileDataKey) -> Result<Bytes> {
        let state = self.state.read().await;
        let stream = state
            .streams
            .get(&key)
            .ok_or_else(|| Error::FileNotFound(key.to_string()))?;
        Ok(Self::join(&stream.fragments))
    }

    async fn save_file_data(&self, key: FileDataKey, data: Bytes) -> Result<usize> {
        let fragments = self.fragment(&data);
        let count = fragments.len();
        debug!("Saving {} bytes for {} in {} fragment(s)", data.len(), key, count);

        let mut state = self.state.write().await;
        state.streams.insert(
            key,
            StoredStream {
                fragments,
                length: data.len() as u64,
                bundle_id: None,
                modified: Utc::now(),
            },
        );
        Ok(count)
    }

    async fn delete_file_data(&self, key: FileDataKey) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .streams
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| Error::FileNotFound(key.to_string()))
    }

    async fn export_bundle(&self, keys: &[FileDataKey]) -> Result<u64> {
        if keys.is_empty() {
            return Err(Error::InvalidParameter("Empty bundle".into()));
        }

        let mut state = self.state.write().await;
        let mut bundle = BTreeMap::new();
        for key in keys {
            let stream = state
                .streams
                .get(key)
                .ok_or_else(|| Error::FileNotFound(key.to_string()))?;
            bundle.insert(*key, Self::join(&stream.fragments));
        }

        let bundle_id = self.next_bundle.fetch_add(1, Ordering::Relaxed);
        for key in keys {
            if let Some(stream) = state.streams.get_mut(key) {
                stream.bundle_id = Some(bundle_id);
            }
        }
        debug!("Exported {} stream(s) to bundle {}", bundle.len(), bundle_id);
        state.bundles.insert(bundle_id, bundle);
        Ok(bundle_id)
    }

    async fn import_bundle(&self, bundle_id: u64) -> Result<Vec<FileDataKey>> {
        let mut state = self.state.write().await;
        let bundle = state
            .bundles
            .get(&bundle_id)
            .cloned()
            .ok_or_else(|| Error::FileNotFound(format!("bundle {}", bundle_id)))?;

        let now = Utc::now();
        let mut restored = Vec::with_capacity(bundle.len());
        for (key, data) in bundle {
            let fragments = self.fragment(&data);
            state.streams.insert(
                key,
                StoredStream {
                    fragments,
                    length: data.len() as u64,
                    bundle_id: Some(bundle_id),
                    modified: now,
                },
            );
            restored.push(key);
        }
        Ok(restored)
    }

    async fn delete_bundle(&self, bundle_id: u64) -> Result<()> {
        let mut state = self.state.write().await;
        if state.bundles.remove(&bundle_id).is_none() {
            return Err(Error::FileNotFound(format!("bundle {}", bundle_id)));
        }
        for stream in state.streams.values_mut() {
            if stream.bundle_id == Some(bundle_id) {
                stream.bundle_id = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_splits_into_fragments() {
        let store = MemoryDataStore::with_fragment_size(4);
        let key = FileDataKey::main(1);

        let count = store
            .save_file_data(key, Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        assert_eq!(count, 3);

        let details = store.file_data_details(key).await.unwrap().unwrap();
        assert_eq!(details.length, 10);
        assert_eq!(details.fragments, 3);
        assert_eq!(details.bundle_id, None);

        assert_eq!(store.load_file_data(key).await.unwrap().as_ref(), b"0123456789");
    }

    #[tokio::test]
    async fn test_streams_are_keyed_separately() {
        let store = MemoryDataStore::new();
        store
            .save_file_data(FileDataKey::new(7, 0), Bytes::from_static(b"main"))
            .await
            .unwrap();
        store
            .save_file_data(FileDataKey::new(7, 1), Bytes::from_static(b"alt"))
            .await
            .unwrap();

        assert_eq!(
            store.load_file_data(FileDataKey::new(7, 1)).await.unwrap().as_ref(),
            b"alt"
        );
        store.delete_file_data(FileDataKey::new(7, 0)).await.unwrap();
        assert!(matches!(
            store.load_file_data(FileDataKey::new(7, 0)).await,
            Err(Error::FileNotFound(_))
        ));
        assert!(store.delete_file_data(FileDataKey::new(7, 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_data() {
        let store = MemoryDataStore::new();
        let key = FileDataKey::main(3);
        assert_eq!(store.save_file_data(key, Bytes::new()).await.unwrap(), 0);
        assert!(store.load_file_data(key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bundle_export_import() {
        let store = MemoryDataStore::with_fragment_size(2);
        let a = FileDataKey::main(1);
        let b = FileDataKey::main(2);
        store.save_file_data(a, Bytes::from_static(b"alpha")).await.unwrap();
        store.save_file_data(b, Bytes::from_static(b"beta")).await.unwrap();

        let bundle = store.export_bundle(&[a, b]).await.unwrap();
        assert_eq!(
            store.file_data_details(a).await.unwrap().unwrap().bundle_id,
            Some(bundle)
        );

        store.delete_file_data(a).await.unwrap();
        store.delete_file_data(b).await.unwrap();

        let restored = store.import_bundle(bundle).await.unwrap();
        assert_eq!(restored, vec![a, b]);
        assert_eq!(store.load_file_data(a).await.unwrap().as_ref(), b"alpha");
        assert_eq!(store.file_data_details(b).await.unwrap().unwrap().fragments, 2);

        store.delete_bundle(bundle).await.unwrap();
        assert!(store.import_bundle(bundle).await.is_err());
        assert_eq!(store.file_data_details(a).await.unwrap().unwrap().bundle_id, None);
    }

    #[tokio::test]
    async fn test_bundle_of_missing_stream() {
        let store = MemoryDataStore::new();
        assert!(store.export_bundle(&[]).await.is_err());
        assert!(matches!(
            store.export_bundle(&[FileDataKey::main(9)]).await,
            Err(Error::FileNotFound(_))
        ));
    }
}
