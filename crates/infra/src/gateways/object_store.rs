//! Object storage for payment proofs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ticketflow_tickets::mime_subtype;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error("upload rejected: {0}")]
    Rejected(String),
}

/// Location of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
    pub url: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `{name}.{mime subtype}` in `bucket`.
    ///
    /// Uploading the same name twice overwrites the object.
    async fn upload(
        &self,
        bucket: &str,
        bytes: &[u8],
        name: &str,
        mime_type: &str,
    ) -> Result<ObjectRef, ObjectStoreError>;
}

pub fn object_key(name: &str, mime_type: &str) -> String {
    format!("{name}.{}", mime_subtype(mime_type))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<(String, String), StoredObject>>,
    available: AtomicBool,
    uploads: AtomicU64,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            uploads: AtomicU64::new(0),
        }
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of successful uploads, overwrites included.
    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn upload(
        &self,
        bucket: &str,
        bytes: &[u8],
        name: &str,
        mime_type: &str,
    ) -> Result<ObjectRef, ObjectStoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Unavailable("connection refused".into()));
        }
        if bucket.is_empty() {
            return Err(ObjectStoreError::Rejected("bucket name is empty".into()));
        }

        let key = object_key(name, mime_type);
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (bucket.to_string(), key.clone()),
                StoredObject {
                    bytes: bytes.to_vec(),
                    mime_type: mime_type.to_string(),
                },
            );
        self.uploads.fetch_add(1, Ordering::SeqCst);

        Ok(ObjectRef {
            url: format!("memory://{bucket}/{key}"),
            bucket: bucket.to_string(),
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_uses_mime_subtype_and_overwrites() {
        let store = InMemoryObjectStore::new();
        let first = store
            .upload("bucket.tedx", b"v1", "payment_proof_1", "application/pdf")
            .await
            .unwrap();
        assert_eq!(first.key, "payment_proof_1.pdf");
        assert_eq!(first.url, "memory://bucket.tedx/payment_proof_1.pdf");

        let second = store
            .upload("bucket.tedx", b"v2", "payment_proof_1", "application/pdf")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.object_count(), 1);
        assert_eq!(store.object("bucket.tedx", &first.key).unwrap().bytes, b"v2");
    }

    #[tokio::test]
    async fn outage_is_reported_as_unavailable() {
        let store = InMemoryObjectStore::new();
        store.set_available(false);
        assert!(matches!(
            store.upload("b", b"x", "n", "image/png").await,
            Err(ObjectStoreError::Unavailable(_))
        ));
    }
}
