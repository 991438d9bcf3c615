//! Object commit adapters
//!
//! The engine never stores bytes itself. An accepted upload is streamed into
//! an [`ObjectCommit`] implementation, which makes it visible only on
//! [`finalize`](ObjectCommit::finalize).

use crate::error::S3Result;
use crate::utils::hex;

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use md5::{Digest, Md5};
use uuid::Uuid;

/// Attributes forwarded to the backend with a new object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    /// From the `content-type` form field, else from the file part header.
    pub content_type: Option<String>,
    /// `x-amz-meta-*` fields, keyed without the prefix.
    pub metadata: BTreeMap<String, String>,
    /// The filename of the file part.
    pub filename: String,
}

/// Identifies one in-flight upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitHandle {
    bucket: String,
    key: String,
    upload_id: Uuid,
}

impl CommitHandle {
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            upload_id: Uuid::new_v4(),
        }
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn upload_id(&self) -> Uuid {
        self.upload_id
    }
}

/// A finalized object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedObject {
    pub size: u64,
    /// Quoted entity tag, e.g. `"9e107d9d372bb6826bd81d3542a419d6"`.
    pub e_tag: String,
}

/// Storage backend of POST uploads.
///
/// For every handle returned by `begin`, the engine calls `finalize` once or
/// `abort` once. A failed `finalize` is followed by `abort`, so it must leave
/// the upload abortable. Writes arrive in order and only between `begin` and
/// that final call.
#[async_trait::async_trait]
pub trait ObjectCommit: Send + Sync + 'static {
    async fn begin(&self, bucket: &str, key: &str, meta: ObjectMeta) -> S3Result<CommitHandle>;

    async fn write(&self, handle: &CommitHandle, chunk: Bytes) -> S3Result<()>;

    async fn finalize(&self, handle: &CommitHandle) -> S3Result<CommittedObject>;

    /// Discards everything written under `handle`.
    async fn abort(&self, handle: &CommitHandle) -> S3Result<()>;
}

/// Quotes an MD5 digest as an entity tag.
#[must_use]
pub fn md5_e_tag(digest: impl AsRef<[u8]>) -> String {
    format!("\"{}\"", hex(digest))
}

/// An object held by [`MemoryCommit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub meta: ObjectMeta,
    pub e_tag: String,
}

struct PendingObject {
    handle: CommitHandle,
    meta: ObjectMeta,
    data: Vec<u8>,
    md5: Md5,
}

/// An in-memory backend.
///
/// Besides storing objects it counts finalize and abort calls, and can be
/// told to fail writes.
#[derive(Default)]
pub struct MemoryCommit {
    pending: Mutex<HashMap<Uuid, PendingObject>>,
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    finalized: AtomicUsize,
    aborted: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryCommit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `write` fail with `BackendFailure`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        let objects = self.objects.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        objects.get(&(bucket.to_owned(), key.to_owned())).cloned()
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    /// Uploads begun but neither finalized nor aborted.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn finalize_count(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn abort_count(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    fn take_pending(&self, handle: &CommitHandle) -> S3Result<PendingObject> {
        let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match pending.remove(&handle.upload_id) {
            Some(p) if p.handle == *handle => Ok(p),
            _ => Err(s3_error!(BackendFailure, "unknown upload: {}", handle.upload_id)),
        }
    }
}

#[async_trait::async_trait]
impl ObjectCommit for MemoryCommit {
    async fn begin(&self, bucket: &str, key: &str, meta: ObjectMeta) -> S3Result<CommitHandle> {
        let handle = CommitHandle::new(bucket, key);
        let p = PendingObject {
            handle: handle.clone(),
            meta,
            data: Vec::new(),
            md5: Md5::new(),
        };
        let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        pending.insert(handle.upload_id, p);
        Ok(handle)
    }

    async fn write(&self, handle: &CommitHandle, chunk: Bytes) -> S3Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(s3_error!(BackendFailure, "write failed"));
        }
        let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(p) = pending.get_mut(&handle.upload_id) else {
            return Err(s3_error!(BackendFailure, "unknown upload: {}", handle.upload_id));
        };
        p.md5.update(&chunk);
        p.data.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finalize(&self, handle: &CommitHandle) -> S3Result<CommittedObject> {
        let p = self.take_pending(handle)?;
        let e_tag = md5_e_tag(p.md5.finalize());
        let size = p.data.len() as u64;

        let stored = StoredObject {
            data: Bytes::from(p.data),
            meta: p.meta,
            e_tag: e_tag.clone(),
        };
        {
            let mut objects = self.objects.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            objects.insert((handle.bucket.clone(), handle.key.clone()), stored);
        }
        self.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(CommittedObject { size, e_tag })
    }

    async fn abort(&self, handle: &CommitHandle) -> S3Result<()> {
        self.take_pending(handle)?;
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
