use crate::error::*;
use crate::utils::write_counted;

use s3s_post::commit::{CommitHandle, CommittedObject, ObjectCommit, ObjectMeta, md5_e_tag};
use s3s_post::{S3Result, s3_error};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use md5::{Digest, Md5};
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;
use uuid::Uuid;

const INTERNAL_DIR: &str = ".s3s-post-fs";

/// Stores POST uploads as files.
pub struct FileSystem {
    root: PathBuf,
    uploads: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<Upload>>>>,
}

struct Upload {
    file: BufWriter<fs::File>,
    tmp_path: PathBuf,
    attrs_tmp_path: PathBuf,
    object_path: PathBuf,
    meta: ObjectMeta,
    md5: Md5,
    size: u64,
}

/// What is recorded next to a committed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAttributes {
    pub size: u64,
    pub e_tag: String,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub filename: String,
}

impl fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystem").field("root", &self.root).finish_non_exhaustive()
    }
}

impl FileSystem {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().absolutize()?.into_owned();
        Ok(Self {
            root,
            uploads: Mutex::default(),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a committed object.
    pub fn object_path(&self, bucket: &str, key: &str) -> S3Result<PathBuf> {
        check_segment(bucket)?;
        let mut path = self.root.join(bucket);
        for segment in key.split('/') {
            check_segment(segment)?;
            path.push(segment);
        }
        Ok(path)
    }

    fn attributes_path(&self, bucket: &str, key: &str) -> S3Result<PathBuf> {
        check_segment(bucket)?;
        let mut path = self.root.join(INTERNAL_DIR).join("attributes").join(bucket);
        for segment in key.split('/') {
            check_segment(segment)?;
            path.push(segment);
        }
        let mut path = path.into_os_string();
        path.push(".json");
        Ok(PathBuf::from(path))
    }

    fn upload_dir(&self) -> PathBuf {
        self.root.join(INTERNAL_DIR).join("uploads")
    }

    /// Reads the attributes written when the object was committed.
    pub async fn load_attributes(&self, bucket: &str, key: &str) -> S3Result<Option<ObjectAttributes>> {
        let path = self.attributes_path(bucket, key)?;
        let bytes = match fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::from(e).into()),
        };
        let attrs = try_!(serde_json::from_slice(&bytes));
        Ok(Some(attrs))
    }

    /// Uploads begun but neither finalized nor aborted.
    #[must_use]
    pub fn pending_uploads(&self) -> usize {
        self.lock_uploads().len()
    }

    fn lock_uploads(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<tokio::sync::Mutex<Upload>>>> {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_upload(&self, handle: &CommitHandle) -> S3Result<Arc<tokio::sync::Mutex<Upload>>> {
        let upload = self.lock_uploads().get(&handle.upload_id()).cloned();
        upload.ok_or_else(|| s3_error!(BackendFailure, "unknown upload: {}", handle.upload_id()))
    }

    async fn commit_upload(&self, handle: &CommitHandle, upload: &mut Upload) -> Result<CommittedObject> {
        upload.file.flush().await?;
        upload.file.get_mut().sync_all().await?;

        let e_tag = md5_e_tag(std::mem::take(&mut upload.md5).finalize());

        let attrs = ObjectAttributes {
            size: upload.size,
            e_tag: e_tag.clone(),
            content_type: upload.meta.content_type.clone(),
            metadata: upload.meta.metadata.clone(),
            filename: upload.meta.filename.clone(),
        };
        let attrs_path = self
            .attributes_path(handle.bucket(), handle.key())
            .map_err(|e| Error::new(Box::new(e)))?;
        fs::write(&upload.attrs_tmp_path, serde_json::to_vec(&attrs)?).await?;

        // The object goes first. Attributes never describe a missing object.
        if let Some(dir) = upload.object_path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::rename(&upload.tmp_path, &upload.object_path).await?;

        if let Some(dir) = attrs_path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::rename(&upload.attrs_tmp_path, &attrs_path).await?;

        Ok(CommittedObject {
            size: upload.size,
            e_tag,
        })
    }
}

/// Rejects path segments that would escape or alias a directory.
fn check_segment(segment: &str) -> S3Result<()> {
    let invalid = matches!(segment, "" | "." | ".." | INTERNAL_DIR) || segment.contains(['\\', '\0']);
    if invalid {
        return Err(s3_error!(MalformedRequest, "object name is not supported by file system storage: {segment:?}"));
    }
    Ok(())
}

#[async_trait::async_trait]
impl ObjectCommit for FileSystem {
    #[tracing::instrument(level = "debug", skip(self, meta))]
    async fn begin(&self, bucket: &str, key: &str, meta: ObjectMeta) -> S3Result<CommitHandle> {
        let object_path = self.object_path(bucket, key)?;
        let handle = CommitHandle::new(bucket, key);

        let upload_dir = self.upload_dir();
        try_!(fs::create_dir_all(&upload_dir).await);

        let tmp_path = upload_dir.join(handle.upload_id().to_string());
        let attrs_tmp_path = upload_dir.join(format!("{}.json", handle.upload_id()));
        let file = try_!(fs::File::create(&tmp_path).await);
        debug!(path = %tmp_path.display(), "spooling upload");

        let upload = Upload {
            file: BufWriter::new(file),
            tmp_path,
            attrs_tmp_path,
            object_path,
            meta,
            md5: Md5::new(),
            size: 0,
        };
        self.lock_uploads()
            .insert(handle.upload_id(), Arc::new(tokio::sync::Mutex::new(upload)));

        Ok(handle)
    }

    async fn write(&self, handle: &CommitHandle, chunk: Bytes) -> S3Result<()> {
        let upload = self.get_upload(handle)?;
        let mut upload = upload.lock().await;
        let n = write_counted(&mut upload.file, &chunk).await?;
        upload.md5.update(&chunk);
        upload.size += n;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn finalize(&self, handle: &CommitHandle) -> S3Result<CommittedObject> {
        let upload = self.get_upload(handle)?;
        let committed = {
            let mut upload = upload.lock().await;
            self.commit_upload(handle, &mut upload).await?
        };
        self.lock_uploads().remove(&handle.upload_id());
        debug!(size = committed.size, e_tag = %committed.e_tag, "object committed");
        Ok(committed)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn abort(&self, handle: &CommitHandle) -> S3Result<()> {
        let upload = self.lock_uploads().remove(&handle.upload_id());
        let Some(upload) = upload else {
            return Err(s3_error!(BackendFailure, "unknown upload: {}", handle.upload_id()));
        };

        let Some(upload) = Arc::into_inner(upload) else {
            return Err(Error::from_string("upload is still being written").into());
        };
        let Upload {
            file,
            tmp_path,
            attrs_tmp_path,
            ..
        } = upload.into_inner();
        drop(file);

        try_!(remove_if_exists(&tmp_path).await);
        try_!(remove_if_exists(&attrs_tmp_path).await);
        debug!(path = %tmp_path.display(), "upload discarded");
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        ret => ret,
    }
}
