//! POST upload service and builder
//!
//! [`PostService`] is a hyper service answering `POST /{bucket}` form uploads.
//!
//! # Example
//!
//! ```
//! use s3s_post::auth::StaticCredentials;
//! use s3s_post::commit::MemoryCommit;
//! use s3s_post::service::PostServiceBuilder;
//!
//! let auth = StaticCredentials::from_single("AKEXAMPLE", "SKEXAMPLE");
//! let service = PostServiceBuilder::new(auth, MemoryCommit::new()).build();
//! # let _ = service;
//! ```

use crate::auth::CredentialProvider;
use crate::commit::ObjectCommit;
use crate::config::{PostConfigProvider, StaticConfigProvider};
use crate::error::{S3ErrorCode, S3Result, StdError};
use crate::ingest::IngestController;
use crate::response::{self, HttpResponse};

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{StreamExt, TryStreamExt};
use http::Method;
use http::header::CONTENT_TYPE;
use http_body_util::BodyStream;
use tracing::{debug, error};

/// Returned only when a response cannot be produced at all.
#[derive(Debug)]
pub struct HttpError(StdError);

impl HttpError {
    #[must_use]
    pub fn new(err: StdError) -> Self {
        Self(err)
    }

    #[must_use]
    pub fn into_inner(self) -> StdError {
        self.0
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HttpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

/// Builder for [`PostService`].
pub struct PostServiceBuilder {
    auth: Arc<dyn CredentialProvider>,
    commit: Arc<dyn ObjectCommit>,
    config: Option<Arc<dyn PostConfigProvider>>,
}

impl PostServiceBuilder {
    #[must_use]
    pub fn new(auth: impl CredentialProvider, commit: impl ObjectCommit) -> Self {
        Self {
            auth: Arc::new(auth),
            commit: Arc::new(commit),
            config: None,
        }
    }

    /// Shares an existing backend, e.g. to inspect it afterwards.
    #[must_use]
    pub fn with_shared_commit(auth: impl CredentialProvider, commit: Arc<dyn ObjectCommit>) -> Self {
        Self {
            auth: Arc::new(auth),
            commit,
            config: None,
        }
    }

    /// Defaults to [`StaticConfigProvider::default()`].
    pub fn set_config(&mut self, config: Arc<dyn PostConfigProvider>) {
        self.config = Some(config);
    }

    #[must_use]
    pub fn build(self) -> PostService {
        let config = self.config.unwrap_or_else(|| Arc::new(StaticConfigProvider::default()));
        PostService {
            inner: Arc::new(Inner {
                controller: IngestController::new(config, self.auth, self.commit),
            }),
        }
    }
}

/// Answers presigned POST uploads.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct PostService {
    inner: Arc<Inner>,
}

struct Inner {
    controller: IngestController,
}

impl fmt::Debug for PostService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostService").finish_non_exhaustive()
    }
}

impl PostService {
    /// Handles one request. Rejections become XML error responses.
    ///
    /// # Errors
    /// Returns an [`HttpError`] only if no response can be built.
    #[tracing::instrument(level = "debug", skip_all, fields(method = %req.method(), uri = %req.uri()))]
    pub async fn call<B>(&self, req: http::Request<B>) -> Result<HttpResponse, HttpError>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let t0 = Instant::now();

        let result = match self.handle(req).await {
            Ok(res) => res,
            Err(err) => {
                debug!(?err, "post upload failed");
                response::error_response(&err)
            }
        };

        let duration = t0.elapsed();
        if result.status().is_server_error() {
            error!(?duration, status = %result.status());
        } else {
            debug!(?duration, status = %result.status());
        }

        Ok(result)
    }

    async fn call_owned<B>(self, req: http::Request<B>) -> Result<HttpResponse, HttpError>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        self.call(req).await
    }

    async fn handle<B>(&self, req: http::Request<B>) -> S3Result<HttpResponse>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        if req.method() != Method::POST {
            return Err(s3_error!(MalformedRequest, "only POST uploads are supported").with_code(S3ErrorCode::MethodNotAllowed));
        }

        let bucket = parse_bucket(req.uri().path())?;

        let content_type = match req.headers().get(CONTENT_TYPE) {
            Some(v) => v.to_str().map_err(|e| s3_error!(e, MalformedRequest, "invalid content-type"))?.to_owned(),
            None => return Err(s3_error!(MalformedRequest, "missing content-type")),
        };

        let body = BodyStream::new(req.into_body())
            .try_filter_map(|frame| futures::future::ready(Ok(frame.into_data().ok())))
            .map_err(|e| -> StdError { Box::new(e) })
            .boxed();

        let out = self.inner.controller.ingest(&bucket, &content_type, body).await?;
        response::post_object_response(&out)
    }
}

/// Extracts the bucket from `/{bucket}` or `/{bucket}/`.
fn parse_bucket(path: &str) -> S3Result<String> {
    let decoded = urlencoding::decode(path).map_err(|e| s3_error!(e, MalformedRequest, "invalid request path"))?;

    let bucket = decoded.strip_prefix('/').unwrap_or(&decoded);
    let bucket = bucket.strip_suffix('/').unwrap_or(bucket);

    if bucket.is_empty() || bucket.contains('/') {
        return Err(s3_error!(MalformedRequest, "POST uploads must target a bucket"));
    }
    if !is_valid_bucket_name(bucket) {
        return Err(s3_error!(MalformedRequest, "The specified bucket is not valid.").with_code(S3ErrorCode::InvalidBucketName));
    }
    Ok(bucket.to_owned())
}

/// See <https://docs.aws.amazon.com/AmazonS3/latest/userguide/bucketnamingrules.html>
fn is_valid_bucket_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if !(3..=63).contains(&bytes.len()) {
        return false;
    }
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return false;
    }
    if !bytes.iter().all(|&b| edge_ok(b) || b == b'.' || b == b'-') {
        return false;
    }
    !name.contains("..")
}

impl<B> hyper::service::Service<http::Request<B>> for PostService
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = HttpResponse;

    type Error = HttpError;

    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, req: http::Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(service.call_owned(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::auth::StaticCredentials;
    use crate::commit::MemoryCommit;

    use http::StatusCode;
    use http_body_util::{BodyExt, Full};

    fn service() -> PostService {
        PostServiceBuilder::new(StaticCredentials::from_single("AK", "SK"), MemoryCommit::new()).build()
    }

    async fn body_string(res: HttpResponse) -> String {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn bucket_names() {
        assert_eq!(parse_bucket("/photos").unwrap(), "photos");
        assert_eq!(parse_bucket("/my.bucket-01/").unwrap(), "my.bucket-01");

        for bad in ["/", "", "/ab", "/Photos", "/-photos", "/photos-", "/a..b", "/photos/key"] {
            assert!(parse_bucket(bad).is_err(), "{bad}");
        }
        assert_eq!(parse_bucket("/UPPER").unwrap_err().code(), S3ErrorCode::InvalidBucketName);
    }

    #[tokio::test]
    async fn method_not_allowed() {
        let req = http::Request::get("/photos").body(Full::new(Bytes::new())).unwrap();
        let res = service().call(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(body_string(res).await.contains("<Code>MethodNotAllowed</Code>"));
    }

    #[tokio::test]
    async fn not_a_form() {
        let req = http::Request::post("/photos")
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Full::new(Bytes::from_static(b"raw")))
            .unwrap();
        let res = service().call(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(res).await.contains("<Code>MalformedPOSTRequest</Code>"));
    }

    #[tokio::test]
    async fn unsigned_form() {
        let body = "--x\r\nContent-Disposition: form-data; name=\"key\"\r\n\r\nk\r\n\
                    --x\r\nContent-Disposition: form-data; name=\"file\"; filename=\"f\"\r\n\r\ndata\r\n--x--\r\n";
        let req = http::Request::post("/photos")
            .header(CONTENT_TYPE, "multipart/form-data; boundary=x")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap();
        let res = service().call(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(res).await.contains("<Code>MalformedPOSTRequest</Code>"));
    }
}
