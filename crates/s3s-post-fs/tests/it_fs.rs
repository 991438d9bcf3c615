use s3s_post::auth::StaticCredentials;
use s3s_post::commit::{ObjectCommit, ObjectMeta};
use s3s_post::post_policy::PostPolicy;
use s3s_post::service::{PostService, PostServiceBuilder};
use s3s_post::{ErrorKind, HttpResponse};
use s3s_post_fs::FileSystem;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use anyhow::Result;
use bytes::Bytes;
use hmac::{Hmac, KeyInit, Mac};
use http::StatusCode;
use http::header::{CONTENT_TYPE, ETAG};
use http_body_util::{BodyExt, Full};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

const FS_ROOT: &str = concat!(env!("CARGO_TARGET_TMPDIR"), "/s3s-post-fs-tests");

const ACCESS_KEY: &str = "AKEXAMPLES3S";
const SECRET_KEY: &str = "SKEXAMPLES3S";
const REGION: &str = "us-west-2";
const BUCKET: &str = "uploads";
const BOUNDARY: &str = "----s3s-post-fs-boundary";

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut m = <Hmac<sha2::Sha256> as KeyInit>::new_from_slice(key).unwrap();
    m.update(data);
    m.finalize().into_bytes().into()
}

fn signed_fields(policy: &PostPolicy) -> Vec<(String, String)> {
    let amz_date = OffsetDateTime::now_utc()
        .format(time::macros::format_description!("[year][month][day]T[hour][minute][second]Z"))
        .unwrap();
    let date = &amz_date[..8];
    let encoded = policy.to_base64().unwrap();

    let k_date = hmac_sha256(format!("AWS4{SECRET_KEY}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, REGION.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex_simd::encode_to_string(hmac_sha256(&k_signing, encoded.as_bytes()), hex_simd::AsciiCase::Lower);

    vec![
        ("policy".into(), encoded),
        ("x-amz-algorithm".into(), "AWS4-HMAC-SHA256".into()),
        ("x-amz-credential".into(), format!("{ACCESS_KEY}/{date}/{REGION}/s3/aws4_request")),
        ("x-amz-date".into(), amz_date.clone()),
        ("x-amz-signature".into(), signature),
    ]
}

fn encode_form(fields: &[(String, String)], filename: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes());
    }
    body.extend_from_slice(
        format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// Each test gets its own root.
fn setup() -> Result<(PostService, Arc<FileSystem>, PathBuf)> {
    setup_tracing();

    let root = Path::new(FS_ROOT).join(Uuid::new_v4().to_string());
    std::fs::create_dir_all(&root)?;

    let fs = Arc::new(FileSystem::new(&root).map_err(|e| anyhow::anyhow!(e.into_inner()))?);
    let commit: Arc<dyn ObjectCommit> = fs.clone();
    let service = PostServiceBuilder::with_shared_commit(StaticCredentials::from_single(ACCESS_KEY, SECRET_KEY), commit).build();

    Ok((service, fs, root))
}

async fn post(service: &PostService, body: Vec<u8>) -> Result<HttpResponse> {
    let req = http::Request::post(format!("/{BUCKET}"))
        .header(CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Full::new(Bytes::from(body)))?;
    Ok(service.call(req).await?)
}

async fn body_string(res: HttpResponse) -> Result<String> {
    let bytes = res.into_body().collect().await?.to_bytes();
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn spooled_files(root: &Path) -> Result<usize> {
    let dir = root.join(".s3s-post-fs").join("uploads");
    if !dir.exists() {
        return Ok(0);
    }
    Ok(std::fs::read_dir(dir)?.count())
}

#[tokio::test]
async fn upload_is_stored() -> Result<()> {
    let (service, fs, root) = setup()?;

    let policy = PostPolicy::new(OffsetDateTime::now_utc() + Duration::hours(1))
        .with_eq("bucket", BUCKET)
        .with_starts_with("$key", "docs/")
        .with_starts_with("$Content-Type", "text/")
        .with_content_length_range(1, 1024);

    let mut fields = vec![
        ("key".to_owned(), "docs/${filename}".to_owned()),
        ("bucket".to_owned(), BUCKET.to_owned()),
        ("content-type".to_owned(), "text/markdown".to_owned()),
        ("x-amz-meta-owner".to_owned(), "alice".to_owned()),
    ];
    fields.extend(signed_fields(&policy));

    let res = post(&service, encode_form(&fields, "notes.md", b"# notes\n")).await?;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    let e_tag = res.headers()[ETAG].to_str()?.to_owned();

    let path = fs.object_path(BUCKET, "docs/notes.md")?;
    assert!(path.starts_with(&root));
    assert_eq!(std::fs::read(&path)?, b"# notes\n");

    let attrs = fs.load_attributes(BUCKET, "docs/notes.md").await?.expect("attributes should be written");
    assert_eq!(attrs.size, 8);
    assert_eq!(attrs.e_tag, e_tag);
    assert_eq!(attrs.content_type.as_deref(), Some("text/markdown"));
    assert_eq!(attrs.metadata.get("owner").map(String::as_str), Some("alice"));
    assert_eq!(attrs.filename, "notes.md");

    assert_eq!(fs.pending_uploads(), 0);
    assert_eq!(spooled_files(&root)?, 0);
    Ok(())
}

#[tokio::test]
async fn rejected_upload_leaves_nothing() -> Result<()> {
    let (service, fs, root) = setup()?;

    let policy = PostPolicy::new(OffsetDateTime::now_utc() + Duration::hours(1)).with_content_length_range(0, 16);

    let mut fields = vec![("key".to_owned(), "big.bin".to_owned())];
    fields.extend(signed_fields(&policy));

    let res = post(&service, encode_form(&fields, "big.bin", &[0u8; 4096])).await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(res).await?.contains("<Code>EntityTooLarge</Code>"));

    assert!(!fs.object_path(BUCKET, "big.bin")?.exists());
    assert!(fs.load_attributes(BUCKET, "big.bin").await?.is_none());
    assert_eq!(fs.pending_uploads(), 0);
    assert_eq!(spooled_files(&root)?, 0);
    Ok(())
}

#[tokio::test]
async fn escaping_key_is_rejected() -> Result<()> {
    let (service, fs, root) = setup()?;

    let policy = PostPolicy::new(OffsetDateTime::now_utc() + Duration::hours(1)).with_starts_with("$key", "");

    let mut fields = vec![("key".to_owned(), "../escaped.txt".to_owned())];
    fields.extend(signed_fields(&policy));

    let res = post(&service, encode_form(&fields, "escaped.txt", b"data")).await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(res).await?.contains("<Code>MalformedPOSTRequest</Code>"));

    assert!(!root.join("escaped.txt").exists());
    assert_eq!(fs.pending_uploads(), 0);

    let err = fs.object_path(BUCKET, "../escaped.txt").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedRequest);
    Ok(())
}

#[tokio::test]
async fn overwrite_replaces_object() -> Result<()> {
    let (service, fs, _root) = setup()?;

    for content in [&b"first"[..], &b"second version"[..]] {
        let policy = PostPolicy::new(OffsetDateTime::now_utc() + Duration::hours(1)).with_eq("$key", "same.txt");
        let mut fields = vec![("key".to_owned(), "same.txt".to_owned())];
        fields.extend(signed_fields(&policy));

        let res = post(&service, encode_form(&fields, "same.txt", content)).await?;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
    }

    assert_eq!(std::fs::read(fs.object_path(BUCKET, "same.txt")?)?, b"second version");
    let attrs = fs.load_attributes(BUCKET, "same.txt").await?.expect("attributes should be written");
    assert_eq!(attrs.size, 14);
    Ok(())
}

#[tokio::test]
async fn failed_finalize_then_abort_leaves_nothing() -> Result<()> {
    let (_service, fs, root) = setup()?;

    // A directory where the object should land makes the final rename fail.
    let blocker = fs.object_path(BUCKET, "taken")?;
    std::fs::create_dir_all(&blocker)?;
    std::fs::write(blocker.join("inner.txt"), b"occupied")?;

    let meta = ObjectMeta {
        filename: "taken".to_owned(),
        ..ObjectMeta::default()
    };
    let handle = fs.begin(BUCKET, "taken", meta).await?;
    fs.write(&handle, Bytes::from_static(b"payload")).await?;

    let err = fs.finalize(&handle).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendFailure);
    assert_eq!(fs.pending_uploads(), 1);

    fs.abort(&handle).await?;

    assert!(blocker.is_dir());
    assert!(fs.load_attributes(BUCKET, "taken").await?.is_none());
    assert_eq!(fs.pending_uploads(), 0);
    assert_eq!(spooled_files(&root)?, 0);
    Ok(())
}
