//! HTTP responses of POST uploads
//!
//! See <https://docs.aws.amazon.com/AmazonS3/latest/API/RESTObjectPOST.html>

use crate::error::{S3Error, S3Result};
use crate::ingest::PostObjectOutput;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderValue, LOCATION};
use http::{Response, StatusCode};
use http_body_util::Full;
use serde::Serialize;
use tracing::warn;

pub type HttpResponse = Response<Full<Bytes>>;

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

const APPLICATION_XML: &str = "application/xml";

#[derive(Debug, Serialize)]
#[serde(rename = "Error")]
struct ErrorBody<'a> {
    #[serde(rename = "Code")]
    code: &'a str,
    #[serde(rename = "Message", skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

/// The body of `success_action_status=201`.
#[derive(Debug, Serialize)]
#[serde(rename = "PostResponse")]
struct PostResponse<'a> {
    #[serde(rename = "Location")]
    location: &'a str,
    #[serde(rename = "Bucket")]
    bucket: &'a str,
    #[serde(rename = "Key")]
    key: &'a str,
    #[serde(rename = "ETag")]
    etag: &'a str,
}

fn to_xml<T: Serialize>(value: &T) -> S3Result<Bytes> {
    let body = quick_xml::se::to_string(value).map_err(|e| s3_error!(e, BackendFailure, "failed to serialize xml"))?;
    Ok(Bytes::from(format!("{XML_DECLARATION}{body}")))
}

fn header_value(value: impl AsRef<str>) -> S3Result<HeaderValue> {
    HeaderValue::try_from(value.as_ref()).map_err(|e| s3_error!(e, BackendFailure, "invalid header value"))
}

fn xml_response(status: StatusCode, body: Bytes) -> HttpResponse {
    let content_length = body.len();
    let mut res = Response::new(Full::new(body));
    *res.status_mut() = status;
    let headers = res.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_XML));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
    res
}

fn empty_response(status: StatusCode) -> HttpResponse {
    let mut res = Response::new(Full::new(Bytes::new()));
    *res.status_mut() = status;
    res
}

/// Serializes a rejection as an S3 XML error.
#[must_use]
pub fn error_response(err: &S3Error) -> HttpResponse {
    let body = ErrorBody {
        code: err.code().as_str(),
        message: err.message(),
    };
    match to_xml(&body) {
        Ok(xml) => xml_response(err.status_code(), xml),
        Err(e) => {
            warn!(?e, "failed to serialize error response");
            empty_response(err.status_code())
        }
    }
}

/// `/{bucket}/{key}` with every key segment percent-encoded.
fn object_location(bucket: &str, key: &str) -> String {
    let mut location = format!("/{bucket}");
    for segment in key.split('/') {
        location.push('/');
        location.push_str(&urlencoding::encode(segment));
    }
    location
}

/// A redirect target is used only if it is an absolute http(s) URL.
fn redirect_url(target: &str, out: &PostObjectOutput) -> Option<url::Url> {
    let mut url = url::Url::parse(target).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.query_pairs_mut()
        .append_pair("bucket", &out.bucket)
        .append_pair("key", &out.key)
        .append_pair("etag", &out.e_tag);
    Some(url)
}

/// Builds the success response selected by `success_action_redirect` and
/// `success_action_status`.
///
/// # Errors
/// Returns an error if a header value cannot be represented.
pub fn post_object_response(out: &PostObjectOutput) -> S3Result<HttpResponse> {
    let location = object_location(&out.bucket, &out.key);

    if let Some(url) = out.success_action_redirect.as_deref().and_then(|t| redirect_url(t, out)) {
        let mut res = empty_response(StatusCode::SEE_OTHER);
        res.headers_mut().insert(LOCATION, header_value(url.as_str())?);
        res.headers_mut().insert(ETAG, header_value(&out.e_tag)?);
        return Ok(res);
    }

    let mut res = match out.success_action_status.as_deref() {
        Some("200") => empty_response(StatusCode::OK),
        Some("201") => {
            let body = PostResponse {
                location: &location,
                bucket: &out.bucket,
                key: &out.key,
                etag: &out.e_tag,
            };
            xml_response(StatusCode::CREATED, to_xml(&body)?)
        }
        _ => empty_response(StatusCode::NO_CONTENT),
    };

    res.headers_mut().insert(ETAG, header_value(&out.e_tag)?);
    res.headers_mut().insert(LOCATION, header_value(&location)?);
    Ok(res)
}
