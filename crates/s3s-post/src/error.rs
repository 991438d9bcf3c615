use std::borrow::Cow;
use std::fmt;

use hyper::StatusCode;

pub type StdError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type S3Result<T = (), E = S3Error> = std::result::Result<T, E>;

/// Classifies why an upload was refused.
///
/// Every rejection carries exactly one kind. The kind decides the default
/// [`S3ErrorCode`] and therefore the HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Framing, missing required fields, or a request that is not a POST upload.
    MalformedRequest,
    /// A form field, the form total, or the part count exceeded a server limit.
    FormLimitExceeded,
    /// The policy document cannot be decoded or is semantically invalid.
    MalformedPolicy,
    /// The signing credential is outside its validity window.
    SignatureExpired,
    /// The signature does not verify, or the access key is unknown.
    SignatureMismatch,
    /// A policy condition is not met, or the policy itself has expired.
    PolicyConditionFailed,
    /// The file part is larger than the permitted maximum.
    EntityTooLarge,
    /// The file part is smaller than the permitted minimum.
    EntityTooSmall,
    /// The body ended abnormally or the upload deadline elapsed.
    Interrupted,
    /// The storage backend failed.
    BackendFailure,
}

impl ErrorKind {
    #[must_use]
    pub const fn default_code(self) -> S3ErrorCode {
        match self {
            Self::MalformedRequest => S3ErrorCode::MalformedPOSTRequest,
            Self::FormLimitExceeded => S3ErrorCode::MaxPostPreDataLengthExceededError,
            Self::MalformedPolicy => S3ErrorCode::InvalidPolicyDocument,
            Self::SignatureExpired | Self::PolicyConditionFailed => S3ErrorCode::AccessDenied,
            Self::SignatureMismatch => S3ErrorCode::SignatureDoesNotMatch,
            Self::EntityTooLarge => S3ErrorCode::EntityTooLarge,
            Self::EntityTooSmall => S3ErrorCode::EntityTooSmall,
            Self::Interrupted => S3ErrorCode::IncompleteBody,
            Self::BackendFailure => S3ErrorCode::InternalError,
        }
    }
}

/// S3 error codes produced by the POST upload path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum S3ErrorCode {
    AccessDenied,
    EntityTooLarge,
    EntityTooSmall,
    IncompleteBody,
    InternalError,
    InvalidAccessKeyId,
    InvalidArgument,
    InvalidBucketName,
    InvalidPolicyDocument,
    KeyTooLongError,
    MalformedPOSTRequest,
    MaxPostPreDataLengthExceededError,
    MethodNotAllowed,
    RequestTimeout,
    SignatureDoesNotMatch,
}

impl S3ErrorCode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AccessDenied => "AccessDenied",
            Self::EntityTooLarge => "EntityTooLarge",
            Self::EntityTooSmall => "EntityTooSmall",
            Self::IncompleteBody => "IncompleteBody",
            Self::InternalError => "InternalError",
            Self::InvalidAccessKeyId => "InvalidAccessKeyId",
            Self::InvalidArgument => "InvalidArgument",
            Self::InvalidBucketName => "InvalidBucketName",
            Self::InvalidPolicyDocument => "InvalidPolicyDocument",
            Self::KeyTooLongError => "KeyTooLongError",
            Self::MalformedPOSTRequest => "MalformedPOSTRequest",
            Self::MaxPostPreDataLengthExceededError => "MaxPostPreDataLengthExceededError",
            Self::MethodNotAllowed => "MethodNotAllowed",
            Self::RequestTimeout => "RequestTimeout",
            Self::SignatureDoesNotMatch => "SignatureDoesNotMatch",
        }
    }

    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::AccessDenied | Self::InvalidAccessKeyId | Self::SignatureDoesNotMatch => StatusCode::FORBIDDEN,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::EntityTooLarge
            | Self::EntityTooSmall
            | Self::IncompleteBody
            | Self::InvalidArgument
            | Self::InvalidBucketName
            | Self::InvalidPolicyDocument
            | Self::KeyTooLongError
            | Self::MalformedPOSTRequest
            | Self::MaxPostPreDataLengthExceededError
            | Self::RequestTimeout => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for S3ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error returned by every fallible step of a POST upload.
#[derive(Debug)]
pub struct S3Error {
    kind: ErrorKind,
    code: S3ErrorCode,
    message: Option<Cow<'static, str>>,
    source: Option<StdError>,
}

impl S3Error {
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            code: kind.default_code(),
            message: None,
            source: None,
        }
    }

    #[must_use]
    pub fn with_message(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Self {
        let mut this = Self::new(kind);
        this.set_message(msg);
        this
    }

    #[must_use]
    pub fn with_source(kind: ErrorKind, source: StdError) -> Self {
        let mut this = Self::new(kind);
        this.source = Some(source);
        this
    }

    /// Wraps an arbitrary failure of the storage backend.
    #[must_use]
    pub fn internal_error<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::with_source(ErrorKind::BackendFailure, Box::new(source))
    }

    pub fn set_message(&mut self, msg: impl Into<Cow<'static, str>>) {
        self.message = Some(msg.into());
    }

    pub fn set_source(&mut self, source: StdError) {
        self.source = Some(source);
    }

    /// Overrides the protocol code while keeping the kind.
    #[must_use]
    pub fn with_code(mut self, code: S3ErrorCode) -> Self {
        self.code = code;
        self
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn code(&self) -> S3ErrorCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn source_ref(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }
}

impl fmt::Display for S3Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {msg}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for S3Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source = self.source.as_deref()?;
        Some(source)
    }
}

/// Creates an [`S3Error`] from an [`ErrorKind`] name.
///
/// ```
/// use s3s_post::{s3_error, ErrorKind};
///
/// let err = s3_error!(EntityTooLarge, "got {} bytes", 11);
/// assert_eq!(err.kind(), ErrorKind::EntityTooLarge);
/// assert_eq!(err.message(), Some("got 11 bytes"));
/// ```
#[macro_export]
macro_rules! s3_error {
    ($source:expr, $kind:ident) => {{
        let mut err = $crate::S3Error::new($crate::ErrorKind::$kind);
        err.set_source(Box::new($source));
        err
    }};
    ($source:expr, $kind:ident, $($arg:tt)+) => {{
        let mut err = $crate::S3Error::with_message($crate::ErrorKind::$kind, format!($($arg)+));
        err.set_source(Box::new($source));
        err
    }};
    ($kind:ident) => {
        $crate::S3Error::new($crate::ErrorKind::$kind)
    };
    ($kind:ident, $($arg:tt)+) => {
        $crate::S3Error::with_message($crate::ErrorKind::$kind, format!($($arg)+))
    };
}
