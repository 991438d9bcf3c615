//! Credential lookup for signed POST uploads

mod secret_key;
pub use self::secret_key::SecretKey;

mod static_credentials;
pub use self::static_credentials::StaticCredentials;

use crate::error::S3Result;

/// Resolves the secret key that signed an upload.
///
/// The engine calls [`get_secret_key`](Self::get_secret_key) once per upload
/// with the access key taken from `x-amz-credential` (signature V4) or
/// `AWSAccessKeyId` (signature V2).
///
/// An unknown access key should be reported as
/// `s3_error!(SignatureMismatch).with_code(S3ErrorCode::InvalidAccessKeyId)`.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    async fn get_secret_key(&self, access_key: &str) -> S3Result<SecretKey>;
}
