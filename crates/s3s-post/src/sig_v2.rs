//! AWS Signature Version 2 for browser-based POST uploads
//!
//! See <https://docs.aws.amazon.com/AmazonS3/latest/userguide/HTTPPOSTForms.html>

use crate::auth::SecretKey;
use crate::utils::hmac_sha1;

/// `base64(HMAC-SHA1(secret, policy))`
#[must_use]
pub fn calculate_post_signature(policy: &str, secret_key: &SecretKey) -> String {
    base64_simd::STANDARD.encode_to_string(hmac_sha1(secret_key.expose(), policy))
}
