use super::{CredentialProvider, SecretKey};

use crate::error::{S3ErrorCode, S3Result};

use std::collections::HashMap;

use serde::Deserialize;

/// An in-memory table of access keys.
///
/// Deserializes from a JSON object mapping access keys to secrets.
#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct StaticCredentials {
    keys: HashMap<String, SecretKey>,
}

impl StaticCredentials {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_single(access_key: impl Into<String>, secret_key: impl Into<SecretKey>) -> Self {
        let mut this = Self::new();
        this.insert(access_key, secret_key);
        this
    }

    /// Returns the previous secret of `access_key`, if any.
    pub fn insert(&mut self, access_key: impl Into<String>, secret_key: impl Into<SecretKey>) -> Option<SecretKey> {
        self.keys.insert(access_key.into(), secret_key.into())
    }

    #[must_use]
    pub fn lookup(&self, access_key: &str) -> Option<&SecretKey> {
        self.keys.get(access_key)
    }
}

#[async_trait::async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_secret_key(&self, access_key: &str) -> S3Result<SecretKey> {
        match self.lookup(access_key) {
            Some(secret) => Ok(secret.clone()),
            None => Err(s3_error!(SignatureMismatch, "The AWS access key Id you provided does not exist in our records.")
                .with_code(S3ErrorCode::InvalidAccessKeyId)),
        }
    }
}
