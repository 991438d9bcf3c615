//! Signature verification of POST uploads
//!
//! The signed material is the `policy` form value exactly as submitted.
//! Verification happens before the policy is decoded, so a tampered policy is
//! reported as a signature mismatch whatever the tampering did to its encoding.

use crate::auth::CredentialProvider;
use crate::config::PostConfig;
use crate::error::{S3ErrorCode, S3Result};
use crate::http::{FormField, find_field_value};
use crate::sig_v2;
use crate::sig_v4::{self, AmzDate, CredentialV4};
use crate::utils::ct_eq;

use time::{Duration, OffsetDateTime};
use tracing::debug;

/// Form fields of a signature V4 POST.
#[derive(Debug, Clone, Copy)]
pub struct PostSignatureV4<'a> {
    pub policy: &'a str,
    pub x_amz_algorithm: &'a str,
    pub x_amz_credential: &'a str,
    pub x_amz_date: &'a str,
    pub x_amz_signature: &'a str,
}

impl<'a> PostSignatureV4<'a> {
    #[must_use]
    pub fn extract(fields: &'a [FormField]) -> Option<Self> {
        Some(Self {
            policy: find_field_value(fields, "policy")?,
            x_amz_algorithm: find_field_value(fields, "x-amz-algorithm")?,
            x_amz_credential: find_field_value(fields, "x-amz-credential")?,
            x_amz_date: find_field_value(fields, "x-amz-date")?,
            x_amz_signature: find_field_value(fields, "x-amz-signature")?,
        })
    }
}

/// Form fields of a signature V2 POST.
#[derive(Debug, Clone, Copy)]
pub struct PostSignatureV2<'a> {
    pub policy: &'a str,
    pub access_key_id: &'a str,
    pub signature: &'a str,
}

impl<'a> PostSignatureV2<'a> {
    #[must_use]
    pub fn extract(fields: &'a [FormField]) -> Option<Self> {
        Some(Self {
            policy: find_field_value(fields, "policy")?,
            access_key_id: find_field_value(fields, "awsaccesskeyid")?,
            signature: find_field_value(fields, "signature")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVersion {
    V2,
    V4,
}

/// Who signed an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub access_key: String,
    pub version: SignatureVersion,
    /// Region of the credential scope, V4 only.
    pub region: Option<String>,
}

/// Checks the signature fields of a decoded form.
pub struct SignatureVerifier<'a> {
    auth: &'a dyn CredentialProvider,
    config: &'a PostConfig,
    now: OffsetDateTime,
}

impl<'a> SignatureVerifier<'a> {
    #[must_use]
    pub fn new(auth: &'a dyn CredentialProvider, config: &'a PostConfig, now: OffsetDateTime) -> Self {
        Self { auth, config, now }
    }

    /// # Errors
    /// - `MalformedRequest` if signature fields are missing or unparsable
    /// - `SignatureExpired` if the signing date is outside the permitted window
    /// - `SignatureMismatch` if the signature does not verify or the key is unknown
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn verify(&self, fields: &[FormField]) -> S3Result<VerifiedSignature> {
        if find_field_value(fields, "x-amz-signature").is_some() {
            debug!("checking post signature v4");
            return self.verify_v4(fields).await;
        }

        if find_field_value(fields, "signature").is_some() {
            debug!("checking post signature v2");
            return self.verify_v2(fields).await;
        }

        Err(s3_error!(MalformedRequest, "missing required multipart fields: signature"))
    }

    async fn verify_v4(&self, fields: &[FormField]) -> S3Result<VerifiedSignature> {
        let info = PostSignatureV4::extract(fields).ok_or_else(|| s3_error!(MalformedRequest, "missing required multipart fields"))?;

        if info.x_amz_algorithm != sig_v4::ALGORITHM {
            return Err(s3_error!(
                SignatureMismatch,
                "x-amz-algorithm other than {} is not supported",
                sig_v4::ALGORITHM
            ));
        }

        let credential = CredentialV4::parse(info.x_amz_credential)
            .map_err(|e| s3_error!(e, MalformedRequest, "invalid field: x-amz-credential"))?;
        let amz_date = AmzDate::parse(info.x_amz_date).map_err(|e| s3_error!(e, MalformedRequest, "invalid field: x-amz-date"))?;

        if credential.date != amz_date.fmt_date() {
            return Err(s3_error!(SignatureMismatch, "credential scope date does not match x-amz-date"));
        }

        self.check_signing_time(&amz_date)?;

        let secret_key = self.auth.get_secret_key(credential.access_key_id).await?;

        let signature = sig_v4::calculate_signature(info.policy, &secret_key, &amz_date, credential.aws_region, credential.aws_service);
        if !ct_eq(signature.as_bytes(), info.x_amz_signature.as_bytes()) {
            debug!(access_key = credential.access_key_id, "post signature v4 mismatch");
            return Err(s3_error!(SignatureMismatch));
        }

        Ok(VerifiedSignature {
            access_key: credential.access_key_id.to_owned(),
            version: SignatureVersion::V4,
            region: Some(credential.aws_region.to_owned()),
        })
    }

    async fn verify_v2(&self, fields: &[FormField]) -> S3Result<VerifiedSignature> {
        let info = PostSignatureV2::extract(fields).ok_or_else(|| s3_error!(MalformedRequest, "missing required multipart fields"))?;

        let secret_key = self.auth.get_secret_key(info.access_key_id).await?;

        let signature = sig_v2::calculate_post_signature(info.policy, &secret_key);
        if !ct_eq(signature.as_bytes(), info.signature.as_bytes()) {
            debug!(access_key = info.access_key_id, "post signature v2 mismatch");
            return Err(s3_error!(SignatureMismatch));
        }

        Ok(VerifiedSignature {
            access_key: info.access_key_id.to_owned(),
            version: SignatureVersion::V2,
            region: None,
        })
    }

    fn check_signing_time(&self, amz_date: &AmzDate) -> S3Result<()> {
        let Some(signed_at) = amz_date.to_time() else {
            return Err(s3_error!(MalformedRequest, "invalid field: x-amz-date"));
        };

        let max_skew = Duration::seconds(i64::from(self.config.max_skew_time_secs));
        if signed_at > self.now + max_skew {
            return Err(s3_error!(SignatureExpired, "Request is not valid yet").with_code(S3ErrorCode::AccessDenied));
        }

        let max_age = Duration::seconds(i64::from(self.config.max_credential_age_secs));
        if self.now - signed_at > max_age {
            return Err(s3_error!(SignatureExpired, "Request has expired"));
        }

        Ok(())
    }
}
