//! Evaluation of policy conditions
//!
//! Field conditions are checked once the form has been decoded. The
//! content-length-range condition is checked while the file streams in,
//! through a [`LengthGuard`].

use crate::error::S3Result;
use crate::http::{FormField, Multipart};
use crate::post_policy::{PostPolicy, PostPolicyCondition};

use time::OffsetDateTime;

/// Looks up submitted form values by lower-cased name.
pub trait FieldSource {
    fn field_value(&self, name: &str) -> Option<&str>;
}

impl FieldSource for Multipart {
    fn field_value(&self, name: &str) -> Option<&str> {
        self.find_field_value(name)
    }
}

/// The decoded form together with the bucket named by the request target.
///
/// `bucket` resolves to the form field when the form carries one.
#[derive(Debug, Clone, Copy)]
pub struct PostForm<'a> {
    pub multipart: &'a Multipart,
    pub bucket: &'a str,
}

impl FieldSource for PostForm<'_> {
    fn field_value(&self, name: &str) -> Option<&str> {
        match self.multipart.find_field_value(name) {
            Some(value) => Some(value),
            None if name == "bucket" => Some(self.bucket),
            None => None,
        }
    }
}

/// Rejects documents that decode but cannot be satisfied consistently.
///
/// # Errors
/// `MalformedPolicy` if the document has more than one content-length-range
/// or a range with `min > max`.
pub fn check_document(policy: &PostPolicy) -> S3Result<()> {
    let mut ranges = policy.conditions.iter().filter_map(|c| match *c {
        PostPolicyCondition::ContentLengthRange { min, max } => Some((min, max)),
        _ => None,
    });

    if let Some((min, max)) = ranges.next()
        && min > max
    {
        return Err(s3_error!(MalformedPolicy, "content-length-range minimum {min} exceeds maximum {max}"));
    }
    if ranges.next().is_some() {
        return Err(s3_error!(MalformedPolicy, "policy contains more than one content-length-range"));
    }

    Ok(())
}

/// # Errors
/// `PolicyConditionFailed` if the policy is not valid at `now`.
pub fn check_expiration(policy: &PostPolicy, now: OffsetDateTime) -> S3Result<()> {
    if now >= policy.expiration {
        return Err(s3_error!(PolicyConditionFailed, "Invalid according to Policy: Policy expired."));
    }
    Ok(())
}

/// Checks every `eq` and `starts-with` condition in declaration order.
///
/// # Errors
/// `PolicyConditionFailed` naming the first condition that is not met.
pub fn check_fields(policy: &PostPolicy, fields: &dyn FieldSource) -> S3Result<()> {
    for condition in &policy.conditions {
        let satisfied = match condition {
            PostPolicyCondition::Eq { field, value } => fields.field_value(field) == Some(value.as_str()),
            PostPolicyCondition::StartsWith { field, prefix } => {
                fields.field_value(field).is_some_and(|v| v.starts_with(prefix.as_str()))
            }
            PostPolicyCondition::ContentLengthRange { .. } => continue,
        };

        if !satisfied {
            return Err(s3_error!(
                PolicyConditionFailed,
                "Invalid according to Policy: Policy Condition failed: {condition}"
            ));
        }
    }
    Ok(())
}

/// Fields that never need a covering condition.
fn is_exempt(name: &str) -> bool {
    matches!(name, "policy" | "x-amz-signature" | "signature" | "awsaccesskeyid" | "file") || name.starts_with("x-ignore-")
}

/// Strict mode: every submitted field must be named by some condition.
///
/// # Errors
/// `PolicyConditionFailed` naming the first uncovered field.
pub fn check_coverage(policy: &PostPolicy, fields: &[FormField]) -> S3Result<()> {
    for f in fields {
        if is_exempt(&f.name) {
            continue;
        }
        if !policy.conditions.iter().any(|c| c.field() == Some(f.name.as_str())) {
            return Err(s3_error!(
                PolicyConditionFailed,
                "Invalid according to Policy: Extra input fields: {}",
                f.name
            ));
        }
    }
    Ok(())
}

/// Incremental check of the file size.
#[derive(Debug, Clone, Copy)]
pub struct LengthGuard {
    min: u64,
    max: u64,
    policy_max: Option<u64>,
    received: u64,
}

impl LengthGuard {
    /// `range` comes from the policy, `cap` is the server-wide maximum file size.
    #[must_use]
    pub fn new(range: Option<(u64, u64)>, cap: u64) -> Self {
        let (min, policy_max) = match range {
            Some((min, max)) => (min, Some(max)),
            None => (0, None),
        };
        Self {
            min,
            max: policy_max.map_or(cap, |m| m.min(cap)),
            policy_max,
            received: 0,
        }
    }

    /// Counts `n` more bytes.
    ///
    /// # Errors
    /// `EntityTooLarge` as soon as the running count exceeds the maximum.
    pub fn observe(&mut self, n: usize) -> S3Result<()> {
        let n = u64::try_from(n).unwrap_or(u64::MAX);
        self.received = self.received.saturating_add(n);
        if self.received > self.max {
            return Err(match self.policy_max {
                Some(max) if self.received > max => {
                    s3_error!(EntityTooLarge, "Your proposed upload exceeds the maximum allowed size")
                }
                _ => s3_error!(EntityTooLarge, "Your proposed upload exceeds the server file size limit"),
            });
        }
        Ok(())
    }

    /// Returns the final size.
    ///
    /// # Errors
    /// `EntityTooSmall` if fewer than `min` bytes were received.
    pub fn finish(&self) -> S3Result<u64> {
        if self.received < self.min {
            return Err(s3_error!(EntityTooSmall, "Your proposed upload is smaller than the minimum allowed size"));
        }
        Ok(self.received)
    }

    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }
}
