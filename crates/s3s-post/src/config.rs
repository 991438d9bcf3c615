//! POST upload configuration
//!
//! Limits and switches that govern how a presigned POST is decoded and checked.
//!
//! # Features
//! - `serde` support with per-field defaults
//! - Static configuration via [`StaticConfigProvider`]
//! - Hot-reload configuration via [`HotReloadConfigProvider`]
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use s3s_post::config::{PostConfig, PostConfigProvider, StaticConfigProvider, HotReloadConfigProvider};
//!
//! let mut config = PostConfig::default();
//! config.require_bucket_field = true;
//!
//! let static_provider = Arc::new(StaticConfigProvider::new(Arc::new(config.clone())));
//! assert!(static_provider.snapshot().require_bucket_field);
//!
//! let hot_reload_provider = Arc::new(HotReloadConfigProvider::default());
//! assert!(!hot_reload_provider.snapshot().require_bucket_field);
//!
//! hot_reload_provider.update(Arc::new(config));
//! assert!(hot_reload_provider.snapshot().require_bucket_field);
//! ```

use crate::http::MultipartLimits;

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// Supplies the configuration in effect for a request.
///
/// A request takes one snapshot when it starts and keeps using it, so an
/// update never changes the limits of an upload that is already in flight.
pub trait PostConfigProvider: Send + Sync + 'static {
    fn snapshot(&self) -> Arc<PostConfig>;
}

/// POST upload configuration.
///
/// # Example
/// ```
/// use s3s_post::config::PostConfig;
///
/// let config: PostConfig = serde_json::from_str(r#"{"strict_form_fields": true}"#).unwrap();
/// assert!(config.strict_form_fields);
/// assert_eq!(config.max_form_parts, 1000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct PostConfig {
    /// Maximum size of the file part in bytes, applied even when the policy
    /// allows more.
    ///
    /// Default: 5 GB (5 * 1024 * 1024 * 1024)
    pub max_post_object_file_size: u64,

    /// Maximum size per form field in bytes.
    ///
    /// Default: 1 MB (1024 * 1024)
    pub max_form_field_size: usize,

    /// Maximum size of everything preceding the file part, and of the trailer
    /// following it.
    ///
    /// Default: 20 MB (20 * 1024 * 1024)
    pub max_form_fields_size: usize,

    /// Maximum number of parts in the form.
    ///
    /// Default: 1000
    pub max_form_parts: usize,

    /// How far in the future a signing date may lie, in seconds.
    ///
    /// Default: 900 (15 minutes)
    pub max_skew_time_secs: u32,

    /// How old a signing date may be, in seconds.
    ///
    /// Default: 604800 (7 days)
    pub max_credential_age_secs: u32,

    /// Rejects uploads whose form does not carry a `bucket` field.
    ///
    /// Default: false
    pub require_bucket_field: bool,

    /// Rejects uploads carrying a form field that no policy condition covers.
    ///
    /// Default: false
    pub strict_form_fields: bool,

    /// Deadline for streaming the file part, in seconds. `None` disables it.
    ///
    /// Default: None
    pub upload_timeout_secs: Option<u64>,
}

impl Default for PostConfig {
    fn default() -> Self {
        Self {
            max_post_object_file_size: 5 * 1024 * 1024 * 1024, // 5 GB
            max_form_field_size: 1024 * 1024,                  // 1 MB
            max_form_fields_size: 20 * 1024 * 1024,            // 20 MB
            max_form_parts: 1000,
            max_skew_time_secs: 900,         // 15 minutes
            max_credential_age_secs: 604_800, // 7 days
            require_bucket_field: false,
            strict_form_fields: false,
            upload_timeout_secs: None,
        }
    }
}

impl PostConfig {
    #[must_use]
    pub fn multipart_limits(&self) -> MultipartLimits {
        MultipartLimits {
            max_field_size: self.max_form_field_size,
            max_fields_size: self.max_form_fields_size,
            max_parts: self.max_form_parts,
        }
    }
}

/// Static configuration provider.
#[derive(Debug)]
pub struct StaticConfigProvider {
    inner: Arc<PostConfig>,
}

impl StaticConfigProvider {
    #[must_use]
    pub fn new(config: Arc<PostConfig>) -> Self {
        Self { inner: config }
    }
}

impl Default for StaticConfigProvider {
    fn default() -> Self {
        Self::new(Arc::new(PostConfig::default()))
    }
}

impl PostConfigProvider for StaticConfigProvider {
    fn snapshot(&self) -> Arc<PostConfig> {
        Arc::clone(&self.inner)
    }
}

/// Hot-reload configuration provider.
///
/// Reads are lock-free; [`update`](Self::update) swaps the whole
/// configuration atomically.
#[derive(Debug)]
pub struct HotReloadConfigProvider {
    inner: ArcSwap<PostConfig>,
}

impl HotReloadConfigProvider {
    #[must_use]
    pub fn new(config: Arc<PostConfig>) -> Self {
        Self {
            inner: ArcSwap::from(config),
        }
    }

    pub fn update(&self, config: Arc<PostConfig>) {
        self.inner.store(config);
    }
}

impl Default for HotReloadConfigProvider {
    fn default() -> Self {
        Self::new(Arc::new(PostConfig::default()))
    }
}

impl PostConfigProvider for HotReloadConfigProvider {
    fn snapshot(&self) -> Arc<PostConfig> {
        self.inner.load_full()
    }
}
