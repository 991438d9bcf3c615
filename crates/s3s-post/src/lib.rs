//! Presigned POST upload engine
//!
//! `s3s-post` accepts browser-based `multipart/form-data` uploads ("presigned
//! POST"), checks them against the signed policy document they carry, enforces
//! the policy's size range while the file streams in, and only then commits the
//! object through a pluggable storage backend.
//!
//! # Architecture
//!
//! - [`http`]: streaming multipart decoder
//! - [`post_policy`]: policy document codec
//! - [`signature`]: POST signature V4 and V2 verification
//! - [`condition`]: policy condition evaluation
//! - [`ingest`]: the per-request state machine tying the above together
//! - [`commit`]: the storage backend boundary
//! - [`service`]: a hyper service answering `POST /{bucket}`
//!
//! # Example
//!
//! ```rust,no_run
//! use s3s_post::auth::StaticCredentials;
//! use s3s_post::commit::MemoryCommit;
//! use s3s_post::service::PostServiceBuilder;
//!
//! use hyper_util::rt::{TokioExecutor, TokioIo};
//! use hyper_util::server::conn::auto::Builder as ConnBuilder;
//! use tokio::net::TcpListener;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let auth = StaticCredentials::from_single("AKEXAMPLE", "SKEXAMPLE");
//! let service = PostServiceBuilder::new(auth, MemoryCommit::new()).build();
//! let listener = TcpListener::bind("127.0.0.1:8014").await?;
//!
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     let service = service.clone();
//!     tokio::spawn(async move {
//!         let _ = ConnBuilder::new(TokioExecutor::new())
//!             .serve_connection(TokioIo::new(stream), service)
//!             .await;
//!     });
//! }
//! # }
//! ```
//!
//! # Security
//!
//! The engine authenticates uploads but does not limit connection counts or
//! request rates. Put it behind something that does.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::bool_assert_comparison,
    clippy::module_name_repetitions,
    clippy::single_match_else,
    clippy::wildcard_imports,
    clippy::needless_continue
)]

#[macro_use]
mod error;

mod response;
mod sig_v2;
mod sig_v4;
mod utils;

pub mod auth;
pub mod commit;
pub mod condition;
pub mod config;
pub mod http;
pub mod ingest;
pub mod post_policy;
pub mod service;
pub mod signature;

pub use self::error::*;
pub use self::response::HttpResponse;
pub use self::service::HttpError;
