//! File system backend for presigned POST uploads
//!
//! [`FileSystem`] stores each accepted upload as a plain file under
//! `{root}/{bucket}/{key}`. Bytes are spooled to a temporary file first and
//! moved into place on finalize, so a rejected upload never becomes visible.

#![allow(clippy::wildcard_imports, clippy::missing_errors_doc)]

#[macro_use]
mod error;

mod fs;
mod utils;

pub use self::error::*;
pub use self::fs::{FileSystem, ObjectAttributes};
