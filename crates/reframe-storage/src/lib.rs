//! Object storage for conversion results too large to return inline.
//!
//! This crate provides:
//! - The `ObjectStore` seam the API disposes oversized artifacts through
//! - A Cloudflare R2 (S3 API) implementation with public or presigned URLs
//! - Object key generation

pub mod client;
pub mod error;
pub mod keys;

pub use client::{public_url, ObjectStore, R2Client, R2Config};
pub use error::{StorageError, StorageResult};
pub use keys::{new_object_key, object_key, random_suffix, DEFAULT_KEY_PREFIX};
