//! HTTP client for the bucket upload service.
//!
//! [`HttpUploadService`] implements the scheduler's
//! [`UploadService`](bucketload_transfer::UploadService) seam over
//! `reqwest`: begin a bucket, pre-flight entries, send entry bodies and
//! commit the bucket.

pub mod client;
pub mod wire;

pub use client::{ClientError, HttpUploadService};
