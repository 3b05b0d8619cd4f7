//! Backblaze B2 remote store

pub mod client;
pub mod types;

pub use client::B2Client;
pub use types::{B2File, ListFilesResponse};
