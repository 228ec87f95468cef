//! Stash Fetch Layer
//!
//! This crate defines the transport seam of the offline cache: the
//! [`Fetcher`] trait the policy engine calls for every network attempt,
//! and an HTTP implementation of it.

pub mod client;
pub mod error;
pub mod fetcher;

pub use client::{HttpFetcher, HttpFetcherConfig};
pub use error::FetchError;
pub use fetcher::{FetchRequest, FetchResponse, Fetcher};
