//! Prelude module for convenient imports.
//!
//! ```
//! use sluice::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`Client`] - The engine instance running queries and mutations
//! - [`Request`], [`Resource`], [`FetchPolicy`] - Describing what to fetch
//! - [`QueryState`], [`QueryOutcome`], [`Response`] - What a call produces
//! - [`CancelToken`] - For aborting requests
//! - [`QueryError`] - The error type

pub use crate::cache::{CacheSnapshot, CacheUpdate, SplitCache};
pub use crate::client::query::{OnChange, QueryOutcome};
pub use crate::client::{Client, Response};
pub use crate::config::ClientConfig;
pub use crate::error::QueryError;
pub use crate::request::{FetchPolicy, FromCache, QueryState, Request, Resource, ToCache};
pub use crate::token::CancelToken;
