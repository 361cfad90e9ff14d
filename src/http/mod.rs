//! Retrying HTTP request helper.
//!
//! All remote calls (center heartbeats, resource bundles, task control APIs) go through
//! [`RequestClient`], which encodes JSON bodies, retries per a [`RetryPolicy`] and unwraps
//! the `{code, msg}` response envelope.

mod client;
mod retry;

pub use client::{Method, RequestClient, is_success_code};
pub use retry::{Attempts, RetryPolicy, retry};
