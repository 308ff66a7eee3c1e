#![deny(unsafe_code)]

//! Reconnecting client for tether.
//!
//! [`Client`] wraps a [`SocketAdapter`](tether_session::adapter::SocketAdapter)
//! in a connect loop with exponential backoff, buffers requests across
//! disconnects, probes liveness, and offers [`subscribe`](Client::subscribe)
//! which is the one surface that automatically re-issues its call when the
//! connection drops mid-sequence.

pub mod backoff;
pub mod client;
pub mod subscribe;

pub use backoff::{Backoff, RetryError, retry};
pub use client::{Client, ClientBuilder, ConnectionHandle, ConnectionHook, RetryPredicate};
pub use subscribe::{NotAStream, ObserverError, SubscribeOptions, Subscription};
