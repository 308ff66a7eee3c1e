#![deny(unsafe_code)]

//! Server side of tether.
//!
//! A [`Server`] is a method table plus middleware, served one socket at a
//! time via [`Server::serve`]. Accepting sockets (listening, upgrading) is
//! the embedder's job; this crate starts where a connected socket ends.

pub mod channel;
pub mod context;
pub mod middleware;
pub mod server;

pub use channel::Channel;
pub use context::{ConnectionContext, Context};
pub use middleware::{Middleware, Outcome, Rejection};
pub use server::{Handler, HandlerError, HandlerFuture, Server, ServerBuilder};
