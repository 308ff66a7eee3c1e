//! Middleware: hooks around every dispatched call.
//!
//! `pre` runs after the method lookup, before the handler; rejecting skips
//! the handler but still runs `post`. For a stack, `pre` runs first-to-last
//! and `post` last-to-first, the usual wrap semantics.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tether_wire::Value;

use crate::context::Context;
use crate::server::HandlerError;

/// A client-safe refusal; the message is surfaced to the caller verbatim.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub message: String,
}

impl Rejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What the call produced, seen by `post` hooks.
#[derive(Clone, Copy)]
pub enum Outcome<'a> {
    Success(&'a Value),
    Error(&'a HandlerError),
    /// A `pre` hook refused the call; the handler never ran.
    Rejected(&'a Rejection),
}

pub trait Middleware: Send + Sync {
    /// Runs before the handler. `Err` rejects the call.
    fn pre<'a>(
        &'a self,
        ctx: &'a Context,
        params: &'a [Value],
    ) -> Pin<Box<dyn Future<Output = Result<(), Rejection>> + Send + 'a>>;

    /// Runs after the handler (or after a rejection).
    fn post<'a>(
        &'a self,
        _ctx: &'a Context,
        _outcome: Outcome<'a>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }
}

/// Middleware layers in registration order.
#[derive(Default)]
pub(crate) struct MiddlewareStack {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    pub fn push(&mut self, layer: Arc<dyn Middleware>) {
        self.layers.push(layer);
    }

    pub async fn pre(&self, ctx: &Context, params: &[Value]) -> Result<(), Rejection> {
        for layer in &self.layers {
            layer.pre(ctx, params).await?;
        }
        Ok(())
    }

    pub async fn post(&self, ctx: &Context, outcome: Outcome<'_>) {
        for layer in self.layers.iter().rev() {
            layer.post(ctx, outcome).await;
        }
    }
}
