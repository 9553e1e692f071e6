//! Middleware Hooks
//!
//! An ordered chain of hooks invoked at three extension points:
//!
//! - `before_send`: may rewrite the outgoing request in place, or
//!   short-circuit a request/response call by returning a response directly
//!   (nothing touches the wire in that case)
//! - `after_receive`: may replace a successful response before it reaches
//!   the caller
//! - `before_dispatch`: may veto routing of an inbound message entirely
//!
//! A hook that is absent at a point is a no-op: every trait method has a
//! pass-through default.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::domain::message::InboundMessage;

/// One middleware hook. Implement only the extension points you need.
pub trait Middleware: Send + Sync {
    /// Called before a request is serialized and sent. Returning `Some`
    /// short-circuits the call with that response; the request never
    /// reaches the wire. Streaming calls apply rewrites but ignore
    /// short-circuits.
    fn before_send(&self, _request: &mut Value) -> Option<InboundMessage> {
        None
    }

    /// Called after a successful response resolved. Returning `Some`
    /// replaces the response handed to the caller.
    fn after_receive(&self, _request: &Value, _response: &InboundMessage) -> Option<InboundMessage> {
        None
    }

    /// Called for every inbound message before routing. Returning `false`
    /// drops the message.
    fn before_dispatch(&self, _message: &InboundMessage) -> bool {
        true
    }
}

/// An ordered middleware chain.
#[derive(Clone, Default)]
pub struct MiddlewareStack {
    hooks: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook, builder style.
    #[must_use]
    pub fn with(mut self, hook: Arc<dyn Middleware>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Append a hook.
    pub fn push(&mut self, hook: Arc<dyn Middleware>) {
        self.hooks.push(hook);
    }

    /// Number of hooks in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run `before_send` hooks in order. The first hook returning `Some`
    /// wins; rewrites made by earlier hooks are kept either way.
    pub(crate) fn before_send(&self, request: &mut Value) -> Option<InboundMessage> {
        for hook in &self.hooks {
            if let Some(response) = hook.before_send(request) {
                return Some(response);
            }
        }
        None
    }

    /// Run `after_receive` hooks in order; the first replacement wins.
    pub(crate) fn after_receive(
        &self,
        request: &Value,
        response: &InboundMessage,
    ) -> Option<InboundMessage> {
        for hook in &self.hooks {
            if let Some(replaced) = hook.after_receive(request, response) {
                return Some(replaced);
            }
        }
        None
    }

    /// Run `before_dispatch` hooks in order; any veto drops the message.
    pub(crate) fn before_dispatch(&self, message: &InboundMessage) -> bool {
        self.hooks.iter().all(|hook| hook.before_dispatch(message))
    }
}

impl fmt::Debug for MiddlewareStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareStack")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
