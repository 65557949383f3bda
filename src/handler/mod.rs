//! Handler module - request dispatch and response context.
//!
//! - [`HandlerRegistry`] - maps `"Endpoint.Method"` names to handlers
//! - [`RequestContext`] - passed to handlers for replying

mod context;
mod registry;

pub use context::RequestContext;
pub(crate) use context::ReplySink;
pub use registry::{BoxFuture, Handler, HandlerRegistry, HandlerResult, TypedHandler};
