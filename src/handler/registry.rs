//! Handler registry for dispatching requests by method name.
//!
//! Methods are registered under their full RPC name, `"Endpoint.Method"`
//! (for example `"Builder.Prepare"`). Several endpoints may share one
//! registry, which is how a callback stream exposes both `Ui` and `Hook`.
//!
//! # Example
//!
//! ```ignore
//! use buildplug::handler::{HandlerRegistry, RequestContext};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register("Ui.Say", |message: String, ctx: RequestContext| async move {
//!     eprintln!("{message}");
//!     ctx.respond(&()).await
//! });
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use serde::de::DeserializeOwned;

use super::RequestContext;
use crate::codec::MsgPackCodec;
use crate::error::{PluginError, Result};

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a request with raw argument bytes.
    fn call(&self, data: &[u8], ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that decodes the MsgPack arguments before calling the handler.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, data: &[u8], ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let args: T = match MsgPackCodec::decode(data) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        Box::pin((self.handler)(args, ctx))
    }
}

/// Registry mapping `"Endpoint.Method"` names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    methods: BTreeMap<String, Box<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler under its full method name.
    ///
    /// Registering the same name twice replaces the earlier handler.
    pub fn register<F, T, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if self
            .methods
            .insert(name.to_string(), Box::new(TypedHandler::new(handler)))
            .is_some()
        {
            tracing::debug!(method = name, "handler replaced");
        }
    }

    pub fn get_handler(&self, name: &str) -> Option<&dyn Handler> {
        self.methods.get(name).map(|h| h.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names in sorted order.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Distinct endpoint names (the part before the dot).
    pub fn endpoints(&self) -> Vec<&str> {
        let mut endpoints: Vec<&str> = self
            .method_names()
            .filter_map(|name| name.split_once('.').map(|(endpoint, _)| endpoint))
            .collect();
        endpoints.dedup();
        endpoints
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Dispatch a request to the handler registered under `method`.
    pub async fn dispatch(&self, method: &str, payload: &[u8], ctx: RequestContext) -> Result<()> {
        let handler = self
            .get_handler(method)
            .ok_or_else(|| PluginError::UnknownMethod(method.to_string()))?;
        handler.call(payload, ctx).await
    }
}
