//! Action registry and timed dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::Value;
use switchboard_core::RequestEnvelope;
use tracing::{error, warn};

use crate::context::RequestContext;
use crate::errors::RpcError;
use crate::metrics::{RPC_ERRORS_TOTAL, RPC_REQUEST_DURATION_SECONDS, RPC_REQUESTS_TOTAL};

/// Default limit on a single handler's run time.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

/// Requests slower than this are logged.
const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(5);

/// Implemented by every action handler.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Handle one request. `Ok(Value::Null)` means success without data.
    async fn handle(&self, req: &RequestEnvelope, ctx: &RequestContext) -> Result<Value, RpcError>;
}

/// Adapter turning an async closure into an [`ActionHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(RequestEnvelope, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn handle(&self, req: &RequestEnvelope, ctx: &RequestContext) -> Result<Value, RpcError> {
        (self.0)(req.clone(), ctx.clone()).await
    }
}

/// Maps action names to handlers. Populated at startup, read-only after.
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    timeout: Duration,
}

impl ActionRegistry {
    /// Create an empty registry with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HANDLER_TIMEOUT)
    }

    /// Create an empty registry with a custom handler timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            timeout,
        }
    }

    /// Register a handler, replacing any previous one for `action`.
    pub fn register(&mut self, action: &str, handler: impl ActionHandler + 'static) {
        let _ = self.handlers.insert(action.to_owned(), Arc::new(handler));
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&mut self, action: &str, f: F)
    where
        F: Fn(RequestEnvelope, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.register(action, FnHandler(f));
    }

    /// Run the handler for `req.action` under the timeout.
    pub async fn dispatch(&self, req: &RequestEnvelope, ctx: &RequestContext) -> Result<Value, RpcError> {
        let Some(handler) = self.handlers.get(&req.action) else {
            // unbounded client input, keep it out of metric labels
            counter!(RPC_ERRORS_TOTAL, "action" => "unknown", "error_type" => "unknown_action")
                .increment(1);
            return Err(RpcError::UnknownAction {
                action: req.action.clone(),
            });
        };
        let action = req.action.clone();
        counter!(RPC_REQUESTS_TOTAL, "action" => action.clone()).increment(1);

        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, handler.handle(req, ctx)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                error!(action = %action, seq = req.seq, "handler timed out after {:?}", self.timeout);
                Err(RpcError::Timeout {
                    action: action.clone(),
                })
            }
        };

        let duration = start.elapsed();
        histogram!(RPC_REQUEST_DURATION_SECONDS, "action" => action.clone())
            .record(duration.as_secs_f64());
        if duration >= SLOW_REQUEST_THRESHOLD {
            warn!(action = %action, duration_secs = duration.as_secs_f64(), "slow request");
        }

        if let Err(err) = &result {
            counter!(RPC_ERRORS_TOTAL, "action" => action, "error_type" => err.error_type())
                .increment(1);
        }
        result
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `action` has a handler.
    pub fn has_action(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
