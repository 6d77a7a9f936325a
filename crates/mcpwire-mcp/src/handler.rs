//! Typed dispatch of JSON-RPC methods.
//!
//! Each entry decodes its params into a concrete type, runs an async handler
//! and encodes the result. Unknown methods answer `-32601`; params that do
//! not decode answer `-32602`.

use crate::jsonrpc::JsonRpcError;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Future returned by a registered handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value, JsonRpcError>>;

type ErasedHandler<C> = Arc<dyn Fn(C, Option<Value>) -> HandlerFuture + Send + Sync>;

/// Method name to typed handler, with a per-call context `C`.
pub struct MethodRegistry<C> {
    handlers: HashMap<String, ErasedHandler<C>>,
}

impl<C> Clone for MethodRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<C> Default for MethodRegistry<C> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<C> std::fmt::Debug for MethodRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<_> = self.handlers.keys().collect();
        methods.sort();
        f.debug_struct("MethodRegistry")
            .field("methods", &methods)
            .finish()
    }
}

impl<C: Send + 'static> MethodRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`, replacing any earlier entry.
    pub fn register<P, R, F, Fut>(&mut self, method: impl Into<String>, handler: F) -> &mut Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(C, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, JsonRpcError>> + Send + 'static,
    {
        let erased: ErasedHandler<C> = Arc::new(
            move |ctx: C, params: Option<Value>| -> HandlerFuture {
                match decode_params::<P>(params) {
                    Ok(params) => {
                        let fut = handler(ctx, params);
                        Box::pin(async move {
                            let result = fut.await?;
                            serde_json::to_value(result).map_err(|e| {
                                JsonRpcError::internal(format!("failed to encode result: {e}"))
                            })
                        })
                    }
                    Err(error) => Box::pin(async move { Err(error) }),
                }
            },
        );
        self.handlers.insert(method.into(), erased);
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<P, R, F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(C, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, JsonRpcError>> + Send + 'static,
    {
        self.register(method, handler);
        self
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Start handling a call. The returned future owns everything it needs.
    pub fn call(&self, ctx: C, method: &str, params: Option<Value>) -> HandlerFuture {
        match self.handlers.get(method) {
            Some(handler) => handler(ctx, params),
            None => {
                let error = JsonRpcError::method_not_found(method);
                Box::pin(async move { Err(error) })
            }
        }
    }
}

/// Absent params decode as `null` first, then as `{}`, so both unit-like
/// and all-default struct params work.
fn decode_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, JsonRpcError> {
    let decoded = match params {
        Some(value) => serde_json::from_value(value),
        None => serde_json::from_value(Value::Null)
            .or_else(|_| serde_json::from_value(Value::Object(Map::new()))),
    };
    decoded.map_err(|e| JsonRpcError::invalid_params(format!("invalid params: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::codes;
    use crate::protocol::EmptyResult;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct EchoParams {
        text: String,
    }

    #[derive(Deserialize, Default)]
    #[serde(default)]
    struct PageParams {
        cursor: Option<String>,
    }

    fn registry() -> MethodRegistry<u32> {
        MethodRegistry::new()
            .with("echo", |ctx: u32, params: EchoParams| async move {
                Ok::<_, JsonRpcError>(json!({ "text": params.text, "ctx": ctx }))
            })
            .with("ping", |_ctx: u32, _params: Value| async move {
                Ok::<_, JsonRpcError>(EmptyResult {})
            })
            .with("page", |_ctx: u32, params: PageParams| async move {
                Ok::<_, JsonRpcError>(params.cursor.unwrap_or_default())
            })
            .with("fail", |_ctx: u32, _params: Value| async move {
                Err::<Value, _>(JsonRpcError::resource_not_found("file:///missing"))
            })
    }

    #[tokio::test]
    async fn test_dispatch_typed_handler() {
        let result = registry()
            .call(7, "echo", Some(json!({"text": "hi"})))
            .await
            .unwrap();
        assert_eq!(result, json!({"text": "hi", "ctx": 7}));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let err = registry().call(0, "nope", None).await.unwrap_err();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);
        assert!(err.message.contains("nope"));
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let err = registry()
            .call(0, "echo", Some(json!({"wrong": 1})))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_absent_params() {
        let registry = registry();
        assert_eq!(registry.call(0, "ping", None).await.unwrap(), json!({}));
        assert_eq!(registry.call(0, "page", None).await.unwrap(), json!(""));
    }

    #[tokio::test]
    async fn test_handler_error_passes_through() {
        let err = registry().call(0, "fail", None).await.unwrap_err();
        assert_eq!(err.code, codes::RESOURCE_NOT_FOUND);
    }

    #[test]
    fn test_registry_introspection() {
        let registry = registry();
        assert!(registry.contains("echo"));
        assert!(!registry.contains("tools/list"));
        assert_eq!(registry.len(), 4);
        assert!(format!("{registry:?}").contains("echo"));
    }
}
