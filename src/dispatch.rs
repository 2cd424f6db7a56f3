//! Routes remote calls through the response cache.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::cache::{ResponseCache, codec};
use crate::debug_log;
use crate::error::QueryError;
use crate::remote::RemoteService;

/// Top-level response fields that describe the transport, not the data.
const TRANSPORT_METADATA_FIELDS: &[&str] = &["ResponseMetadata", "$metadata"];

#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    /// Entry lifetime; zero or less disables caching.
    pub ttl_seconds: i64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self { ttl_seconds: 60 }
    }
}

/// A call result carried together with the join key it was issued for.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyed<T> {
    pub join_key: Option<String>,
    pub value: T,
}

#[derive(Clone)]
pub struct Dispatcher {
    service: Arc<dyn RemoteService>,
    cache: ResponseCache,
    options: CacheOptions,
}

impl Dispatcher {
    pub fn new(service: Arc<dyn RemoteService>, cache: ResponseCache, options: CacheOptions) -> Self {
        Self {
            service,
            cache,
            options,
        }
    }

    /// Invoke `operation` with `args`, answering from the cache when possible.
    pub async fn call(&self, operation: &str, args: &Map<String, Value>) -> Result<Value, QueryError> {
        self.call_with_ttl(operation, args, self.options.ttl_seconds).await
    }

    /// Like [`Dispatcher::call`] with an explicit entry lifetime for this call.
    pub async fn call_with_ttl(
        &self,
        operation: &str,
        args: &Map<String, Value>,
        ttl_seconds: i64,
    ) -> Result<Value, QueryError> {
        let _span = debug_log::TimedSpan::new("DISPATCH", operation.to_string());
        let service = Arc::clone(&self.service);

        self.cache
            .get_or_fetch(operation, args, ttl_seconds, || async move {
                debug_log::dispatch("CALL", operation);
                match service.invoke(operation, args).await {
                    Ok(raw) => Ok(codec::normalize(strip_transport_metadata(raw))),
                    Err(e) => {
                        debug_log::dispatch("FAILED", &format!("{operation}: {e}"));
                        Err(QueryError::remote(operation, e.to_string()))
                    }
                }
            })
            .await
    }

    /// Like [`Dispatcher::call`], returning the result tagged with `join_key`.
    pub async fn call_keyed(
        &self,
        operation: &str,
        args: &Map<String, Value>,
        join_key: Option<String>,
    ) -> Result<Keyed<Value>, QueryError> {
        let value = self.call(operation, args).await?;
        Ok(Keyed { join_key, value })
    }
}

fn strip_transport_metadata(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            for field in TRANSPORT_METADATA_FIELDS {
                map.shift_remove(*field);
            }
            Value::Object(map)
        }
        other => other,
    }
}
