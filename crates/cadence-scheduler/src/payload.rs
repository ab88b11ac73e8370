//! Where a job's payload comes from on each run.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use crate::error::RunError;

/// Error type payload factories may return.
pub type PayloadError = Box<dyn std::error::Error + Send + Sync>;

type SyncFactory = Arc<dyn Fn() -> Result<Value, PayloadError> + Send + Sync>;
type AsyncFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Value, PayloadError>> + Send + Sync>;

/// Payload for a job's runs: a fixed value, or a factory evaluated fresh
/// before every run (retries included).
#[derive(Clone)]
pub enum PayloadSource {
    Static(Value),
    Sync(SyncFactory),
    Async(AsyncFactory),
}

impl PayloadSource {
    pub fn from_fn<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Value, PayloadError> + Send + Sync + 'static,
    {
        PayloadSource::Sync(Arc::new(factory))
    }

    pub fn from_async<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, PayloadError>> + Send + 'static,
    {
        PayloadSource::Async(Arc::new(move || factory().boxed()))
    }

    /// The value stored on the job record; factories are in-process only.
    pub fn stored_value(&self) -> Value {
        match self {
            PayloadSource::Static(value) => value.clone(),
            PayloadSource::Sync(_) | PayloadSource::Async(_) => Value::Null,
        }
    }

    pub async fn resolve(&self) -> Result<Value, RunError> {
        match self {
            PayloadSource::Static(value) => Ok(value.clone()),
            PayloadSource::Sync(factory) => factory().map_err(|e| RunError::Payload(e.to_string())),
            PayloadSource::Async(factory) => factory()
                .await
                .map_err(|e| RunError::Payload(e.to_string())),
        }
    }
}

impl Default for PayloadSource {
    fn default() -> Self {
        PayloadSource::Static(Value::Null)
    }
}

impl From<Value> for PayloadSource {
    fn from(value: Value) -> Self {
        PayloadSource::Static(value)
    }
}

impl fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadSource::Static(value) => f.debug_tuple("Static").field(value).finish(),
            PayloadSource::Sync(_) => f.write_str("Sync(<fn>)"),
            PayloadSource::Async(_) => f.write_str("Async(<fn>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn sync_factory_is_evaluated_per_resolve() {
        let counter = Arc::new(AtomicU64::new(0));
        let c = counter.clone();
        let source = PayloadSource::from_fn(move || {
            Ok(json!({ "attempt": c.fetch_add(1, Ordering::SeqCst) }))
        });

        assert_eq!(source.resolve().await.unwrap(), json!({"attempt": 0}));
        assert_eq!(source.resolve().await.unwrap(), json!({"attempt": 1}));
        assert_eq!(source.stored_value(), Value::Null);
    }

    #[tokio::test]
    async fn async_factory_errors_become_payload_errors() {
        let source = PayloadSource::from_async(|| async { Err::<Value, _>("upstream down".into()) });
        assert_eq!(
            source.resolve().await,
            Err(RunError::Payload("upstream down".into()))
        );
    }

    #[tokio::test]
    async fn static_value_round_trips() {
        let source = PayloadSource::from(json!([1, 2, 3]));
        assert_eq!(source.resolve().await.unwrap(), json!([1, 2, 3]));
        assert_eq!(source.stored_value(), json!([1, 2, 3]));
    }
}
