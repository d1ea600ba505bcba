//! Message handlers registered through `subscribe`.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::HandlerError;

/// Async handler invoked with each decoded message.
///
/// Returning `Err` makes the transport redeliver the message.
pub type MessageHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Box an async closure as a [`MessageHandler`].
///
/// ```ignore
/// broker.subscribe("evaluation-results", handler(|payload| async move {
///     store_result(payload).await?;
///     Ok(())
/// }))?;
/// ```
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |payload: Value| f(payload).boxed())
}

/// Like [`handler`], but deserializes the payload into `T` first.
///
/// A payload that does not match `T` is a handler error (and is redelivered).
pub fn typed_handler<T, F, Fut>(f: F) -> MessageHandler
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |payload: Value| {
        let f = Arc::clone(&f);
        async move {
            let message: T = serde_json::from_value(payload)?;
            f(message).await
        }
        .boxed()
    })
}
