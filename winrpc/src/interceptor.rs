//! Ordered request/response interceptor chains (§4.8.1).
//!
//! Each entry is an async `fulfilled`/`rejected` pair, since interceptors
//! here may need to await (e.g. to read a cookie jar behind a lock across
//! an await point).

use std::sync::Arc;

use futures_core::future::BoxFuture;

use winrpc_core::RpcError;

pub type Fulfilled<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<T, RpcError>> + Send + Sync>;
pub type Rejected<T> = Arc<dyn Fn(RpcError) -> BoxFuture<'static, Result<T, RpcError>> + Send + Sync>;

struct Entry<T> {
    fulfilled: Fulfilled<T>,
    rejected: Option<Rejected<T>>,
}

/// An ordered pipeline of transform steps. Each step may transform the value
/// or reject it; a later step's `rejected` handler (if present) can recover
/// from an earlier rejection, otherwise it propagates to the next step
/// untouched.
pub struct InterceptorChain<T> {
    entries: parking_lot::Mutex<Vec<Entry<T>>>,
}

impl<T> Default for InterceptorChain<T> {
    fn default() -> Self {
        Self {
            entries: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

impl<T: Send + 'static> InterceptorChain<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_interceptor(&self, fulfilled: Fulfilled<T>, rejected: Option<Rejected<T>>) {
        self.entries.lock().push(Entry { fulfilled, rejected });
    }

    /// Runs every entry in registration order, starting from `Ok(value)`.
    pub async fn run(&self, value: T) -> Result<T, RpcError> {
        let entries: Vec<Entry<T>> = {
            let guard = self.entries.lock();
            guard
                .iter()
                .map(|entry| Entry {
                    fulfilled: entry.fulfilled.clone(),
                    rejected: entry.rejected.clone(),
                })
                .collect()
        };

        let mut state: Result<T, RpcError> = Ok(value);
        for entry in entries {
            state = match state {
                Ok(value) => (entry.fulfilled)(value).await,
                Err(err) => match &entry.rejected {
                    Some(rejected) => rejected(err).await,
                    None => Err(err),
                },
            };
        }
        state
    }
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            fulfilled: self.fulfilled.clone(),
            rejected: self.rejected.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed<T: Send + 'static>(value: Result<T, RpcError>) -> BoxFuture<'static, Result<T, RpcError>> {
        Box::pin(async move { value })
    }

    #[tokio::test]
    async fn runs_entries_in_order() {
        let chain: InterceptorChain<Vec<i32>> = InterceptorChain::new();
        chain.use_interceptor(
            Arc::new(|mut v: Vec<i32>| {
                v.push(1);
                boxed(Ok(v))
            }),
            None,
        );
        chain.use_interceptor(
            Arc::new(|mut v: Vec<i32>| {
                v.push(2);
                boxed(Ok(v))
            }),
            None,
        );
        let result = chain.run(Vec::new()).await.unwrap();
        assert_eq!(result, vec![1, 2]);
    }

    #[tokio::test]
    async fn rejection_propagates_without_a_recovery_handler() {
        let chain: InterceptorChain<i32> = InterceptorChain::new();
        chain.use_interceptor(
            Arc::new(|_: i32| boxed(Err(RpcError::new(winrpc_core::ErrorCode::RequestError, "nope")))),
            None,
        );
        chain.use_interceptor(Arc::new(|v: i32| boxed(Ok(v + 1))), None);
        let result = chain.run(0).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rejected_handler_can_recover() {
        let chain: InterceptorChain<i32> = InterceptorChain::new();
        chain.use_interceptor(
            Arc::new(|_: i32| boxed(Err(RpcError::new(winrpc_core::ErrorCode::RequestError, "nope")))),
            None,
        );
        chain.use_interceptor(
            Arc::new(|v: i32| boxed(Ok(v))),
            Some(Arc::new(|_err: RpcError| boxed(Ok(42)))),
        );
        let result = chain.run(0).await.unwrap();
        assert_eq!(result, 42);
    }
}
