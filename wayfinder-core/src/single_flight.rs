use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::error::Error;

type FlightFuture<T> = Shared<BoxFuture<'static, Result<T, Error>>>;

/// Collapses concurrent identical work: while a future is registered for a
/// key, every caller awaits the same future and observes the same result
/// (success or failure). The record is dropped the moment the work
/// completes, so results are never served across completion.
///
/// Cloning yields another handle over the same in-flight map.
#[derive(Clone)]
pub struct SingleFlight<T: Clone + Send + Sync + 'static> {
    inflight: Arc<Mutex<HashMap<String, FlightFuture<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the in-flight future for `key`, or start `work` and register it.
    pub async fn dedupe<F, Fut>(&self, key: &str, work: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let flight = {
            let mut inflight = self.inflight.lock().map_err(|_| Error::Internal {
                message: "single-flight lock poisoned".to_string(),
            })?;
            if let Some(existing) = inflight.get(key) {
                existing.clone()
            } else {
                let map = Arc::clone(&self.inflight);
                let owned_key = key.to_string();
                let fut = work();
                let flight = async move {
                    let result = fut.await;
                    if let Ok(mut inflight) = map.lock() {
                        inflight.remove(&owned_key);
                    }
                    result
                }
                .boxed()
                .shared();
                inflight.insert(key.to_string(), flight.clone());
                flight
            }
        };
        flight.await
    }

    /// Number of keys currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
