//! Shared helpers for unit tests: a scripted in-memory transport and tracing setup.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{FailureKind, FetchFailure};
use crate::transport::{ByteRange, FetchRequest, FetchResult, Transport};

/// Initialize tracing for tests with appropriate settings
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

type Scripted = Result<Bytes, FailureKind>;

#[derive(Default)]
struct Route {
    script: VecDeque<Scripted>,
    fallback: Option<Scripted>,
    delay: Duration,
}

/// Transport answering from per-URL scripts. Unknown URLs answer 404.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<HashMap<String, u32>>,
    requests: Mutex<Vec<(String, Option<ByteRange>)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `body`.
    pub fn ok(self, url: &str, body: &[u8]) -> Self {
        self.routes.lock().entry(url.to_string()).or_default().fallback =
            Some(Ok(Bytes::copy_from_slice(body)));
        self
    }

    /// Always fail with `kind`.
    pub fn fail_always(self, url: &str, kind: FailureKind) -> Self {
        self.routes.lock().entry(url.to_string()).or_default().fallback = Some(Err(kind));
        self
    }

    /// Answer with `responses` in order, then fall back to the route's fallback (or 404).
    pub fn script(self, url: &str, responses: Vec<Scripted>) -> Self {
        self.routes
            .lock()
            .entry(url.to_string())
            .or_default()
            .script
            .extend(responses);
        self
    }

    /// Delay every response for `url`.
    pub fn delay(self, url: &str, delay: Duration) -> Self {
        self.routes.lock().entry(url.to_string()).or_default().delay = delay;
        self
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }

    pub fn requests(&self) -> Vec<(String, Option<ByteRange>)> {
        self.requests.lock().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, request: &FetchRequest) -> FetchResult {
        *self.calls.lock().entry(request.url.clone()).or_default() += 1;
        self.requests
            .lock()
            .push((request.url.clone(), request.range));
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);

        let (response, delay) = {
            let mut routes = self.routes.lock();
            match routes.get_mut(&request.url) {
                Some(route) => {
                    let response = route
                        .script
                        .pop_front()
                        .or_else(|| route.fallback.clone())
                        .unwrap_or(Err(FailureKind::HttpStatus(404)));
                    (response, route.delay)
                }
                None => (Err(FailureKind::HttpStatus(404)), Duration::ZERO),
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        response.map_err(|kind| FetchFailure::new(kind, format!("scripted {kind} for {}", request.url)))
    }
}
