//! In-memory transport shared by the scenario tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use spindle::{FailureKind, FetchFailure, FetchRequest, FetchResult, Transport};

#[derive(Clone)]
struct Route {
    response: Result<Bytes, FailureKind>,
    delay: Duration,
}

/// Serves fixed responses per URL, counts calls and records completion order.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<HashMap<String, u32>>,
    completed: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(self, url: &str, body: impl Into<Bytes>) -> Self {
        self.serve_after(url, body, Duration::ZERO)
    }

    pub fn serve_after(self, url: &str, body: impl Into<Bytes>, delay: Duration) -> Self {
        self.routes.lock().insert(
            url.to_string(),
            Route {
                response: Ok(body.into()),
                delay,
            },
        );
        self
    }

    pub fn fail(self, url: &str, kind: FailureKind) -> Self {
        self.routes.lock().insert(
            url.to_string(),
            Route {
                response: Err(kind),
                delay: Duration::ZERO,
            },
        );
        self
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    /// URLs in the order their responses were delivered.
    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, request: &FetchRequest) -> FetchResult {
        *self.calls.lock().entry(request.url.clone()).or_default() += 1;
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);

        let route = self.routes.lock().get(&request.url).cloned();
        let result = match route {
            Some(route) => {
                if !route.delay.is_zero() {
                    tokio::time::sleep(route.delay).await;
                }
                route.response
            }
            None => Err(FailureKind::HttpStatus(404)),
        };

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.completed.lock().push(request.url.clone());
        result.map_err(|kind| FetchFailure::new(kind, format!("mock {kind}")))
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Media playlist with `count` segments named `seg<i>.ts`.
pub fn media_playlist(count: usize) -> String {
    let mut doc = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n");
    for i in 0..count {
        doc.push_str(&format!("#EXTINF:6.0,\nseg{i}.ts\n"));
    }
    doc.push_str("#EXT-X-ENDLIST\n");
    doc
}
