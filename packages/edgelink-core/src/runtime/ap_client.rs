//! Access point clients.
//!
//! [`HttpApClient`] POSTs the allocate request to each configured AP endpoint
//! in turn, retrying rounds with a short backoff until one answers or the
//! request is cancelled. [`StaticApClient`] answers every request with a
//! fixed response, for direct connections and tests.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;

use crate::channel::{ApClient, ApEndpoints, ApEvent, WorkerManagerRequest};
use crate::context::ApUrlBuilder;
use crate::protocol_constants::{AP_FLAG_WORKER_MANAGER, AP_REQUEST_TIMEOUT_SECS, AP_RETRY_DELAYS_MS};

use super::spawner::{TaskSpawner, TokioSpawner};
use super::{EventSender, RuntimeEvent};

/// Header carrying the requested service type.
const SERVICE_TYPE_HEADER: &str = "X-Service-Type";

/// Delay before retry round `attempt` (the last delay repeats).
fn retry_delay(attempt: usize) -> Duration {
    let index = attempt.min(AP_RETRY_DELAYS_MS.len() - 1);
    Duration::from_millis(AP_RETRY_DELAYS_MS[index])
}

/// AP client speaking HTTP(S) via `reqwest`.
pub struct HttpApClient {
    spawner: TokioSpawner,
    events: EventSender,
    http: reqwest::Client,
    urls: Vec<String>,
    inflight: Option<CancellationToken>,
}

impl HttpApClient {
    /// Creates a client with the default request timeout.
    pub fn new(spawner: TokioSpawner, events: EventSender) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(AP_REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            spawner,
            events,
            http,
            urls: Vec::new(),
            inflight: None,
        })
    }

    /// URLs tried for each request, in order.
    #[must_use]
    pub fn urls(&self) -> &[String] {
        &self.urls
    }
}

impl ApClient for HttpApClient {
    fn configure(&mut self, endpoints: &ApEndpoints) {
        self.cancel();
        let builder = ApUrlBuilder::new(endpoints.scheme.clone(), endpoints.path.clone());
        self.urls = endpoints
            .hosts
            .iter()
            .flat_map(|host| endpoints.ports.iter().map(|port| builder.url(host, *port)))
            .collect();
        log::info!("[ApClient] Configured {} endpoint(s)", self.urls.len());
    }

    fn require_worker_manager(&mut self, request: WorkerManagerRequest) {
        self.cancel();
        if self.urls.is_empty() {
            log::warn!(
                "[ApClient] No AP endpoint configured, request {} not sent",
                request.request_id
            );
            return;
        }

        let token = CancellationToken::new();
        self.inflight = Some(token.clone());
        self.spawner.spawn(request_until_answered(
            self.http.clone(),
            self.urls.clone(),
            request,
            self.events.clone(),
            token,
        ));
    }

    fn cancel(&mut self) {
        if let Some(token) = self.inflight.take() {
            token.cancel();
        }
    }
}

impl Drop for HttpApClient {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn request_until_answered(
    http: reqwest::Client,
    urls: Vec<String>,
    request: WorkerManagerRequest,
    events: EventSender,
    cancel: CancellationToken,
) {
    let mut attempt = 0;
    loop {
        for url in &urls {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = post_request(&http, url, &request) => result,
            };
            match result {
                Ok(payload) => {
                    log::info!(
                        "[ApClient] Request {} answered by {}",
                        request.request_id,
                        url
                    );
                    let _ = events.send(RuntimeEvent::Ap(ApEvent {
                        request_id: request.request_id,
                        flags: AP_FLAG_WORKER_MANAGER,
                        error: 0,
                        payload,
                    }));
                    return;
                }
                Err(e) => log::warn!("[ApClient] {} failed: {}", url, e),
            }
        }

        let delay = retry_delay(attempt);
        attempt += 1;
        log::info!(
            "[ApClient] All endpoints failed, retrying in {}ms",
            delay.as_millis()
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn post_request(
    http: &reqwest::Client,
    url: &str,
    request: &WorkerManagerRequest,
) -> reqwest::Result<String> {
    http.post(url)
        .header(CONTENT_TYPE, "application/json")
        .header(SERVICE_TYPE_HEADER, request.service_type.as_str())
        .body(request.payload.clone())
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
}

/// AP client that answers every request with a fixed response.
pub struct StaticApClient {
    events: EventSender,
    response: String,
}

impl StaticApClient {
    /// `response` is the allocate response JSON handed back for every request.
    pub fn new(events: EventSender, response: impl Into<String>) -> Self {
        Self {
            events,
            response: response.into(),
        }
    }
}

impl ApClient for StaticApClient {
    fn configure(&mut self, _endpoints: &ApEndpoints) {}

    fn require_worker_manager(&mut self, request: WorkerManagerRequest) {
        log::debug!(
            "[ApClient] Answering request {} from static response",
            request.request_id
        );
        let _ = self.events.send(RuntimeEvent::Ap(ApEvent {
            request_id: request.request_id,
            flags: AP_FLAG_WORKER_MANAGER,
            error: 0,
            payload: self.response.clone(),
        }));
    }

    fn cancel(&mut self) {}
}
