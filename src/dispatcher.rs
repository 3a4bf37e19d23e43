//! The frontend dispatcher (spec component C5): one per public port. Binds the control routes
//! and a proxy route that selects a backend through the coordinator and relays the request.

use std::sync::Arc;
use std::time::Duration;

use actix_web::http::{Method, StatusCode};
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderName, HeaderValue};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use crate::coordinator::Coordinator;
use crate::supervisor::OnDemandSupervisor;

/// How long the entire proxy attempt (retry loop plus relaying the response body) may run.
/// Expiry before a response arrives fails with a 500; expiry mid-stream aborts the relay
/// without one, since the client has already received a status and headers.
const OVERALL_TIMEOUT: Duration = Duration::from_secs(4 * 60);
/// Backoff between retries while the backend is warming up.
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

pub struct Dispatcher {
    pub port: u16,
    path_prefix: String,
    coordinator: Arc<Coordinator>,
    pool: Vec<Arc<OnDemandSupervisor>>,
    client: reqwest::Client,
    retry_backoff: Duration,
    overall_timeout: Duration,
}

#[derive(Debug, Error)]
enum ProxyError {
    #[error("no main backend configured")]
    NoMainBackend,
    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Upstream(#[from] reqwest::Error),
    #[error("request body is not valid UTF-8: {0}")]
    InvalidBody(std::str::Utf8Error),
}

/// Returns the first pool member whose regex anchored-matches `body`, else the unique main,
/// else `None` (no main configured).
fn select_backend(body: &str, pool: &[Arc<OnDemandSupervisor>]) -> Option<Arc<OnDemandSupervisor>> {
    pool.iter()
        .find(|s| !s.is_main() && s.matches(body))
        .or_else(|| pool.iter().find(|s| s.is_main()))
        .cloned()
}

impl Dispatcher {
    pub fn new(
        port: u16,
        path_prefix: String,
        coordinator: Arc<Coordinator>,
        pool: Vec<Arc<OnDemandSupervisor>>,
    ) -> Self {
        Self {
            port,
            path_prefix,
            coordinator,
            pool,
            client: reqwest::Client::new(),
            retry_backoff: RETRY_BACKOFF,
            overall_timeout: OVERALL_TIMEOUT,
        }
    }

    /// Overrides the retry/overall timing, for tests that can't afford to wait 4 minutes.
    pub fn with_timing(mut self, retry_backoff: Duration, overall_timeout: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self.overall_timeout = overall_timeout;
        self
    }

    pub async fn serve(self) -> std::io::Result<()> {
        let port = self.port;
        let state = web::Data::new(self);
        info!(port, "dispatcher listening");
        HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .app_data(web::PayloadConfig::new(usize::MAX))
                .default_service(web::route().to(handle))
        })
        .bind(("0.0.0.0", port))?
        .run()
        .await
    }
}

async fn handle(req: HttpRequest, body: Bytes, state: web::Data<Dispatcher>) -> HttpResponse {
    match req.path() {
        "/stopcoordinator" => {
            state.coordinator.stop_all(None).await;
            return ok_json();
        }
        "/startcoordinator" => {
            state.coordinator.resume_all().await;
            return ok_json();
        }
        path if path.starts_with(&state.path_prefix) => {}
        _ => return HttpResponse::NotFound().finish(),
    }

    let is_body_bearing_method = matches!(req.method(), &Method::POST | &Method::PUT | &Method::PATCH);
    let backend = if is_body_bearing_method {
        let body_str = match std::str::from_utf8(&body) {
            Ok(s) => s,
            Err(err) => return proxy_error_response(&ProxyError::InvalidBody(err)),
        };
        select_backend(body_str, &state.pool)
    } else {
        state.pool.iter().find(|s| s.is_main()).cloned()
    };

    let Some(backend) = backend else {
        error!("no main backend configured for this dispatcher");
        return proxy_error_response(&ProxyError::NoMainBackend);
    };

    state.coordinator.stop_all(Some(&backend)).await;
    backend.start().await;

    let url = format!("{}{}", backend.endpoint, req.uri());
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in req.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    let request = match state
        .client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .build()
    {
        Ok(request) => request,
        Err(err) => return proxy_error_response(&ProxyError::Upstream(err)),
    };

    // The whole proxy attempt — waiting for the backend to answer, then relaying its body — is
    // bounded by one deadline, not just the pre-response retry loop.
    let deadline = tokio::time::Instant::now() + state.overall_timeout;

    let upstream = match tokio::time::timeout_at(
        deadline,
        send_with_retry(&state.client, request, state.retry_backoff),
    )
    .await
    {
        Ok(response) => response,
        Err(_) => {
            state.coordinator.resume_all().await;
            return proxy_error_response(&ProxyError::Timeout(state.overall_timeout));
        }
    };

    let upstream = match upstream {
        Ok(resp) => resp,
        Err(err) => {
            state.coordinator.resume_all().await;
            return proxy_error_response(&ProxyError::Upstream(err));
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = HttpResponse::build(status);
    for (name, value) in upstream.headers() {
        if let Ok(trimmed) = value.to_str() {
            response.insert_header((name.as_str(), trimmed.trim_end()));
        }
    }

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        let mut upstream_body = upstream.bytes_stream();
        let mut client_gone = false;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("overall timeout reached mid-stream, aborting relay");
                    break;
                }
                chunk = upstream_body.next() => chunk,
            };
            match chunk {
                None => break,
                Some(Ok(bytes)) if !client_gone => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        warn!("client disconnected mid-stream, draining upstream without forwarding");
                        client_gone = true;
                    }
                }
                Some(Ok(_)) => {
                    // Client already gone: keep pulling from upstream so the backend's
                    // response is not abruptly cancelled, but stop trying to forward it.
                }
                Some(Err(err)) => {
                    let _ = tx.send(Err(std::io::Error::other(err))).await;
                    break;
                }
            }
        }
        drop(tx);
        coordinator.resume_all().await;
    });

    response.streaming(ReceiverStream::new(rx))
}

async fn send_with_retry(
    client: &reqwest::Client,
    request: reqwest::Request,
    backoff: Duration,
) -> Result<reqwest::Response, reqwest::Error> {
    loop {
        let attempt = request.try_clone().expect("proxy body is buffered and always cloneable");
        match client.execute(attempt).await {
            Ok(response) => return Ok(response),
            Err(err) => {
                warn!(%err, "upstream not ready, retrying");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn ok_json() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

fn proxy_error_response(err: &ProxyError) -> HttpResponse {
    HttpResponse::InternalServerError().body(format!("Error! {err}"))
}
