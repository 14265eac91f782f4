/*
 * Copyright 2026 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The admin HTTP endpoint: liveness, readiness and metrics.

use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed, Ordering::SeqCst},
    Arc,
};
use std::{net::SocketAddr, panic};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request, Response, StatusCode};

use crate::signal::{ShutdownRx, ShutdownTx};

type Body = Full<Bytes>;

type Check = Box<dyn Fn() -> bool + Send + Sync>;

/// Process health: a set of named liveness checks, plus a panic hook that
/// flips the process unhealthy and requests shutdown.
#[derive(Clone)]
pub struct Health {
    healthy: Arc<AtomicBool>,
    checks: Arc<parking_lot::RwLock<Vec<(&'static str, Check)>>>,
    shutdown_tx: ShutdownTx,
}

impl Health {
    pub fn new(shutdown_tx: ShutdownTx) -> Self {
        let health = Self {
            healthy: Arc::new(AtomicBool::new(true)),
            checks: Arc::default(),
            shutdown_tx,
        };

        let healthy = health.healthy.clone();
        let shutdown_tx = health.shutdown_tx.clone();
        let default_hook = panic::take_hook();
        panic::set_hook(Box::new(move |panic_info| {
            tracing::error!(%panic_info, "panic has occurred, moving to unhealthy");
            healthy.swap(false, Relaxed);
            let _ = shutdown_tx.send(());
            default_hook(panic_info);
        }));

        health
    }

    /// Registers a named check that must keep returning true for the
    /// process to report itself live.
    pub fn add_liveness_check(
        &self,
        name: &'static str,
        check: impl Fn() -> bool + Send + Sync + 'static,
    ) {
        self.checks.write().push((name, Box::new(check)));
    }

    /// Returns HTTP 200 with per-check results while everything is
    /// healthy, 503 otherwise.
    pub fn check_liveness(&self) -> Response<Body> {
        let mut results = serde_json::Map::new();
        let mut ok = self.healthy.load(Relaxed);
        if !ok {
            results.insert("panic".into(), "failed".into());
        }

        for (name, check) in self.checks.read().iter() {
            let passed = check();
            results.insert((*name).into(), if passed { "OK" } else { "failed" }.into());
            ok &= passed;
        }

        let body = serde_json::Value::Object(results).to_string();
        let status = if ok {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };

        Response::builder()
            .status(status)
            .header(
                "Content-Type",
                hyper::header::HeaderValue::from_static("application/json"),
            )
            .body(Body::new(Bytes::from(body)))
            .unwrap()
    }
}

/// Serves the admin endpoint until shutdown.
pub async fn server(
    address: SocketAddr,
    health: Health,
    ready: Arc<AtomicBool>,
    mut shutdown: ShutdownRx,
) -> crate::Result<()> {
    tracing::info!(%address, "starting admin endpoint");
    let listener = tokio::net::TcpListener::bind(address).await?;

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => return Ok(()),
        };

        let health = health.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            let stream = hyper_util::rt::TokioIo::new(stream);
            let svc = hyper::service::service_fn(move |req| {
                let health = health.clone();
                let ready = ready.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(handle_request(req, &health, &ready))
                }
            });

            if let Err(error) = hyper::server::conn::http1::Builder::new()
                .serve_connection(stream, svc)
                .await
            {
                tracing::warn!(%error, "failed to serve admin request");
            }
        });
    }
}

fn handle_request(
    request: Request<hyper::body::Incoming>,
    health: &Health,
    ready: &AtomicBool,
) -> Response<Body> {
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/metrics") => collect_metrics(),
        (&Method::GET, "/" | "/live" | "/livez") => health.check_liveness(),
        (&Method::GET, "/ready" | "/readyz") => check_readiness(ready),
        (_, _) => {
            let mut response = Response::new(Body::new(Bytes::new()));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

fn check_readiness(ready: &AtomicBool) -> Response<Body> {
    if ready.load(SeqCst) {
        return Response::new("ok".into());
    }

    let mut response = Response::new(Bytes::from_static(b"NOT READY").into());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

fn collect_metrics() -> Response<Body> {
    let mut response = Response::new(Body::new(Bytes::new()));
    let mut buffer = vec![];
    let encoder = prometheus::TextEncoder::new();
    let body =
        prometheus::Encoder::encode(&encoder, &crate::metrics::registry().gather(), &mut buffer)
            .map_err(|error| tracing::warn!(%error, "failed to encode metrics"))
            .and_then(|()| {
                String::from_utf8(buffer)
                    .map(Bytes::from)
                    .map_err(|error| tracing::warn!(%error, "failed to convert metrics to utf8"))
            });

    match body {
        Ok(body) => {
            *response.body_mut() = Body::new(body);
        }
        Err(()) => {
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_metrics_renders() {
        let response = super::collect_metrics();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn liveness_reflects_checks_and_panics() {
        let (shutdown_tx, _shutdown_rx) = crate::signal::channel();
        let health = Health::new(shutdown_tx);

        assert_eq!(health.check_liveness().status(), StatusCode::OK);

        let failing = Arc::new(AtomicBool::new(true));
        health.add_liveness_check("workerqueue", {
            let failing = failing.clone();
            move || failing.load(SeqCst)
        });
        assert_eq!(health.check_liveness().status(), StatusCode::OK);

        failing.store(false, SeqCst);
        assert_eq!(
            health.check_liveness().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        failing.store(true, SeqCst);
        assert_eq!(health.check_liveness().status(), StatusCode::OK);

        let _unused = std::panic::catch_unwind(|| {
            panic!("oh no!");
        });

        assert_eq!(
            health.check_liveness().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn readiness_flips_with_the_flag() {
        let ready = AtomicBool::new(false);
        assert_eq!(
            check_readiness(&ready).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        ready.store(true, SeqCst);
        assert_eq!(check_readiness(&ready).status(), StatusCode::OK);
    }
}
