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

//! The admission webhook endpoint. Controllers register review handlers by
//! path; the server narrows HTTP into review JSON and maps handler errors
//! into generic denials. TLS termination sits in front of this process.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Response, StatusCode};
use kube::core::admission::AdmissionResponse;

use crate::signal::ShutdownRx;

type Body = Full<Bytes>;

type Handler = Box<dyn Fn(serde_json::Value) -> crate::Result<serde_json::Value> + Send + Sync>;

/// Review handlers keyed by request path.
#[derive(Default)]
pub struct WebHook {
    handlers: HashMap<String, Handler>,
}

impl WebHook {
    pub fn add_handler(
        &mut self,
        path: impl Into<String>,
        handler: impl Fn(serde_json::Value) -> crate::Result<serde_json::Value>
            + Send
            + Sync
            + 'static,
    ) {
        self.handlers.insert(path.into(), Box::new(handler));
    }

    /// Serves review requests until shutdown.
    pub async fn run(self, address: SocketAddr, mut shutdown: ShutdownRx) -> crate::Result<()> {
        tracing::info!(%address, "starting admission webhook endpoint");
        let handlers = Arc::new(self.handlers);
        let listener = tokio::net::TcpListener::bind(address).await?;

        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => return Ok(()),
            };

            let handlers = handlers.clone();
            tokio::spawn(async move {
                let stream = hyper_util::rt::TokioIo::new(stream);
                let svc = hyper::service::service_fn(move |req| {
                    let handlers = handlers.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(handle_request(req, &handlers).await)
                    }
                });

                if let Err(error) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(stream, svc)
                    .await
                {
                    tracing::warn!(%error, "failed to serve admission request");
                }
            });
        }
    }
}

async fn handle_request(
    request: Request<hyper::body::Incoming>,
    handlers: &HashMap<String, Handler>,
) -> Response<Body> {
    if request.method() != Method::POST {
        return status_response(StatusCode::METHOD_NOT_ALLOWED);
    }
    let Some(handler) = handlers.get(request.uri().path()) else {
        return status_response(StatusCode::NOT_FOUND);
    };

    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(error) => {
            tracing::warn!(%error, "failed to read admission request body");
            return status_response(StatusCode::BAD_REQUEST);
        }
    };

    dispatch(handler, &body)
}

pub(crate) fn dispatch(handler: &Handler, body: &[u8]) -> Response<Body> {
    let review: serde_json::Value = match serde_json::from_slice(body) {
        Ok(review) => review,
        Err(error) => {
            tracing::warn!(%error, "undecodable admission review");
            return denial(&error.to_string());
        }
    };

    match handler(review) {
        Ok(response) => json_response(StatusCode::OK, &response),
        Err(error) => {
            tracing::warn!(error = format!("{error:?}"), "admission handler failed");
            denial(&error.to_string())
        }
    }
}

/// A generic denial for reviews the handler could not process.
fn denial(reason: &str) -> Response<Body> {
    let review = AdmissionResponse::invalid(reason).into_review();
    match serde_json::to_value(&review) {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(error) => {
            tracing::error!(%error, "failed to serialize denial response");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(
            "Content-Type",
            hyper::header::HeaderValue::from_static("application/json"),
        )
        .body(Body::new(Bytes::from(value.to_string())))
        .unwrap()
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
