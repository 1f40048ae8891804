/**
 * dmarc-herald - ingest, decode, normalize and forward email-authentication reports
 * Copyright (C) 2025 nerou GmbH
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Component I: HTTP intake. Middleware stack (outer to inner): request
//! logging, panic recovery, per-IP token-bucket rate limit, request-size
//! cap, metrics. Storage failures are the only pipeline error that
//! surfaces as a 5xx; everything else about sink delivery is invisible
//! to the caller (spec §4.H/§7).

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;

use actix_web::dev::Service;
use actix_web::http::header::{self, HeaderValue};
use actix_web::web::{resource, Data, Payload};
use actix_web::{guard, middleware::Logger, App, HttpRequest, HttpResponse, HttpServer};
use futures_util::future::FutureExt;
use futures_util::StreamExt;
use governor::{Quota, RateLimiter};
use log::{error, warn};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::HttpConfig;
use crate::metrics;
use crate::pipeline::Pipeline;

type IpRateLimiter = RateLimiter<IpAddr, governor::state::keyed::DefaultKeyedStateStore<IpAddr>, governor::clock::DefaultClock>;

const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/xml",
    "text/xml",
    "application/json",
    "application/zip",
    "application/gzip",
    "application/octet-stream",
    "application/tlsrpt+json",
    "application/tlsrpt+gzip",
    "multipart/form-data",
    "message/rfc822",
];

struct AppState {
    pipeline: Arc<Pipeline>,
    limiter: Arc<IpRateLimiter>,
    max_upload_size: usize,
}

pub async fn serve(cfg: HttpConfig, pipeline: Arc<Pipeline>, shutdown: CancellationToken) -> std::io::Result<()> {
    let prometheus_handle = metrics::install();
    let quota = Quota::per_minute(NonZeroU32::new(cfg.rate_limit.rate_per_minute.max(1)).unwrap())
        .allow_burst(NonZeroU32::new(cfg.rate_limit.burst.max(1)).unwrap());
    let limiter = Arc::new(RateLimiter::keyed(quota));
    let state = Data::new(AppState { pipeline, limiter: limiter.clone(), max_upload_size: cfg.max_upload_size });
    let prometheus_handle = Data::new(prometheus_handle);

    let eviction_interval = cfg.rate_limit.idle_eviction();
    let eviction_limiter = limiter.clone();
    let eviction_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(eviction_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => eviction_limiter.retain_recent(),
                _ = eviction_shutdown.cancelled() => break,
            }
        }
    });

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(prometheus_handle.clone())
            .wrap(Logger::default())
            .wrap_fn(|req, srv| {
                let start = Instant::now();
                let method = req.method().to_string();
                let path = req.path().to_string();
                metrics::http_active_connections(1);
                let fut = std::panic::AssertUnwindSafe(srv.call(req)).catch_unwind();
                async move {
                    let result = fut.await;
                    metrics::http_active_connections(-1);
                    match result {
                        Ok(Ok(resp)) => {
                            metrics::http_request(&method, &path, resp.status().as_u16());
                            metrics::http_request_duration(&method, &path, start.elapsed().as_secs_f64());
                            Ok(resp)
                        }
                        Ok(Err(err)) => Err(err),
                        Err(panic) => {
                            error!("request handler panicked: {:?}", panic_message(&panic));
                            metrics::http_request(&method, &path, 500);
                            Err(actix_web::error::ErrorInternalServerError("internal error"))
                        }
                    }
                }
            })
            .service(resource("/").route(actix_web::web::get().to(root)))
            .service(resource("/health").route(actix_web::web::get().to(health)))
            .service(resource("/metrics").route(actix_web::web::get().to(metrics_endpoint)))
            .service(
                resource("/dmarc/report")
                    .guard(guard::Any(guard::Post()).or(guard::Put()))
                    .to(intake),
            )
    })
    .shutdown_timeout(30);

    let bound = if cfg.tls.enable {
        let cert = cfg.tls.cert.clone().expect("validated at startup");
        let key = cfg.tls.key.clone().expect("validated at startup");
        let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        builder
            .set_private_key_file(key, SslFiletype::PEM)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        builder
            .set_certificate_chain_file(cert)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        server.bind_openssl((cfg.listen.as_str(), cfg.port), builder)?
    } else {
        server.bind((cfg.listen.as_str(), cfg.port))?
    };

    let running = bound.run();
    let handle = running.handle();
    let shutdown_task = tokio::spawn(async move {
        shutdown.cancelled().await;
        handle.stop(true).await;
    });
    let result = running.await;
    shutdown_task.abort();
    result
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic.downcast_ref::<&str>().copied().or_else(|| panic.downcast_ref::<String>().map(String::as_str)).unwrap_or("unknown panic")
}

async fn root() -> HttpResponse {
    HttpResponse::Ok().json(json!({"name": clap::crate_name!(), "version": clap::crate_version!()}))
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({"status": "ok"}))
}

async fn metrics_endpoint(handle: Data<metrics_exporter_prometheus::PrometheusHandle>) -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(handle.render())
}

async fn intake(req: HttpRequest, payload: Payload, state: Data<AppState>) -> HttpResponse {
    let peer_ip = req.peer_addr().map(|a| a.ip()).unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));
    if state.limiter.check_key(&peer_ip).is_err() {
        return HttpResponse::TooManyRequests()
            .insert_header((header::RETRY_AFTER, HeaderValue::from_static("60")))
            .json(json!({"error": "rate limit exceeded"}));
    }

    let content_type = req.content_type().to_ascii_lowercase();
    if !is_allowed_content_type(&content_type) {
        return HttpResponse::BadRequest().json(json!({"error": "unsupported content type", "details": content_type}));
    }

    let body = match collect_body(payload, state.max_upload_size).await {
        Ok(bytes) => bytes,
        Err(resp) => return resp,
    };

    match state.pipeline.process(&body, "http").await {
        Ok(()) => HttpResponse::Ok().json(json!({"message": "report accepted"})),
        Err(err) if err.is_storage() => {
            HttpResponse::InternalServerError().json(json!({"error": "storage failure", "details": err.message}))
        }
        Err(err) => {
            warn!("http intake rejected payload: {err}");
            HttpResponse::BadRequest().json(json!({"error": "could not parse report", "details": err.message}))
        }
    }
}

/// Reads `payload` into memory, aborting with a 413 before exceeding
/// `max_upload_size` -- bodies never reach the pipeline once capped.
async fn collect_body(mut payload: Payload, max_upload_size: usize) -> Result<actix_web::web::Bytes, HttpResponse> {
    let mut buf = actix_web::web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|err| HttpResponse::BadRequest().json(json!({"error": "invalid body", "details": err.to_string()})))?;
        if buf.len() + chunk.len() > max_upload_size {
            return Err(HttpResponse::PayloadTooLarge().json(json!({"error": "upload exceeds maximum size"})));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn is_allowed_content_type(content_type: &str) -> bool {
    ALLOWED_CONTENT_TYPES.iter().any(|allowed| content_type.starts_with(allowed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn allow_list_accepts_documented_content_types() {
        assert!(is_allowed_content_type("application/xml"));
        assert!(is_allowed_content_type("application/tlsrpt+gzip"));
        assert!(is_allowed_content_type("multipart/form-data; boundary=xyz"));
    }

    #[test]
    fn allow_list_rejects_unlisted_content_types() {
        assert!(!is_allowed_content_type("text/html"));
        assert!(!is_allowed_content_type("application/pdf"));
    }

    #[actix_web::test]
    async fn collect_body_passes_through_under_the_cap() {
        let (_req, payload) = TestRequest::post().set_payload(vec![b'a'; 100]).to_http_parts();
        let body = collect_body(payload, 200).await.unwrap();
        assert_eq!(body.len(), 100);
    }

    #[actix_web::test]
    async fn collect_body_rejects_over_the_cap() {
        let (_req, payload) = TestRequest::post().set_payload(vec![b'a'; 200]).to_http_parts();
        let resp = collect_body(payload, 100).await.unwrap_err();
        assert_eq!(resp.status(), actix_web::http::StatusCode::PAYLOAD_TOO_LARGE);
    }
}
