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

//! Thin wrappers around the `metrics` facade so call sites read like the
//! series names in spec.md §6 instead of re-typing label sets everywhere.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn install() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

pub fn http_request(method: &str, endpoint: &str, status: u16) {
    counter!("http_requests_total", "method" => method.to_string(), "endpoint" => endpoint.to_string(), "status" => status.to_string()).increment(1);
}

pub fn http_request_duration(method: &str, endpoint: &str, seconds: f64) {
    histogram!("http_request_duration_seconds", "method" => method.to_string(), "endpoint" => endpoint.to_string()).record(seconds);
}

pub fn http_active_connections(delta: i64) {
    let g = gauge!("http_active_connections");
    if delta >= 0 {
        g.increment(delta as f64);
    } else {
        g.decrement((-delta) as f64);
    }
}

pub fn report_size(bytes: u64) {
    histogram!("report_size_bytes").record(bytes as f64);
}

pub fn reports_processed(report_type: &str) {
    counter!("reports_processed_total", "type" => report_type.to_string()).increment(1);
}

pub fn reports_failed(report_type: &str, reason: &str) {
    counter!("reports_failed_total", "type" => report_type.to_string(), "reason" => reason.to_string()).increment(1);
}

pub fn parser_report(report_type: &str, source: &str) {
    counter!("parser_reports_total", "type" => report_type.to_string(), "source" => source.to_string()).increment(1);
}

pub fn parser_failure(report_type: &str, source: &str, reason: &str) {
    counter!("parser_failures_total", "type" => report_type.to_string(), "source" => source.to_string(), "reason" => reason.to_string()).increment(1);
}

pub fn parser_duration(report_type: &str, source: &str, seconds: f64) {
    histogram!("parser_duration_seconds", "type" => report_type.to_string(), "source" => source.to_string()).record(seconds);
}

pub fn sink_failure(sink: &str) {
    counter!("sink_failures_total", "sink" => sink.to_string()).increment(1);
}
