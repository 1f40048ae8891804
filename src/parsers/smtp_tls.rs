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

//! Component E: RFC 8460 SMTP-TLS report JSON -> [`SmtpTlsReport`].
//! Two entry paths: the payload is the JSON document directly, or a
//! MIME message wrapping it (optionally gzip/base64 encoded).

use std::io::Read;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use mail_parser::{MessageParser, MimeHeaders};
use serde::Deserialize;

use crate::error::ParseError;
use crate::model::{FailureDetail, SmtpTlsReport, TlsPolicy};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WireReport {
    organization_name: String,
    report_id: String,
    date_range: WireDateRange,
    #[serde(default)]
    contact_info: Option<String>,
    #[serde(default)]
    policies: Vec<WirePolicyEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WireDateRange {
    start_datetime: String,
    end_datetime: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WirePolicyEntry {
    policy: WirePolicy,
    summary: WireSummary,
    #[serde(default)]
    failure_details: Vec<WireFailureDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WirePolicy {
    policy_type: String,
    policy_domain: String,
    #[serde(default)]
    policy_string: Vec<String>,
    #[serde(default)]
    mx_host: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WireSummary {
    total_successful_session_count: i64,
    total_failure_session_count: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WireFailureDetail {
    result_type: String,
    failed_session_count: i64,
    #[serde(default)]
    sending_mta_ip: Option<String>,
    #[serde(default)]
    receiving_ip: Option<String>,
    #[serde(default)]
    receiving_mx_hostname: Option<String>,
    #[serde(default)]
    receiving_mx_helo: Option<String>,
    #[serde(default)]
    additional_information: Option<String>,
    #[serde(default)]
    failure_reason_code: Option<String>,
}

pub fn parse(payload: &[u8]) -> Result<SmtpTlsReport, ParseError> {
    let json_bytes = extract_json(payload)?;
    let text = std::str::from_utf8(&json_bytes).map_err(|e| ParseError::Json(e.to_string()))?;
    let wire: WireReport = serde_json::from_str(text).map_err(|e| ParseError::Json(e.to_string()))?;
    from_wire(wire)
}

/// Returns the raw JSON bytes whether the payload is the document
/// itself or a MIME message wrapping it.
fn extract_json(payload: &[u8]) -> Result<Vec<u8>, ParseError> {
    let trimmed_start = payload.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(0);
    if payload.get(trimmed_start) == Some(&b'{') {
        return Ok(payload.to_vec());
    }

    let message = MessageParser::default()
        .parse(payload)
        .ok_or_else(|| ParseError::NotThisDialect)?;

    for part in message.parts.iter() {
        let ct = part
            .content_type()
            .map(|ct| format!("{}/{}", ct.ctype(), ct.subtype().unwrap_or_default()).to_ascii_lowercase())
            .unwrap_or_default();
        let is_gzip = ct.contains("gzip")
            || part.attachment_name().map(|n| n.ends_with(".gz")).unwrap_or(false);

        let mut body = part.contents().to_vec();
        if is_gzip {
            let mut decoder = GzDecoder::new(body.as_slice());
            let mut decompressed = Vec::new();
            if decoder.read_to_end(&mut decompressed).is_ok() {
                body = decompressed;
            }
        }

        let body_text = String::from_utf8_lossy(&body);
        if ct.contains("tlsrpt")
            || body_text.contains("\"organization-name\"")
            || body_text.contains("\"report-id\"")
        {
            return Ok(body);
        }
    }

    Err(ParseError::NotThisDialect)
}

fn from_wire(wire: WireReport) -> Result<SmtpTlsReport, ParseError> {
    let begin_date = parse_rfc3339(&wire.date_range.start_datetime)?;
    let end_date = parse_rfc3339(&wire.date_range.end_datetime)?;

    let policies = wire
        .policies
        .into_iter()
        .map(|entry| {
            let successful = non_negative(entry.summary.total_successful_session_count)?;
            let failed = non_negative(entry.summary.total_failure_session_count)?;
            let failure_details = entry
                .failure_details
                .into_iter()
                .map(|d| {
                    Ok(FailureDetail {
                        result_type: d.result_type,
                        failed_session_count: non_negative(d.failed_session_count)?,
                        sending_mta_ip: d.sending_mta_ip,
                        receiving_ip: d.receiving_ip,
                        receiving_mx_hostname: d.receiving_mx_hostname,
                        receiving_mx_helo: d.receiving_mx_helo,
                        additional_info_uri: d.additional_information,
                        failure_reason_code: d.failure_reason_code,
                    })
                })
                .collect::<Result<Vec<_>, ParseError>>()?;

            Ok(TlsPolicy {
                policy_domain: entry.policy.policy_domain,
                policy_type: entry.policy.policy_type,
                policy_strings: entry.policy.policy_string,
                mx_host_patterns: entry.policy.mx_host,
                successful_session_count: successful,
                failed_session_count: failed,
                failure_details,
            })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;

    Ok(SmtpTlsReport {
        organization_name: wire.organization_name,
        report_id: wire.report_id,
        begin_date,
        end_date,
        contact_info: wire.contact_info,
        policies,
    })
}

fn non_negative(n: i64) -> Result<u64, ParseError> {
    u64::try_from(n).map_err(|_| ParseError::BadCounts(n.to_string()))
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| ParseError::BadDate(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC8460_JSON: &str = r#"{
        "organization-name": "O",
        "report-id": "r1",
        "date-range": {
            "start-datetime": "2024-01-01T00:00:00Z",
            "end-datetime": "2024-01-02T00:00:00Z"
        },
        "contact-info": "c",
        "policies": [
            {
                "policy": {"policy-type": "tlsa", "policy-domain": "d"},
                "summary": {"total-successful-session-count": 10, "total-failure-session-count": 2}
            }
        ]
    }"#;

    #[test]
    fn parses_direct_json() {
        let report = parse(RFC8460_JSON.as_bytes()).unwrap();
        assert_eq!(report.report_id, "r1");
        assert_eq!(report.policies.len(), 1);
        assert_eq!(report.policies[0].successful_session_count, 10);
        assert_eq!(report.policies[0].failed_session_count, 2);
    }

    #[test]
    fn rejects_negative_counts() {
        let json = RFC8460_JSON.replace("\"total-failure-session-count\": 2", "\"total-failure-session-count\": -2");
        let err = parse(json.as_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::BadCounts(_)));
    }
}
