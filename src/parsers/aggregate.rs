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

//! Component C: RFC 7489 aggregate report XML -> [`AggregateReport`].
//!
//! Wire types mirror the XML schema closely (as the teacher's own
//! `reports/dmarc.rs` does with `quick_xml`/`serde`); `from_wire`
//! applies every default and normalization documented in spec §3/§4.C
//! and is the only place the 48h date-range invariant is enforced.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::ParseError;
use crate::model::{
    AggregateRecord, AggregateReport, Alignment, AuthResults, DkimAuthResult, Disposition,
    Identifiers, OverrideReason, PolicyEvaluated, PublishedPolicy, RecordAlignment, Source,
    SpfAuthResult, Verdict,
};

/// RFC 7489's 24h typical reporting period, doubled to the grace factor
/// this build treats as authoritative (spec §3, resolved in DESIGN.md).
const MAX_SPAN_SECS: i64 = 48 * 3600;

#[derive(Debug, Deserialize)]
#[serde(rename = "feedback")]
struct WireFeedback {
    report_metadata: WireMetadata,
    policy_published: WirePolicyPublished,
    #[serde(default, rename = "record")]
    records: Vec<WireRecord>,
}

#[derive(Debug, Deserialize)]
struct WireMetadata {
    org_name: String,
    email: String,
    #[serde(default)]
    extra_contact_info: Option<String>,
    report_id: String,
    date_range: WireDateRange,
    #[serde(default, rename = "error")]
    errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireDateRange {
    begin: i64,
    end: i64,
}

#[derive(Debug, Deserialize)]
struct WirePolicyPublished {
    domain: String,
    #[serde(default)]
    adkim: Option<String>,
    #[serde(default)]
    aspf: Option<String>,
    p: String,
    #[serde(default)]
    sp: Option<String>,
    #[serde(default)]
    pct: Option<u8>,
    #[serde(default)]
    fo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    row: WireRow,
    identifiers: WireIdentifiers,
    #[serde(default)]
    auth_results: WireAuthResults,
}

#[derive(Debug, Deserialize)]
struct WireRow {
    source_ip: String,
    count: u64,
    policy_evaluated: WirePolicyEvaluated,
}

#[derive(Debug, Default, Deserialize)]
struct WirePolicyEvaluated {
    #[serde(default)]
    disposition: Option<String>,
    #[serde(default)]
    dkim: Option<String>,
    #[serde(default)]
    spf: Option<String>,
    #[serde(default, rename = "reason")]
    reasons: Vec<WireOverrideReason>,
}

#[derive(Debug, Deserialize)]
struct WireOverrideReason {
    #[serde(default, rename = "type")]
    reason_type: Option<String>,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireIdentifiers {
    #[serde(default)]
    envelope_from: Option<String>,
    #[serde(default)]
    envelope_to: Option<String>,
    header_from: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireAuthResults {
    #[serde(default, rename = "dkim")]
    dkim: Vec<WireDkim>,
    #[serde(default, rename = "spf")]
    spf: Vec<WireSpf>,
}

#[derive(Debug, Deserialize)]
struct WireDkim {
    #[serde(default)]
    domain: String,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireSpf {
    #[serde(default)]
    domain: String,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    result: Option<String>,
}

pub fn parse(payload: &[u8]) -> Result<AggregateReport, ParseError> {
    let text = std::str::from_utf8(payload).map_err(|e| ParseError::Xml(e.to_string()))?;
    let wire: WireFeedback = quick_xml::de::from_str(text).map_err(|e| ParseError::Xml(e.to_string()))?;
    from_wire(wire)
}

fn from_wire(wire: WireFeedback) -> Result<AggregateReport, ParseError> {
    let begin = unix_seconds(wire.report_metadata.date_range.begin)?;
    let end = unix_seconds(wire.report_metadata.date_range.end)?;
    if end < begin || (end - begin).num_seconds() > MAX_SPAN_SECS {
        return Err(ParseError::DateRange {
            begin: begin.to_rfc3339(),
            end: end.to_rfc3339(),
        });
    }

    let policy = PublishedPolicy {
        domain: wire.policy_published.domain,
        adkim: parse_alignment(wire.policy_published.adkim),
        aspf: parse_alignment(wire.policy_published.aspf),
        p: parse_disposition(&wire.policy_published.p),
        sp: wire
            .policy_published
            .sp
            .map(|s| parse_disposition(&s))
            .unwrap_or_else(|| parse_disposition(&wire.policy_published.p)),
        pct: wire.policy_published.pct.unwrap_or(100),
        fo: wire.policy_published.fo.unwrap_or_else(|| "0".to_string()),
    };

    let records = wire.records.into_iter().map(from_wire_record).collect();

    Ok(AggregateReport {
        org_name: wire.report_metadata.org_name,
        org_email: wire.report_metadata.email,
        extra_contact: wire.report_metadata.extra_contact_info,
        report_id: wire.report_metadata.report_id,
        begin,
        end,
        errors: wire.report_metadata.errors,
        policy,
        records,
    })
}

fn from_wire_record(record: WireRecord) -> AggregateRecord {
    let policy_evaluated = PolicyEvaluated {
        disposition: parse_disposition(record.row.policy_evaluated.disposition.as_deref().unwrap_or("none")),
        dkim: verdict_or_default(record.row.policy_evaluated.dkim, Verdict::fail),
        spf: verdict_or_default(record.row.policy_evaluated.spf, Verdict::fail),
        override_reasons: record
            .row
            .policy_evaluated
            .reasons
            .into_iter()
            .map(|r| OverrideReason {
                r#type: r.reason_type,
                comment: r.comment,
            })
            .collect(),
    };
    let alignment = RecordAlignment::derive(&policy_evaluated);

    let dkim = record
        .auth_results
        .dkim
        .into_iter()
        .filter(|d| !d.domain.trim().is_empty())
        .map(|d| DkimAuthResult {
            domain: crate::parsers::lowercase(&d.domain),
            selector: d.selector.unwrap_or_else(|| "none".to_string()),
            result: verdict_or_default(d.result, Verdict::none),
        })
        .collect();
    let spf = record
        .auth_results
        .spf
        .into_iter()
        .filter(|s| !s.domain.trim().is_empty())
        .map(|s| SpfAuthResult {
            domain: crate::parsers::lowercase(&s.domain),
            scope: s.scope.unwrap_or_else(|| "mfrom".to_string()),
            result: verdict_or_default(s.result, Verdict::none),
        })
        .collect();

    AggregateRecord {
        source: Source::new(record.row.source_ip),
        count: record.row.count.max(1),
        policy_evaluated,
        alignment,
        identifiers: Identifiers {
            header_from: crate::parsers::lowercase(&record.identifiers.header_from),
            envelope_from: record.identifiers.envelope_from.map(|s| crate::parsers::lowercase(&s)),
            envelope_to: record.identifiers.envelope_to.map(|s| crate::parsers::lowercase(&s)),
        },
        auth_results: AuthResults { dkim, spf },
    }
}

fn verdict_or_default(raw: Option<String>, default: fn() -> Verdict) -> Verdict {
    match raw {
        Some(s) if !s.trim().is_empty() => Verdict(s),
        _ => default(),
    }
}

fn parse_alignment(raw: Option<String>) -> Alignment {
    match raw.as_deref() {
        Some("s") => Alignment::Strict,
        _ => Alignment::Relaxed,
    }
}

fn parse_disposition(raw: &str) -> Disposition {
    match raw {
        "" | "none" => Disposition::none(),
        "quarantine" => Disposition::quarantine(),
        "reject" => Disposition::reject(),
        other => Disposition::Other(other.to_string()),
    }
}

fn unix_seconds(secs: i64) -> Result<DateTime<Utc>, ParseError> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| ParseError::BadDate(secs.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAHOO_XML: &str = r#"<?xml version="1.0"?>
        <feedback>
            <report_metadata>
                <org_name>Example Corp</org_name>
                <email>noreply@example.com</email>
                <report_id>test123</report_id>
                <date_range>
                    <begin>1538204542</begin>
                    <end>1538290000</end>
                </date_range>
            </report_metadata>
            <policy_published>
                <domain>example.com</domain>
                <adkim>r</adkim>
                <aspf>r</aspf>
                <p>reject</p>
                <pct>100</pct>
            </policy_published>
            <record>
                <row>
                    <source_ip>192.168.1.1</source_ip>
                    <count>1</count>
                    <policy_evaluated>
                        <disposition>none</disposition>
                        <dkim>pass</dkim>
                        <spf>pass</spf>
                    </policy_evaluated>
                </row>
                <identifiers>
                    <header_from>EXAMPLE.COM</header_from>
                </identifiers>
                <auth_results>
                    <dkim>
                        <domain>example.com</domain>
                        <selector>default</selector>
                        <result>pass</result>
                    </dkim>
                    <spf>
                        <domain>example.com</domain>
                        <result>pass</result>
                    </spf>
                </auth_results>
            </record>
        </feedback>"#;

    #[test]
    fn parses_scenario_1_positive_form() {
        let report = parse(YAHOO_XML.as_bytes()).unwrap();
        assert_eq!(report.org_name, "Example Corp");
        assert_eq!(report.report_id, "test123");
        assert_eq!(report.begin.to_rfc3339(), "2018-09-29T07:02:22+00:00");
        assert_eq!(report.records.len(), 1);
        let record = &report.records[0];
        assert!(record.alignment.dmarc_aligned);
        assert_eq!(record.identifiers.header_from, "example.com");
    }

    #[test]
    fn rejects_span_over_48h() {
        let xml = YAHOO_XML.replace("1538290000", "1538290942");
        let err = parse(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::DateRange { .. }));
    }

    #[test]
    fn drops_auth_result_entries_with_empty_domain() {
        let xml = YAHOO_XML.replace(
            "<dkim>\n                        <domain>example.com</domain>",
            "<dkim>\n                        <domain></domain>",
        );
        let report = parse(xml.as_bytes()).unwrap();
        assert!(report.records[0].auth_results.dkim.is_empty());
    }

    #[test]
    fn preserves_unrecognized_disposition_verbatim() {
        let xml = YAHOO_XML.replace("<disposition>none</disposition>", "<disposition>quarantine_lite</disposition>");
        let report = parse(xml.as_bytes()).unwrap();
        assert_eq!(report.records[0].policy_evaluated.disposition.label(), "quarantine_lite");
    }
}
