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

//! Canonical report model shared across parsers, the enricher and the
//! sinks. Constructed once inside a parser and never mutated afterwards,
//! except for `Source` fields which the enricher fills in before dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Enriched information about the IP address a report (or record) was
/// attributed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub ip_address: String,
    #[serde(default = "Source::unknown")]
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_dns: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_domain: Option<String>,
    #[serde(default = "Source::unknown", rename = "type")]
    pub source_type: String,
}

impl Source {
    pub fn unknown() -> String {
        "Unknown".to_string()
    }

    pub fn new(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            country: Self::unknown(),
            reverse_dns: None,
            base_domain: None,
            source_type: Self::unknown(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    #[serde(rename = "r")]
    Relaxed,
    #[serde(rename = "s")]
    Strict,
}

impl Default for Alignment {
    fn default() -> Self {
        Alignment::Relaxed
    }
}

/// The published/evaluated DMARC disposition. Receivers occasionally
/// emit a token this build doesn't recognize (e.g. a future RFC
/// 7489bis value); those are preserved verbatim rather than coerced to
/// `none`, per spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Disposition {
    Known(KnownDisposition),
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnownDisposition {
    None,
    Quarantine,
    Reject,
}

impl Disposition {
    pub fn none() -> Self {
        Disposition::Known(KnownDisposition::None)
    }

    pub fn quarantine() -> Self {
        Disposition::Known(KnownDisposition::Quarantine)
    }

    pub fn reject() -> Self {
        Disposition::Known(KnownDisposition::Reject)
    }

    /// The wire-format token for this disposition, verbatim for unknown
    /// values.
    pub fn label(&self) -> &str {
        match self {
            Disposition::Known(KnownDisposition::None) => "none",
            Disposition::Known(KnownDisposition::Quarantine) => "quarantine",
            Disposition::Known(KnownDisposition::Reject) => "reject",
            Disposition::Other(raw) => raw,
        }
    }
}

/// Result string as published by the receiver for one authentication
/// mechanism (`pass`, `fail`, `neutral`, `temperror`, `permerror`, ...).
/// Receivers occasionally emit tokens RFC 7489 doesn't enumerate; those
/// are preserved verbatim rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Verdict(pub String);

impl Verdict {
    pub fn fail() -> Self {
        Verdict("fail".to_string())
    }

    pub fn none() -> Self {
        Verdict("none".to_string())
    }

    pub fn is_pass(&self) -> bool {
        self.0.eq_ignore_ascii_case("pass")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideReason {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvaluated {
    pub disposition: Disposition,
    #[serde(default = "Verdict::fail")]
    pub dkim: Verdict,
    #[serde(default = "Verdict::fail")]
    pub spf: Verdict,
    #[serde(default)]
    pub override_reasons: Vec<OverrideReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAlignment {
    pub spf_aligned: bool,
    pub dkim_aligned: bool,
    pub dmarc_aligned: bool,
}

impl RecordAlignment {
    pub fn derive(policy_evaluated: &PolicyEvaluated) -> Self {
        let spf_aligned = policy_evaluated.spf.is_pass();
        let dkim_aligned = policy_evaluated.dkim.is_pass();
        Self {
            spf_aligned,
            dkim_aligned,
            dmarc_aligned: spf_aligned || dkim_aligned,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifiers {
    pub header_from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DkimAuthResult {
    pub domain: String,
    #[serde(default = "DkimAuthResult::no_selector")]
    pub selector: String,
    #[serde(default = "Verdict::none")]
    pub result: Verdict,
}

impl DkimAuthResult {
    fn no_selector() -> String {
        "none".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpfAuthResult {
    pub domain: String,
    #[serde(default = "SpfAuthResult::default_scope")]
    pub scope: String,
    #[serde(default = "Verdict::none")]
    pub result: Verdict,
}

impl SpfAuthResult {
    fn default_scope() -> String {
        "mfrom".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResults {
    #[serde(default)]
    pub dkim: Vec<DkimAuthResult>,
    #[serde(default)]
    pub spf: Vec<SpfAuthResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub source: Source,
    pub count: u64,
    pub policy_evaluated: PolicyEvaluated,
    pub alignment: RecordAlignment,
    pub identifiers: Identifiers,
    pub auth_results: AuthResults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedPolicy {
    pub domain: String,
    pub adkim: Alignment,
    pub aspf: Alignment,
    pub p: Disposition,
    pub sp: Disposition,
    pub pct: u8,
    pub fo: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub org_name: String,
    pub org_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_contact: Option<String>,
    pub report_id: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub policy: PublishedPolicy,
    pub records: Vec<AggregateRecord>,
}

impl AggregateReport {
    /// Every `Source` across every record, for batched enrichment.
    pub fn sources_mut(&mut self) -> impl Iterator<Item = &mut Source> {
        self.records.iter_mut().map(|r| &mut r.source)
    }
}

/// Normalized `delivery_result` per spec: the first matching bucket wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryResult {
    Delivered,
    Spam,
    Policy,
    Reject,
    Other,
}

impl DeliveryResult {
    pub const ORDER: [(&'static str, DeliveryResult); 5] = [
        ("delivered", DeliveryResult::Delivered),
        ("spam", DeliveryResult::Spam),
        ("policy", DeliveryResult::Policy),
        ("reject", DeliveryResult::Reject),
        ("other", DeliveryResult::Other),
    ];

    pub fn classify(raw: &str) -> DeliveryResult {
        let lower = raw.to_ascii_lowercase();
        for (needle, result) in DeliveryResult::ORDER {
            if lower.contains(needle) {
                return result;
            }
        }
        DeliveryResult::Other
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForensicReport {
    #[serde(default = "ForensicReport::default_feedback_type")]
    pub feedback_type: String,
    pub arrival_date: DateTime<Utc>,
    pub subject: String,
    pub message_id: String,
    pub source: Source,
    pub reported_domain: String,
    #[serde(default = "ForensicReport::default_auth_failure")]
    pub auth_failure: Vec<String>,
    pub delivery_result: DeliveryResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_envelope_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_mail_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_rcpt_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dkim_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_results: Option<String>,
    #[serde(default)]
    pub authentication_mechanisms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<String>,
    #[serde(default)]
    pub sample_headers_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_sample: Option<serde_json::Value>,
}

impl ForensicReport {
    pub fn default_feedback_type() -> String {
        "auth-failure".to_string()
    }

    pub fn default_auth_failure() -> Vec<String> {
        vec!["dmarc".to_string()]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub result_type: String,
    pub failed_session_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sending_mta_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiving_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiving_mx_hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiving_mx_helo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsPolicy {
    pub policy_domain: String,
    pub policy_type: String,
    #[serde(default)]
    pub policy_strings: Vec<String>,
    #[serde(default)]
    pub mx_host_patterns: Vec<String>,
    pub successful_session_count: u64,
    pub failed_session_count: u64,
    #[serde(default)]
    pub failure_details: Vec<FailureDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmtpTlsReport {
    pub organization_name: String,
    pub report_id: String,
    pub begin_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_info: Option<String>,
    pub policies: Vec<TlsPolicy>,
}

/// The tagged variant the pipeline hands to the dispatcher. Deliberately
/// not a trait object / inheritance hierarchy: nothing non-trivial is
/// shared across the three dialects beyond `Source` and time fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "report_type", rename_all = "snake_case")]
pub enum Report {
    Aggregate(AggregateReport),
    Forensic(ForensicReport),
    SmtpTls(SmtpTlsReport),
}

impl Report {
    pub fn type_label(&self) -> &'static str {
        match self {
            Report::Aggregate(_) => "aggregate",
            Report::Forensic(_) => "forensic",
            Report::SmtpTls(_) => "smtp_tls",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_derives_from_either_pass() {
        let pe = PolicyEvaluated {
            disposition: Disposition::none(),
            dkim: Verdict::fail(),
            spf: Verdict("pass".to_string()),
            override_reasons: vec![],
        };
        let alignment = RecordAlignment::derive(&pe);
        assert!(!alignment.dkim_aligned);
        assert!(alignment.spf_aligned);
        assert!(alignment.dmarc_aligned);
    }

    #[test]
    fn alignment_false_when_both_fail() {
        let pe = PolicyEvaluated {
            disposition: Disposition::reject(),
            dkim: Verdict::fail(),
            spf: Verdict::fail(),
            override_reasons: vec![],
        };
        let alignment = RecordAlignment::derive(&pe);
        assert!(!alignment.dmarc_aligned);
    }

    #[rstest::rstest]
    #[case("Message was Delivered", DeliveryResult::Delivered)]
    #[case("marked as SPAM", DeliveryResult::Spam)]
    #[case("blocked by POLICY", DeliveryResult::Policy)]
    #[case("hard reject", DeliveryResult::Reject)]
    #[case("", DeliveryResult::Other)]
    #[case("no idea what happened", DeliveryResult::Other)]
    fn delivery_result_classifies_first_match(#[case] raw: &str, #[case] expected: DeliveryResult) {
        assert_eq!(DeliveryResult::classify(raw), expected);
    }

    #[test]
    fn disposition_preserves_unrecognized_token_verbatim() {
        let d: Disposition = serde_json::from_str("\"future_token\"").unwrap();
        assert_eq!(d.label(), "future_token");
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"future_token\"");
    }

    #[test]
    fn disposition_round_trips_known_tokens() {
        let d: Disposition = serde_json::from_str("\"quarantine\"").unwrap();
        assert_eq!(d, Disposition::quarantine());
        assert_eq!(d.label(), "quarantine");
    }
}
