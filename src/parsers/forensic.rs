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

//! Component D: RFC 5965 (ARF) forensic report -> [`ForensicReport`].
//!
//! The input is a whole email. MIME walking (via `mail-parser`) takes
//! precedence whenever any MIME structure is present at all; the
//! line-mode scanner is a pure fallback for non-MIME messages, per the
//! resolved open question in DESIGN.md.

use chrono::{DateTime, Utc};
use mail_parser::{Message, MessageParser, MimeHeaders};

use crate::error::ParseError;
use crate::model::{DeliveryResult, ForensicReport, Source};

pub fn parse(payload: &[u8]) -> Result<ForensicReport, ParseError> {
    let message = MessageParser::default()
        .parse(payload)
        .ok_or_else(|| ParseError::Email("mail-parser could not parse message".into()))?;

    let subject = message.subject().unwrap_or_default().to_string();
    let message_id = message.message_id().unwrap_or_default().to_string();
    let header_date = message
        .date()
        .and_then(|d| DateTime::parse_from_rfc2822(&d.to_rfc822()).ok())
        .map(|d| d.with_timezone(&Utc));

    let (feedback_block, sample) = extract_sections(&message, payload);
    if feedback_block.is_empty() {
        return Err(ParseError::NotThisDialect);
    }

    let fields = parse_feedback_block(&feedback_block);

    let arrival_date = fields
        .get("arrival-date")
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|d| d.with_timezone(&Utc))
        .or(header_date)
        .unwrap_or_else(Utc::now);

    let source_ip = fields
        .get("source-ip")
        .and_then(|v| v.split_whitespace().next())
        .unwrap_or_default()
        .to_string();

    let auth_failure: Vec<String> = fields
        .get("auth-failure")
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| vec!["dmarc".to_string()]);

    let authentication_mechanisms: Vec<String> = fields
        .get("identity-alignment")
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let reported_domain = fields
        .get("reported-domain")
        .cloned()
        .or_else(|| domain_from_sample(&sample))
        .unwrap_or_default();

    let delivery_result = DeliveryResult::classify(fields.get("delivery-result").map(|s| s.as_str()).unwrap_or(""));

    let sample_headers_only = !sample.to_ascii_lowercase().contains("\r\n\r\n")
        && !sample.contains("\n\n");

    Ok(ForensicReport {
        feedback_type: fields
            .get("feedback-type")
            .cloned()
            .unwrap_or_else(ForensicReport::default_feedback_type),
        arrival_date,
        subject,
        message_id,
        source: Source::new(source_ip),
        reported_domain,
        auth_failure,
        delivery_result,
        user_agent: fields.get("user-agent").cloned(),
        version: fields.get("version").cloned(),
        original_envelope_id: fields.get("original-envelope-id").cloned(),
        original_mail_from: fields.get("original-mail-from").cloned(),
        original_rcpt_to: fields.get("original-rcpt-to").cloned(),
        dkim_domain: fields.get("dkim-domain").cloned(),
        authentication_results: fields.get("authentication-results").cloned(),
        authentication_mechanisms,
        sample: if sample.is_empty() { None } else { Some(sample) },
        sample_headers_only,
        parsed_sample: None,
    })
}

/// Returns `(feedback_block, sample)` as raw text. Prefers the MIME
/// structure mail-parser exposes; falls back to a line-mode scan of the
/// raw bytes when the message has no meaningful MIME parts at all.
fn extract_sections(message: &Message, raw: &[u8]) -> (String, String) {
    let mut feedback_block = String::new();
    let mut sample = String::new();

    for part in message.parts.iter() {
        let ct = part
            .content_type()
            .map(|ct| format!("{}/{}", ct.ctype(), ct.subtype().unwrap_or_default()).to_ascii_lowercase())
            .unwrap_or_default();
        let text = String::from_utf8_lossy(part.contents()).to_string();

        if feedback_block.is_empty()
            && (ct == "message/feedback-report" || text.to_ascii_lowercase().contains("feedback-type:"))
        {
            feedback_block = text.clone();
        }
        if sample.is_empty()
            && (ct == "message/rfc822"
                || text.contains("Received:")
                || text.contains("Return-Path:"))
        {
            sample = text;
        }
    }

    if feedback_block.is_empty() && sample.is_empty() {
        return line_mode_scan(raw);
    }
    (feedback_block, sample)
}

fn line_mode_scan(raw: &[u8]) -> (String, String) {
    let text = String::from_utf8_lossy(raw);
    let lines: Vec<&str> = text.lines().collect();

    let feedback_start = lines.iter().position(|l| l.to_ascii_lowercase().starts_with("feedback-type:"));
    let sample_start = lines.iter().position(|l| {
        l.starts_with("The original message headers were:")
            || l.starts_with("Received:")
            || l.starts_with("Return-Path:")
    });

    let feedback_block = match (feedback_start, sample_start) {
        (Some(start), Some(end)) if end > start => lines[start..end].join("\n"),
        (Some(start), _) => lines[start..].join("\n"),
        _ => String::new(),
    };
    let sample = match sample_start {
        Some(start) => lines[start..].join("\n"),
        None => String::new(),
    };
    (feedback_block, sample)
}

/// One field per line, case-insensitive key, value = everything after
/// the first `:`, trimmed.
fn parse_feedback_block(block: &str) -> std::collections::HashMap<String, String> {
    let mut fields = std::collections::HashMap::new();
    for line in block.lines() {
        if let Some(idx) = line.find(':') {
            let key = line[..idx].trim().to_ascii_lowercase();
            let value = line[idx + 1..].trim().to_string();
            if !key.is_empty() && !fields.contains_key(&key) {
                fields.insert(key, value);
            }
        }
    }
    fields
}

/// Last resort when `Reported-Domain:` is absent: take the substring of
/// the sample's `From:` header after the last `@` up to `>`, space, or
/// end of value.
fn domain_from_sample(sample: &str) -> Option<String> {
    let from_line = sample
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("from:"))?;
    let value = from_line.splitn(2, ':').nth(1)?.trim();
    let after_at = value.rsplit_once('@')?.1;
    let end = after_at
        .find(|c: char| c == '>' || c == ' ')
        .unwrap_or(after_at.len());
    let domain = after_at[..end].trim();
    if domain.is_empty() {
        None
    } else {
        Some(domain.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARF_EMAIL: &str = "Subject: FW: dmarc report\r\n\
Message-ID: <abc123@example.com>\r\n\
Date: Mon, 2 Jan 2023 15:04:05 -0700\r\n\
Content-Type: multipart/report; report-type=feedback-report; boundary=\"b\"\r\n\
\r\n\
--b\r\n\
Content-Type: message/feedback-report\r\n\
\r\n\
Feedback-Type: auth-failure\r\n\
Source-IP: 10.0.0.5\r\n\
Reported-Domain: example.com\r\n\
Auth-Failure: dmarc,spf\r\n\
\r\n\
--b\r\n\
Content-Type: message/rfc822\r\n\
\r\n\
Received: from mail.example.com\r\n\
From: sender@attacker.example\r\n\
To: victim@example.com\r\n\
Subject: phish\r\n\
\r\n\
body\r\n\
--b--\r\n";

    #[test]
    fn parses_mime_arf_email() {
        let report = parse(ARF_EMAIL.as_bytes()).unwrap();
        assert_eq!(report.feedback_type, "auth-failure");
        assert_eq!(report.source.ip_address, "10.0.0.5");
        assert_eq!(report.reported_domain, "example.com");
        assert_eq!(report.auth_failure, vec!["dmarc", "spf"]);
        assert_eq!(report.delivery_result, DeliveryResult::Other);
    }

    #[test]
    fn falls_back_to_sample_from_domain_when_missing() {
        let email = ARF_EMAIL.replace("Reported-Domain: example.com\r\n", "");
        let report = parse(email.as_bytes()).unwrap();
        assert_eq!(report.reported_domain, "attacker.example");
    }
}
