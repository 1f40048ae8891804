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

//! Component B: classify a decoded payload as aggregate / forensic /
//! smtp-tls / unknown by sniffing content, never by transport metadata.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Aggregate,
    Forensic,
    SmtpTls,
    Unknown,
}

pub fn sniff(payload: &[u8]) -> Verdict {
    let head = &payload[..payload.len().min(8192)];
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start();

    if trimmed.starts_with("<?xml") || text.contains("<feedback>") || text.contains("<report_metadata>") {
        return Verdict::Aggregate;
    }
    if text
        .to_ascii_lowercase()
        .lines()
        .any(|l| l.trim_start().to_ascii_lowercase().starts_with("feedback-type:"))
    {
        return Verdict::Forensic;
    }
    if looks_like_tlsrpt_json(&text) {
        return Verdict::SmtpTls;
    }
    Verdict::Unknown
}

fn looks_like_tlsrpt_json(text: &str) -> bool {
    let trimmed = text.trim_start();
    if !trimmed.starts_with('{') {
        return false;
    }
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(map)) => {
            map.contains_key("organization-name") || map.contains_key("report-id")
        }
        // payload may be truncated at the 8KiB sniff window; fall back to
        // a substring check so large reports still classify correctly.
        _ => text.contains("\"organization-name\"") || text.contains("\"report-id\""),
    }
}

/// Cheap heuristic used by the envelope decoder (4.A) while walking MIME
/// parts: does this candidate body look worth recursing into? Broader
/// than [`sniff`] on purpose — it only needs to rule out obviously inert
/// parts (plain-text preambles, HTML alternatives), not classify.
pub fn looks_report_bearing(body: &[u8]) -> bool {
    if body.starts_with(b"PK\x03\x04") || (body.len() >= 2 && body[0] == 0x1F && body[1] == 0x8B) {
        return true;
    }
    !matches!(sniff(body), Verdict::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_aggregate_xml() {
        let xml = b"<?xml version=\"1.0\"?><feedback><report_metadata></report_metadata></feedback>";
        assert_eq!(sniff(xml), Verdict::Aggregate);
    }

    #[test]
    fn sniffs_forensic_by_header_token() {
        let email = b"Subject: test\r\nFeedback-Type: auth-failure\r\n\r\nbody";
        assert_eq!(sniff(email), Verdict::Forensic);
    }

    #[test]
    fn sniffs_smtp_tls_json() {
        let json = br#"{"organization-name":"O","report-id":"r1"}"#;
        assert_eq!(sniff(json), Verdict::SmtpTls);
    }

    #[test]
    fn unknown_payload_falls_through() {
        assert_eq!(sniff(b"not a report"), Verdict::Unknown);
    }

    #[test]
    fn idempotent_on_already_decoded_payload() {
        let xml = b"<?xml version=\"1.0\"?><feedback></feedback>";
        assert_eq!(sniff(xml), sniff(&crate::envelope::decode(xml).unwrap()));
    }
}
