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

//! Component A: unwrap compression and MIME structure to yield a
//! classifiable payload. Detection is by magic bytes, never file
//! extension or declared content type alone.

use std::io::{Cursor, Read};

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::GzDecoder;
use log::trace;
use mail_parser::{MessageParser, MimeHeaders};
use zip::ZipArchive;

use crate::error::EnvelopeError;

const MAX_DEPTH: u8 = 4;

/// Unwraps `raw` into a single candidate payload, recursing through
/// compression and MIME layers up to [`MAX_DEPTH`] times.
pub fn decode(raw: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    decode_at(raw, 0)
}

fn decode_at(raw: &[u8], depth: u8) -> Result<Vec<u8>, EnvelopeError> {
    if depth >= MAX_DEPTH {
        return Err(EnvelopeError::UnwrapDepth);
    }

    if let Some(unwrapped) = unwrap_zip(raw)? {
        return decode_at(&unwrapped, depth + 1);
    }
    if let Some(unwrapped) = unwrap_gzip(raw)? {
        return decode_at(&unwrapped, depth + 1);
    }
    if looks_like_mime(raw) {
        return unwrap_mime(raw, depth);
    }
    Ok(raw.to_vec())
}

fn unwrap_zip(raw: &[u8]) -> Result<Option<Vec<u8>>, EnvelopeError> {
    if !raw.starts_with(b"PK\x03\x04") {
        return Ok(None);
    }
    let reader = Cursor::new(raw);
    let mut archive =
        ZipArchive::new(reader).map_err(|err| EnvelopeError::Decode(err.to_string()))?;
    if archive.is_empty() {
        return Err(EnvelopeError::EmptyContainer);
    }
    let mut entry = archive
        .by_index(0)
        .map_err(|err| EnvelopeError::Decode(err.to_string()))?;
    let mut buf = Vec::new();
    entry
        .read_to_end(&mut buf)
        .map_err(|err| EnvelopeError::Decode(err.to_string()))?;
    Ok(Some(buf))
}

fn unwrap_gzip(raw: &[u8]) -> Result<Option<Vec<u8>>, EnvelopeError> {
    if raw.len() < 2 || raw[0] != 0x1F || raw[1] != 0x8B {
        return Ok(None);
    }
    let mut decoder = GzDecoder::new(raw);
    let mut buf = Vec::new();
    decoder
        .read_to_end(&mut buf)
        .map_err(|err| EnvelopeError::Decode(err.to_string()))?;
    Ok(Some(buf))
}

/// A MIME message starts with header lines (not a binary magic prefix)
/// and somewhere declares a multipart content type with a boundary.
fn looks_like_mime(raw: &[u8]) -> bool {
    let head = &raw[..raw.len().min(4096)];
    let Ok(text) = std::str::from_utf8(head) else {
        return false;
    };
    let has_header_line = text.lines().take(20).any(|l| l.contains(':'));
    let has_multipart = text.to_ascii_lowercase().contains("multipart/")
        && text.to_ascii_lowercase().contains("boundary=");
    has_header_line && has_multipart
}

/// Walks every MIME part, recursively decoding base64 and gzip, and
/// selects the first part that looks report-bearing.
fn unwrap_mime(raw: &[u8], depth: u8) -> Result<Vec<u8>, EnvelopeError> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| EnvelopeError::MalformedMime("mail-parser could not parse message".into()))?;

    for part in message.parts.iter() {
        let content_type = part
            .content_type()
            .map(|ct| format!("{}/{}", ct.ctype(), ct.subtype().unwrap_or_default()))
            .unwrap_or_default();
        let is_gzip = content_type.to_ascii_lowercase().contains("gzip")
            || part
                .attachment_name()
                .map(|n| n.to_ascii_lowercase().ends_with(".gz"))
                .unwrap_or(false);

        let mut body = part.contents().to_vec();

        // mail-parser decodes a well-formed Content-Transfer-Encoding
        // itself; a receiver that emits base64 with missing padding or
        // embedded whitespace can leave it un-decoded. Re-attempt with
        // the tolerant decoder and only adopt the result if it actually
        // parses as base64 -- a no-op against content already decoded.
        if declares_base64(part) {
            if let Ok(decoded) = decode_base64_lenient(&body) {
                body = decoded;
            }
        }

        if is_gzip {
            let mut decoder = GzDecoder::new(body.as_slice());
            let mut decompressed = Vec::new();
            if decoder.read_to_end(&mut decompressed).is_ok() {
                body = decompressed;
            }
        }

        if crate::sniffer::looks_report_bearing(&body) {
            return decode_at(&body, depth + 1);
        }
    }

    Err(EnvelopeError::MalformedMime(
        "no report-bearing MIME part found".into(),
    ))
}

fn declares_base64(part: &mail_parser::MessagePart) -> bool {
    part.headers().iter().any(|h| {
        h.name().as_str().eq_ignore_ascii_case("Content-Transfer-Encoding")
            && h.value().as_text().map(|v| v.trim().eq_ignore_ascii_case("base64")).unwrap_or(false)
    })
}

/// Tolerant base64 decode: strips embedded whitespace and pads to a
/// multiple of 4 before handing off to the standard decoder.
pub fn decode_base64_lenient(data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut cleaned: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    while cleaned.len() % 4 != 0 {
        cleaned.push(b'=');
    }
    STANDARD
        .decode(&cleaned)
        .map_err(|err| EnvelopeError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn passthrough_for_plain_bytes() {
        let raw = b"<?xml version=\"1.0\"?><feedback></feedback>";
        let out = decode(raw).unwrap();
        assert_eq!(out, raw);
    }

    #[test]
    fn unwraps_gzip() {
        let inner = b"<?xml version=\"1.0\"?><feedback></feedback>";
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(inner).unwrap();
        let compressed = encoder.finish().unwrap();
        let out = decode(&compressed).unwrap();
        assert_eq!(out, inner);
    }

    #[test]
    fn unwrap_depth_is_bounded() {
        let mut payload = b"<?xml version=\"1.0\"?><feedback></feedback>".to_vec();
        for _ in 0..6 {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&payload).unwrap();
            payload = encoder.finish().unwrap();
        }
        let err = decode(&payload).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnwrapDepth));
    }

    #[test]
    fn base64_tolerates_missing_padding_and_whitespace() {
        let decoded = decode_base64_lenient(b"aGVsbG8gd29ybGQ").unwrap();
        assert_eq!(decoded, b"hello world");
        let decoded = decode_base64_lenient(b"aGVs bG8g d29y bGQ=").unwrap();
        assert_eq!(decoded, b"hello world");
    }
}
