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

//! Crate-wide error taxonomy. The pipeline returns a single `Error` that
//! carries its `Kind`; collectors branch on the kind to decide
//! user-visible behavior (HTTP status, IMAP retry-or-archive, exit code).

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Decode/parse/sniff failure tied to the payload. Never retried.
    Input,
    /// Geolocation/DNS failure. Always swallowed by the caller.
    Enrichment,
    /// Warehouse insert failure. Surfaced to the collector.
    Storage,
    /// Bus/mail/file sink failure. Logged and counted, never surfaced.
    Sink,
    /// Connection/authentication failure in a collector.
    Collector,
    /// Invalid configuration at startup.
    Fatal,
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct Error {
    pub kind: Kind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), source: None }
    }

    pub fn with_source(
        kind: Kind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self { kind, message: message.into(), source: Some(Box::new(source)) }
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::new(Kind::Input, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(Kind::Storage, message)
    }

    pub fn sink(message: impl Into<String>) -> Self {
        Self::new(Kind::Sink, message)
    }

    pub fn collector(message: impl Into<String>) -> Self {
        Self::new(Kind::Collector, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(Kind::Fatal, message)
    }

    pub fn is_storage(&self) -> bool {
        self.kind == Kind::Storage
    }
}

/// Decode-stage failures (component A), distinguished so the pipeline
/// can log a precise `reason` tag per spec.md §4.G.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("zip container has no entries")]
    EmptyContainer,
    #[error("unwrap recursion exceeded depth limit")]
    UnwrapDepth,
    #[error("malformed MIME message: {0}")]
    MalformedMime(String),
    #[error("failed to decode payload: {0}")]
    Decode(String),
}

impl From<EnvelopeError> for Error {
    fn from(err: EnvelopeError) -> Self {
        let message = err.to_string();
        Error::with_source(Kind::Input, message, err)
    }
}

/// Parser-stage failures (components C/D/E), one variant per dialect so
/// the pipeline can concatenate reasons when all three fail.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("bad date in report: {0}")]
    BadDate(String),
    #[error("date range invariant violated: end {end} is before begin {begin}, or span exceeds 48h")]
    DateRange { begin: String, end: String },
    #[error("XML parse error: {0}")]
    Xml(String),
    #[error("JSON parse error: {0}")]
    Json(String),
    #[error("email parse error: {0}")]
    Email(String),
    #[error("session counts must be non-negative: {0}")]
    BadCounts(String),
    #[error("payload did not match this dialect")]
    NotThisDialect,
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        let message = err.to_string();
        Error::with_source(Kind::Input, message, err)
    }
}
