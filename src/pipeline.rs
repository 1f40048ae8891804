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

//! Component G: the coordination center. Pure given its inputs and
//! external capabilities -- it holds no cross-call state, so one call
//! to [`Pipeline::process`] is entirely independent of the next.

use std::time::Instant;

use log::{info, warn};

use crate::enrichment::Enricher;
use crate::error::{Error, Kind, ParseError};
use crate::metrics;
use crate::model::Report;
use crate::sinks::Dispatcher;
use crate::sniffer::{self, Verdict};
use crate::{envelope, parsers};

pub struct Pipeline {
    enricher: Enricher,
    dispatcher: Dispatcher,
}

impl Pipeline {
    pub fn new(enricher: Enricher, dispatcher: Dispatcher) -> Self {
        Self { enricher, dispatcher }
    }

    /// Runs the full A->B->{C,D,E}->F->H chain for one collected blob.
    /// `source` tags the collector of origin (`"http"`, `"imap"`,
    /// `"file"`) for metrics only.
    pub async fn process(&self, raw: &[u8], source: &str) -> Result<(), Error> {
        let start = Instant::now();

        let payload = match envelope::decode(raw) {
            Ok(p) => p,
            Err(err) => {
                metrics::reports_failed("unknown", "extraction_failed");
                return Err(err.into());
            }
        };

        let mut report = match self.parse(&payload, source) {
            Ok(report) => report,
            Err(reasons) => {
                metrics::reports_failed("unknown", "unknown_format");
                return Err(Error::new(Kind::Input, reasons));
            }
        };

        self.enrich(&mut report).await;

        if let Err(err) = self.dispatcher.dispatch(&report).await {
            metrics::reports_failed(report.type_label(), "storage_failed");
            return Err(err);
        }

        metrics::reports_processed(report.type_label());
        metrics::report_size(raw.len() as u64);
        metrics::parser_duration(report.type_label(), source, start.elapsed().as_secs_f64());
        info!("processed {} report from {source} in {:?}", report.type_label(), start.elapsed());
        Ok(())
    }

    /// Tries parsers in the order the sniffer verdict suggests, falling
    /// through to the remaining two in canonical order
    /// (aggregate -> forensic -> smtp_tls) on failure. Returns the
    /// concatenated per-parser reasons if all three fail.
    fn parse(&self, payload: &[u8], source: &str) -> Result<Report, String> {
        let verdict = sniffer::sniff(payload);
        let order = parser_order(verdict);

        let mut reasons = Vec::new();
        for dialect in order {
            match try_dialect(dialect, payload) {
                Ok(report) => {
                    metrics::parser_report(dialect.label(), source);
                    return Ok(report);
                }
                Err(err) => {
                    metrics::parser_failure(dialect.label(), source, &err.to_string());
                    reasons.push(format!("{}: {err}", dialect.label()));
                }
            }
        }
        warn!("no parser matched payload from {source}: {}", reasons.join("; "));
        Err(reasons.join("; "))
    }

    async fn enrich(&self, report: &mut Report) {
        match report {
            Report::Aggregate(r) => self.enricher.enrich_all(r.sources_mut()).await,
            Report::Forensic(r) => self.enricher.enrich_one(&mut r.source).await,
            Report::SmtpTls(_) => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Aggregate,
    Forensic,
    SmtpTls,
}

impl Dialect {
    fn label(self) -> &'static str {
        match self {
            Dialect::Aggregate => "aggregate",
            Dialect::Forensic => "forensic",
            Dialect::SmtpTls => "smtp_tls",
        }
    }
}

const CANONICAL_ORDER: [Dialect; 3] = [Dialect::Aggregate, Dialect::Forensic, Dialect::SmtpTls];

/// Sniffer verdict picks which dialect is tried first; the rest follow
/// in canonical order (spec §4.G step 2).
fn parser_order(verdict: Verdict) -> Vec<Dialect> {
    let preferred = match verdict {
        Verdict::Aggregate => Some(Dialect::Aggregate),
        Verdict::Forensic => Some(Dialect::Forensic),
        Verdict::SmtpTls => Some(Dialect::SmtpTls),
        Verdict::Unknown => None,
    };
    match preferred {
        Some(first) => {
            let mut order = vec![first];
            order.extend(CANONICAL_ORDER.iter().copied().filter(|d| *d != first));
            order
        }
        None => CANONICAL_ORDER.to_vec(),
    }
}

fn try_dialect(dialect: Dialect, payload: &[u8]) -> Result<Report, ParseError> {
    match dialect {
        Dialect::Aggregate => parsers::aggregate::parse(payload).map(Report::Aggregate),
        Dialect::Forensic => parsers::forensic::parse(payload).map(Report::Forensic),
        Dialect::SmtpTls => parsers::smtp_tls::parse(payload).map(Report::SmtpTls),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_starts_with_sniffer_verdict_then_canonical_rest() {
        assert_eq!(parser_order(Verdict::Forensic), vec![Dialect::Forensic, Dialect::Aggregate, Dialect::SmtpTls]);
        assert_eq!(parser_order(Verdict::Unknown), vec![Dialect::Aggregate, Dialect::Forensic, Dialect::SmtpTls]);
    }
}
