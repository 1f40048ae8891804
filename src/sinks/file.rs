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

//! JSON-lines (pretty, one object per line) or CSV output to a file.
//! CSV schemas are fixed per report type and the header row is written
//! once per process (tracked by whether the file already existed).

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;

use crate::config::{FileOutputFormat, FileSinkConfig};
use crate::error::Error;
use crate::model::{AggregateReport, ForensicReport, Report, SmtpTlsReport};

pub struct FileSink {
    format: FileOutputFormat,
    writer: Mutex<std::fs::File>,
    csv_header_written: Mutex<bool>,
}

impl FileSink {
    pub fn new(cfg: &FileSinkConfig) -> Result<Self, Error> {
        let existed = cfg.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.path)
            .map_err(|err| Error::fatal(format!("cannot open file sink {}: {err}", cfg.path.display())))?;
        Ok(Self {
            format: cfg.format.clone(),
            writer: Mutex::new(file),
            csv_header_written: Mutex::new(existed),
        })
    }

    pub async fn deliver(&self, report: &Report) -> Result<(), Error> {
        match self.format {
            FileOutputFormat::Json => self.write_json(report),
            FileOutputFormat::Csv => self.write_csv(report),
        }
    }

    fn write_json(&self, report: &Report) -> Result<(), Error> {
        let line = serde_json::to_string_pretty(report).map_err(|e| Error::sink(e.to_string()))?;
        let mut file = self.writer.lock().unwrap();
        writeln!(file, "{line}").map_err(|e| Error::sink(e.to_string()))
    }

    fn write_csv(&self, report: &Report) -> Result<(), Error> {
        match report {
            Report::Aggregate(r) => self.write_csv_rows(csv_rows_aggregate(r)),
            Report::Forensic(r) => self.write_csv_rows(vec![csv_row_forensic(r)]),
            Report::SmtpTls(r) => self.write_csv_rows(csv_rows_smtp_tls(r)),
        }
    }

    fn write_csv_rows<T: Serialize>(&self, rows: Vec<T>) -> Result<(), Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut header_written = self.csv_header_written.lock().unwrap();
        let file = self.writer.lock().unwrap();
        let mut writer = csv::WriterBuilder::new()
            .has_headers(!*header_written)
            .from_writer(&*file);
        for row in rows {
            writer.serialize(row).map_err(|e| Error::sink(e.to_string()))?;
        }
        writer.flush().map_err(|e| Error::sink(e.to_string()))?;
        *header_written = true;
        Ok(())
    }
}

#[derive(Serialize)]
struct AggregateCsvRow<'a> {
    report_id: &'a str,
    org_name: &'a str,
    domain: &'a str,
    begin: i64,
    end: i64,
    source_ip: &'a str,
    country: &'a str,
    count: u64,
    disposition: &'a str,
    header_from: &'a str,
    dmarc_aligned: bool,
}

fn csv_rows_aggregate(report: &AggregateReport) -> Vec<AggregateCsvRow<'_>> {
    report
        .records
        .iter()
        .map(|record| AggregateCsvRow {
            report_id: &report.report_id,
            org_name: &report.org_name,
            domain: &report.policy.domain,
            begin: report.begin.timestamp(),
            end: report.end.timestamp(),
            source_ip: &record.source.ip_address,
            country: &record.source.country,
            count: record.count,
            disposition: record.policy_evaluated.disposition.label(),
            header_from: &record.identifiers.header_from,
            dmarc_aligned: record.alignment.dmarc_aligned,
        })
        .collect()
}

#[derive(Serialize)]
struct ForensicCsvRow<'a> {
    message_id: &'a str,
    feedback_type: &'a str,
    arrival_date: i64,
    subject: &'a str,
    source_ip: &'a str,
    reported_domain: &'a str,
    delivery_result: &'static str,
    auth_failure: String,
}

fn csv_row_forensic(report: &ForensicReport) -> ForensicCsvRow<'_> {
    ForensicCsvRow {
        message_id: &report.message_id,
        feedback_type: &report.feedback_type,
        arrival_date: report.arrival_date.timestamp(),
        subject: &report.subject,
        source_ip: &report.source.ip_address,
        reported_domain: &report.reported_domain,
        delivery_result: match report.delivery_result {
            crate::model::DeliveryResult::Delivered => "delivered",
            crate::model::DeliveryResult::Spam => "spam",
            crate::model::DeliveryResult::Policy => "policy",
            crate::model::DeliveryResult::Reject => "reject",
            crate::model::DeliveryResult::Other => "other",
        },
        auth_failure: report.auth_failure.join(","),
    }
}

#[derive(Serialize)]
struct SmtpTlsCsvRow<'a> {
    report_id: &'a str,
    organization_name: &'a str,
    begin_date: i64,
    end_date: i64,
    policy_domain: &'a str,
    policy_type: &'a str,
    successful_session_count: u64,
    failed_session_count: u64,
}

fn csv_rows_smtp_tls(report: &SmtpTlsReport) -> Vec<SmtpTlsCsvRow<'_>> {
    report
        .policies
        .iter()
        .map(|policy| SmtpTlsCsvRow {
            report_id: &report.report_id,
            organization_name: &report.organization_name,
            begin_date: report.begin_date.timestamp(),
            end_date: report.end_date.timestamp(),
            policy_domain: &policy.policy_domain,
            policy_type: &policy.policy_type,
            successful_session_count: policy.successful_session_count,
            failed_session_count: policy.failed_session_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AggregateRecord, Alignment, AuthResults, Disposition, Identifiers, PolicyEvaluated,
        PublishedPolicy, RecordAlignment, Source, Verdict,
    };
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn scratch_path(label: &str) -> std::path::PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("dmarc-herald-test-{}-{}-{n}.out", std::process::id(), label))
    }

    fn sample_aggregate() -> Report {
        Report::Aggregate(AggregateReport {
            org_name: "Example Corp".into(),
            org_email: "noreply@example.com".into(),
            extra_contact: None,
            report_id: "test123".into(),
            begin: Utc::now(),
            end: Utc::now(),
            errors: vec![],
            policy: PublishedPolicy {
                domain: "example.com".into(),
                adkim: Alignment::Relaxed,
                aspf: Alignment::Relaxed,
                p: Disposition::reject(),
                sp: Disposition::reject(),
                pct: 100,
                fo: "0".into(),
            },
            records: vec![AggregateRecord {
                source: Source::new("192.168.1.1"),
                count: 1,
                policy_evaluated: PolicyEvaluated {
                    disposition: Disposition::none(),
                    dkim: Verdict("pass".into()),
                    spf: Verdict("pass".into()),
                    override_reasons: vec![],
                },
                alignment: RecordAlignment { spf_aligned: true, dkim_aligned: true, dmarc_aligned: true },
                identifiers: Identifiers { header_from: "example.com".into(), envelope_from: None, envelope_to: None },
                auth_results: AuthResults { dkim: vec![], spf: vec![] },
            }],
        })
    }

    #[tokio::test]
    async fn json_sink_writes_one_line_per_report() {
        let path = scratch_path("json");
        let sink = FileSink::new(&FileSinkConfig { path: path.clone(), format: FileOutputFormat::Json }).unwrap();
        sink.deliver(&sample_aggregate()).await.unwrap();
        sink.deliver(&sample_aggregate()).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<&str> = contents.split("}\n{").collect();
        assert_eq!(parsed.len(), 2);
        assert!(contents.contains("\"report_id\": \"test123\""));
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn csv_sink_writes_header_once() {
        let path = scratch_path("csv");
        let sink = FileSink::new(&FileSinkConfig { path: path.clone(), format: FileOutputFormat::Csv }).unwrap();
        sink.deliver(&sample_aggregate()).await.unwrap();
        sink.deliver(&sample_aggregate()).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let header_count = contents.lines().filter(|l| l.starts_with("report_id,")).count();
        assert_eq!(header_count, 1);
        assert_eq!(contents.lines().count(), 3); // header + 2 rows
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn csv_sink_does_not_rewrite_header_for_existing_file() {
        let path = scratch_path("csv-reopen");
        {
            let sink = FileSink::new(&FileSinkConfig { path: path.clone(), format: FileOutputFormat::Csv }).unwrap();
            sink.deliver(&sample_aggregate()).await.unwrap();
        }
        {
            let sink = FileSink::new(&FileSinkConfig { path: path.clone(), format: FileOutputFormat::Csv }).unwrap();
            sink.deliver(&sample_aggregate()).await.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let header_count = contents.lines().filter(|l| l.starts_with("report_id,")).count();
        assert_eq!(header_count, 1);
        std::fs::remove_file(&path).unwrap();
    }
}
