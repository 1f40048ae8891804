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

//! The only sink whose failure is surfaced back to the collector (spec
//! §4.H): a columnar warehouse insert. One table per report type; array
//! columns carry the repeating structures (DKIM/SPF results, override
//! reasons) as JSON-encoded strings -- simpler than a nested-array
//! schema and good enough for a write-only sink with no core query path.

use clickhouse::Row;
use serde::Serialize;

use crate::config::StorageSinkConfig;
use crate::error::Error;
use crate::model::{AggregateReport, ForensicReport, Report, SmtpTlsReport};

pub struct StorageSink {
    client: clickhouse::Client,
}

#[derive(Row, Serialize)]
struct AggregateRow<'a> {
    report_id: &'a str,
    org_name: &'a str,
    org_email: &'a str,
    begin: i64,
    end: i64,
    domain: &'a str,
    disposition: &'a str,
    source_ip: &'a str,
    country: &'a str,
    base_domain: &'a str,
    count: u64,
    header_from: &'a str,
    dkim_aligned: bool,
    spf_aligned: bool,
    dmarc_aligned: bool,
    dkim_results: Vec<String>,
    spf_results: Vec<String>,
    override_reasons: Vec<String>,
}

#[derive(Row, Serialize)]
struct ForensicRow<'a> {
    message_id: &'a str,
    feedback_type: &'a str,
    arrival_date: i64,
    subject: &'a str,
    source_ip: &'a str,
    country: &'a str,
    reported_domain: &'a str,
    delivery_result: &'a str,
    auth_failure: &'a [String],
}

#[derive(Row, Serialize)]
struct SmtpTlsRow<'a> {
    report_id: &'a str,
    organization_name: &'a str,
    begin_date: i64,
    end_date: i64,
    policy_domain: &'a str,
    policy_type: &'a str,
    successful_session_count: u64,
    failed_session_count: u64,
    failure_details: Vec<String>,
}

impl StorageSink {
    pub fn new(cfg: &StorageSinkConfig) -> Result<Self, Error> {
        let mut client = clickhouse::Client::default().with_url(&cfg.url).with_database(&cfg.database);
        if let Some(user) = &cfg.username {
            client = client.with_user(user);
        }
        if let Some(password) = &cfg.password {
            client = client.with_password(password);
        }
        Ok(Self { client })
    }

    pub async fn deliver(&self, report: &Report) -> Result<(), Error> {
        match report {
            Report::Aggregate(r) => self.insert_aggregate(r).await,
            Report::Forensic(r) => self.insert_forensic(r).await,
            Report::SmtpTls(r) => self.insert_smtp_tls(r).await,
        }
    }

    async fn insert_aggregate(&self, report: &AggregateReport) -> Result<(), Error> {
        let mut insert = self
            .client
            .insert("aggregate_records")
            .map_err(|err| Error::storage(err.to_string()))?;
        for record in &report.records {
            let row = AggregateRow {
                report_id: &report.report_id,
                org_name: &report.org_name,
                org_email: &report.org_email,
                begin: report.begin.timestamp(),
                end: report.end.timestamp(),
                domain: &report.policy.domain,
                disposition: record.policy_evaluated.disposition.label(),
                source_ip: &record.source.ip_address,
                country: &record.source.country,
                base_domain: record.source.base_domain.as_deref().unwrap_or(""),
                count: record.count,
                header_from: &record.identifiers.header_from,
                dkim_aligned: record.alignment.dkim_aligned,
                spf_aligned: record.alignment.spf_aligned,
                dmarc_aligned: record.alignment.dmarc_aligned,
                dkim_results: record.auth_results.dkim.iter().filter_map(|d| serde_json::to_string(d).ok()).collect(),
                spf_results: record.auth_results.spf.iter().filter_map(|s| serde_json::to_string(s).ok()).collect(),
                override_reasons: record
                    .policy_evaluated
                    .override_reasons
                    .iter()
                    .filter_map(|r| serde_json::to_string(r).ok())
                    .collect(),
            };
            insert.write(&row).await.map_err(|err| Error::storage(err.to_string()))?;
        }
        insert.end().await.map_err(|err| Error::storage(err.to_string()))
    }

    async fn insert_forensic(&self, report: &ForensicReport) -> Result<(), Error> {
        let mut insert = self
            .client
            .insert("forensic_reports")
            .map_err(|err| Error::storage(err.to_string()))?;
        let row = ForensicRow {
            message_id: &report.message_id,
            feedback_type: &report.feedback_type,
            arrival_date: report.arrival_date.timestamp(),
            subject: &report.subject,
            source_ip: &report.source.ip_address,
            country: &report.source.country,
            reported_domain: &report.reported_domain,
            delivery_result: delivery_result_label(report.delivery_result),
            auth_failure: &report.auth_failure,
        };
        insert.write(&row).await.map_err(|err| Error::storage(err.to_string()))?;
        insert.end().await.map_err(|err| Error::storage(err.to_string()))
    }

    async fn insert_smtp_tls(&self, report: &SmtpTlsReport) -> Result<(), Error> {
        let mut insert = self
            .client
            .insert("smtp_tls_policies")
            .map_err(|err| Error::storage(err.to_string()))?;
        for policy in &report.policies {
            let row = SmtpTlsRow {
                report_id: &report.report_id,
                organization_name: &report.organization_name,
                begin_date: report.begin_date.timestamp(),
                end_date: report.end_date.timestamp(),
                policy_domain: &policy.policy_domain,
                policy_type: &policy.policy_type,
                successful_session_count: policy.successful_session_count,
                failed_session_count: policy.failed_session_count,
                failure_details: policy.failure_details.iter().filter_map(|d| serde_json::to_string(d).ok()).collect(),
            };
            insert.write(&row).await.map_err(|err| Error::storage(err.to_string()))?;
        }
        insert.end().await.map_err(|err| Error::storage(err.to_string()))
    }
}

fn delivery_result_label(d: crate::model::DeliveryResult) -> &'static str {
    match d {
        crate::model::DeliveryResult::Delivered => "delivered",
        crate::model::DeliveryResult::Spam => "spam",
        crate::model::DeliveryResult::Policy => "policy",
        crate::model::DeliveryResult::Reject => "reject",
        crate::model::DeliveryResult::Other => "other",
    }
}
