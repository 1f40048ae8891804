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

//! One Kafka topic per report type. Partition key is `report_id` for
//! aggregate/smtp-tls, `message_id-unix_time` for forensic (spec §6).

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};

use crate::config::BusSinkConfig;
use crate::error::Error;
use crate::model::Report;

pub struct BusSink {
    producer: FutureProducer,
    topic_prefix: String,
}

impl BusSink {
    pub fn new(cfg: &BusSinkConfig) -> Result<Self, Error> {
        let mut builder = ClientConfig::new();
        builder.set("bootstrap.servers", &cfg.brokers);
        if cfg.tls {
            builder.set("security.protocol", if cfg.sasl_username.is_some() { "SASL_SSL" } else { "SSL" });
        } else if cfg.sasl_username.is_some() {
            builder.set("security.protocol", "SASL_PLAINTEXT");
        }
        if let (Some(user), Some(password)) = (&cfg.sasl_username, &cfg.sasl_password) {
            builder.set("sasl.mechanisms", "PLAIN");
            builder.set("sasl.username", user);
            builder.set("sasl.password", password);
        }

        let producer: FutureProducer = builder
            .create()
            .map_err(|err| Error::fatal(format!("failed to create kafka producer: {err}")))?;
        Ok(Self { producer, topic_prefix: cfg.topic_prefix.clone() })
    }

    pub async fn deliver(&self, report: &Report) -> Result<(), Error> {
        let (topic, key, payload, domain, source_ip) = match report {
            Report::Aggregate(r) => {
                let payload = serde_json::to_vec(r).map_err(|e| Error::sink(e.to_string()))?;
                (self.topic("aggregate"), r.report_id.clone(), payload, r.policy.domain.clone(), None)
            }
            Report::Forensic(r) => {
                let payload = serde_json::to_vec(r).map_err(|e| Error::sink(e.to_string()))?;
                let key = format!("{}-{}", r.message_id, r.arrival_date.timestamp());
                (self.topic("forensic"), key, payload, r.reported_domain.clone(), Some(r.source.ip_address.clone()))
            }
            Report::SmtpTls(r) => {
                let payload = serde_json::to_vec(r).map_err(|e| Error::sink(e.to_string()))?;
                (self.topic("smtp_tls"), r.report_id.clone(), payload, r.organization_name.clone(), None)
            }
        };

        let mut headers = rdkafka::message::OwnedHeaders::new()
            .insert(rdkafka::message::Header { key: "type", value: Some(report.type_label()) })
            .insert(rdkafka::message::Header { key: "domain", value: Some(domain.as_str()) });
        if let Some(ip) = &source_ip {
            headers = headers.insert(rdkafka::message::Header { key: "source_ip", value: Some(ip.as_str()) });
        }

        let record = FutureRecord::to(&topic).key(&key).payload(&payload).headers(headers);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(err, _msg)| Error::sink(err.to_string()))?;
        Ok(())
    }

    fn topic(&self, report_type: &str) -> String {
        if self.topic_prefix.is_empty() {
            report_type.to_string()
        } else {
            format!("{}.{}", self.topic_prefix, report_type)
        }
    }
}
