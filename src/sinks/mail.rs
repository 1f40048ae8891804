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

//! MIME multipart/mixed mail: a short text part plus the canonical
//! report as a JSON attachment. Subject/body come from configuration,
//! falling back to the documented default templates (spec §6).

use lettre::message::{header::ContentType, Attachment, Message, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};

use crate::config::{MailEncryption, MailSinkConfig};
use crate::error::Error;
use crate::model::Report;

pub struct MailSink {
    cfg: MailSinkConfig,
    transport: SmtpTransport,
}

impl MailSink {
    pub fn new(cfg: MailSinkConfig) -> Result<Self, Error> {
        let mut builder = match cfg.encryption {
            MailEncryption::Tls => SmtpTransport::relay(&cfg.smtp_host).map_err(|e| Error::fatal(e.to_string()))?,
            MailEncryption::StartTls => {
                SmtpTransport::starttls_relay(&cfg.smtp_host).map_err(|e| Error::fatal(e.to_string()))?
            }
            MailEncryption::None => SmtpTransport::builder_dangerous(&cfg.smtp_host),
        }
        .port(cfg.smtp_port);
        if let (Some(user), Some(password)) = (&cfg.username, &cfg.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
        Ok(Self { transport: builder.build(), cfg })
    }

    pub async fn deliver(&self, report: &Report) -> Result<(), Error> {
        let domain = match report {
            crate::model::Report::Aggregate(r) => r.policy.domain.clone(),
            crate::model::Report::Forensic(r) => r.reported_domain.clone(),
            crate::model::Report::SmtpTls(r) => r.organization_name.clone(),
        };
        let subject = self
            .cfg
            .subject_template
            .replace("{type}", report.type_label())
            .replace("{domain}", &domain);
        let body_json = serde_json::to_string_pretty(report).map_err(|e| Error::sink(e.to_string()))?;

        let email = Message::builder()
            .from(self.cfg.from.parse().map_err(|e| Error::sink(format!("invalid from address: {e}")))?)
            .to(self.cfg.to.parse().map_err(|e| Error::sink(format!("invalid to address: {e}")))?)
            .subject(subject)
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(format!(
                        "A {} report for {} is attached as JSON.",
                        report.type_label(),
                        domain
                    )))
                    .singlepart(
                        Attachment::new(format!("{}-report.json", report.type_label()))
                            .body(body_json, ContentType::parse("application/json").unwrap()),
                    ),
            )
            .map_err(|e| Error::sink(e.to_string()))?;

        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| Error::sink(e.to_string()))?
            .map_err(|e| Error::sink(e.to_string()))?;
        Ok(())
    }
}
