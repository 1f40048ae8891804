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

//! Component H: fan-out dispatcher. Delivery to each configured sink
//! runs sequentially per report; sinks are independent -- one sink's
//! error never stops the next one from being attempted. Only `storage`
//! failures are surfaced back to the caller (spec §4.H).

pub mod bus;
pub mod file;
pub mod mail;
pub mod storage;

use log::error;

use crate::config::{FileSinkConfig, SinksConfig};
use crate::error::Error;
use crate::model::Report;
use crate::metrics;

pub struct Dispatcher {
    storage: Option<storage::StorageSink>,
    bus: Option<bus::BusSink>,
    mail: Option<mail::MailSink>,
    file: Option<file::FileSink>,
}

impl Dispatcher {
    pub fn from_config(cfg: &SinksConfig) -> Result<Self, Error> {
        Ok(Self {
            storage: cfg.storage.as_ref().map(storage::StorageSink::new).transpose()?,
            bus: cfg.bus.as_ref().map(bus::BusSink::new).transpose()?,
            mail: cfg.mail.as_ref().map(|c| mail::MailSink::new(c.clone())).transpose()?,
            file: cfg.file.as_ref().map(file::FileSink::new).transpose()?,
        })
    }

    /// A dispatcher that only ever writes to a single file, bypassing the
    /// configured sinks entirely -- backs `--output`/`--format`.
    pub fn to_file_only(cfg: &FileSinkConfig) -> Result<Self, Error> {
        Ok(Self {
            storage: None,
            bus: None,
            mail: None,
            file: Some(file::FileSink::new(cfg)?),
        })
    }

    /// Delivers `report` to every configured sink. Returns the storage
    /// sink's error, if any -- that is the only failure the collector
    /// needs to act on (HTTP 5xx, IMAP leave-for-retry).
    pub async fn dispatch(&self, report: &Report) -> Result<(), Error> {
        let storage_result = if let Some(storage) = &self.storage {
            let result = storage.deliver(report).await;
            if let Err(err) = &result {
                error!("storage sink failed: {err}");
                metrics::sink_failure("storage");
            }
            result
        } else {
            Ok(())
        };

        if let Some(bus) = &self.bus {
            if let Err(err) = bus.deliver(report).await {
                error!("bus sink failed: {err}");
                metrics::sink_failure("bus");
            }
        }
        if let Some(mail) = &self.mail {
            if let Err(err) = mail.deliver(report).await {
                error!("mail sink failed: {err}");
                metrics::sink_failure("mail");
            }
        }
        if let Some(file) = &self.file {
            if let Err(err) = file.deliver(report).await {
                error!("file sink failed: {err}");
                metrics::sink_failure("file");
            }
        }

        storage_result.map_err(|err| Error::storage(err.to_string()))
    }
}
