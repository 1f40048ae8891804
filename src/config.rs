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

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `config`/serde have no native `Duration`; every interval is stored as
/// whole seconds on the wire and converted at the point of use.
fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct HeraldConfig {
    pub http: HttpConfig,
    pub imap: Option<ImapConfig>,
    pub enrichment: EnrichmentConfig,
    pub sinks: SinksConfig,
}

impl HeraldConfig {
    /// Startup validation. Invalid configuration is a `Fatal` error: the
    /// process exits non-zero immediately rather than limping along.
    pub fn validate(&self) -> Result<(), Error> {
        if self.http.tls.enable && (self.http.tls.cert.is_none() || self.http.tls.key.is_none()) {
            return Err(Error::fatal("TLS enabled but cert/key path missing"));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HttpConfig {
    /// listen address, defaults to 127.0.0.1
    pub listen: String,
    /// defaults to 8080
    pub port: u16,
    pub tls: TlsConfig,
    pub rate_limit: RateLimitConfig,
    /// bodies larger than this are rejected with 413 before touching the pipeline
    pub max_upload_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1".to_string(),
            port: 8080,
            tls: TlsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            max_upload_size: 25 * 1024 * 1024,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// default false
    pub enable: bool,
    /// PEM encoded certificate file
    pub cert: Option<PathBuf>,
    /// PEM encoded private key file
    pub key: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    /// token-bucket refills per minute, per client IP
    pub rate_per_minute: u32,
    /// bucket depth
    pub burst: u32,
    /// entries idle longer than this (in seconds) are swept from the bucket table
    pub idle_eviction_secs: u64,
}

impl RateLimitConfig {
    pub fn idle_eviction(&self) -> Duration {
        secs(self.idle_eviction_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { rate_per_minute: 60, burst: 10, idle_eviction_secs: 600 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub mailbox: String,
    /// seconds between the end of one poll cycle and the start of the next
    pub check_interval_secs: u64,
    pub delete_processed: bool,
    pub archive_mailbox: Option<String>,
}

impl ImapConfig {
    pub fn check_interval(&self) -> Duration {
        secs(self.check_interval_secs)
    }
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 993,
            username: String::new(),
            password: String::new(),
            use_tls: true,
            mailbox: "INBOX".to_string(),
            check_interval_secs: 300,
            delete_processed: false,
            archive_mailbox: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// skip geolocation/reverse-DNS entirely
    pub offline: bool,
    pub geoip_database: Option<PathBuf>,
    pub nameservers: Vec<String>,
    /// per-query PTR lookup timeout, in seconds
    pub dns_timeout_secs: u64,
}

impl EnrichmentConfig {
    pub fn dns_timeout(&self) -> Duration {
        secs(self.dns_timeout_secs)
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            offline: false,
            geoip_database: None,
            nameservers: vec![],
            dns_timeout_secs: 2,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct SinksConfig {
    pub storage: Option<StorageSinkConfig>,
    pub bus: Option<BusSinkConfig>,
    pub mail: Option<MailSinkConfig>,
    pub file: Option<FileSinkConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageSinkConfig {
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for StorageSinkConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "dmarc".to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct BusSinkConfig {
    pub brokers: String,
    pub topic_prefix: String,
    pub tls: bool,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

/// How `mail.rs` connects to `smtp_host`. Defaults to `StartTls`, the
/// encryption opportunistic on the submission port (587) -- plaintext
/// is opt-in, never the fallback.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MailEncryption {
    Tls,
    #[default]
    StartTls,
    None,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MailSinkConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub encryption: MailEncryption,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: String,
    pub subject_template: String,
}

impl Default for MailSinkConfig {
    fn default() -> Self {
        Self {
            smtp_host: "localhost".to_string(),
            smtp_port: 587,
            encryption: MailEncryption::StartTls,
            username: None,
            password: None,
            from: "dmarc-herald@localhost".to_string(),
            to: String::new(),
            subject_template: "[dmarc-herald] {type} report for {domain}".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, clap::ValueEnum)]
pub enum FileOutputFormat {
    #[default]
    Json,
    Csv,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FileSinkConfig {
    pub path: PathBuf,
    pub format: FileOutputFormat,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("reports.jsonl"), format: FileOutputFormat::Json }
    }
}

/// Loads configuration from (in increasing priority) built-in defaults,
/// the given YAML file, then environment variables whose dotted path is
/// upper-cased with `.` replaced by `_` (e.g. `http.port` -> `HTTP_PORT`).
pub fn load(path: &PathBuf) -> Result<HeraldConfig, Error> {
    let builder = config::Config::builder()
        .add_source(config::File::from(path.as_path()).required(false))
        .add_source(config::Environment::default().separator("_").try_parsing(true));
    let cfg = builder
        .build()
        .map_err(|err| Error::fatal(format!("failed to load config: {err}")))?;
    let parsed: HeraldConfig = cfg
        .try_deserialize()
        .map_err(|err| Error::fatal(format!("failed to parse config: {err}")))?;
    parsed.validate()?;
    Ok(parsed)
}
