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

//! Component F: best-effort geolocation and reverse DNS for every
//! `Source` in a parsed report. Never fails the pipeline -- on any
//! error the field simply keeps its `"Unknown"` default.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::Resolver;
use log::{debug, warn};
use maxminddb::geoip2;

use crate::config::EnrichmentConfig;
use crate::model::Source;

/// Known two-label public suffixes under which three labels (not the
/// usual two) make up the meaningful base domain, e.g.
/// `a1234.akamaiedge.net` -> `a1234.akamaiedge.net`, not `akamaiedge.net`.
const THREE_LABEL_SUFFIXES: &[&str] = &[
    "akamaiedge.net",
    "akamaitechnologies.com",
    "amazonaws.com",
    "cloudfront.net",
];

pub struct Enricher {
    offline: bool,
    geoip: Option<maxminddb::Reader<Vec<u8>>>,
    nameservers: Vec<IpAddr>,
    dns_timeout: Duration,
}

impl Enricher {
    pub fn new(cfg: &EnrichmentConfig) -> Self {
        if cfg.offline {
            return Self { offline: true, geoip: None, nameservers: vec![], dns_timeout: cfg.dns_timeout() };
        }

        let geoip = cfg.geoip_database.as_ref().and_then(|path| {
            maxminddb::Reader::open_readfile(path)
                .map_err(|err| warn!("failed to open GeoIP database {}: {err}", path.display()))
                .ok()
        });
        let nameservers = cfg
            .nameservers
            .iter()
            .filter_map(|raw| {
                raw.parse::<IpAddr>()
                    .map_err(|err| warn!("ignoring unparsable nameserver {raw}: {err}"))
                    .ok()
            })
            .collect();

        Self { offline: false, geoip, nameservers, dns_timeout: cfg.dns_timeout() }
    }

    /// Enriches every source yielded by `sources`, deduplicating lookups
    /// for IPs repeated within the same report.
    pub async fn enrich_all<'a>(&self, sources: impl Iterator<Item = &'a mut Source>) {
        if self.offline {
            return;
        }
        let mut cache: HashMap<String, Enrichment> = HashMap::new();
        for source in sources {
            let enrichment = match cache.get(&source.ip_address) {
                Some(e) => e.clone(),
                None => {
                    let e = self.lookup(&source.ip_address).await;
                    cache.insert(source.ip_address.clone(), e.clone());
                    e
                }
            };
            enrichment.apply(source);
        }
    }

    pub async fn enrich_one(&self, source: &mut Source) {
        if self.offline {
            return;
        }
        self.lookup(&source.ip_address).await.apply(source);
    }

    async fn lookup(&self, ip: &str) -> Enrichment {
        let mut enrichment = Enrichment::default();

        if let Some(geoip) = &self.geoip {
            if let Ok(addr) = ip.parse::<IpAddr>() {
                match geoip.lookup::<geoip2::Country>(addr) {
                    Ok(Some(country)) => {
                        if let Some(name) = country.country.and_then(|c| c.names).and_then(|n| n.get("en").copied()) {
                            enrichment.country = Some(name.to_string());
                        }
                    }
                    Ok(None) => {}
                    Err(err) => debug!("GeoIP lookup failed for {ip}: {err}"),
                }
            }
        }

        if !self.nameservers.is_empty() {
            if let Ok(addr) = ip.parse::<IpAddr>() {
                enrichment.reverse_dns = self.reverse_resolve(addr).await;
                if let Some(name) = &enrichment.reverse_dns {
                    enrichment.base_domain = Some(base_domain(name));
                }
            }
        }

        enrichment
    }

    /// Issues a PTR query against each configured nameserver in order;
    /// the first successful answer wins.
    async fn reverse_resolve(&self, addr: IpAddr) -> Option<String> {
        for nameserver in &self.nameservers {
            let resolver = self.resolver_for(*nameserver);
            match tokio::time::timeout(self.dns_timeout, resolver.reverse_lookup(addr)).await {
                Ok(Ok(lookup)) => {
                    if let Some(name) = lookup.iter().next() {
                        return Some(normalize_host(&name.to_string()));
                    }
                }
                Ok(Err(err)) => debug!("PTR lookup for {addr} via {nameserver} failed: {err}"),
                Err(_) => debug!("PTR lookup for {addr} via {nameserver} timed out"),
            }
        }
        None
    }

    fn resolver_for(&self, nameserver: IpAddr) -> Resolver<TokioConnectionProvider> {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new((nameserver, 53).into(), Protocol::Udp));
        let mut opts = ResolverOpts::default();
        opts.timeout = self.dns_timeout;
        opts.attempts = 1;
        Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build()
    }
}

#[derive(Debug, Clone, Default)]
struct Enrichment {
    country: Option<String>,
    reverse_dns: Option<String>,
    base_domain: Option<String>,
}

impl Enrichment {
    fn apply(&self, source: &mut Source) {
        if let Some(country) = &self.country {
            source.country = country.clone();
        }
        source.reverse_dns = self.reverse_dns.clone();
        source.base_domain = self.base_domain.clone();
    }
}

/// Lowercases and strips a single trailing dot; idempotent.
pub fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Last two labels, unless `host` ends in a known multi-label suffix
/// (see [`THREE_LABEL_SUFFIXES`]), in which case three are kept.
fn base_domain(host: &str) -> String {
    let host = normalize_host(host);
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return host;
    }
    for suffix in THREE_LABEL_SUFFIXES {
        if host.ends_with(suffix) && labels.len() >= 3 {
            return labels[labels.len() - 3..].join(".");
        }
    }
    labels[labels.len() - 2..].join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_normalization_is_idempotent() {
        let host = "Mail.Example.COM.";
        let once = normalize_host(host);
        assert_eq!(once, normalize_host(&once));
        assert_eq!(once, "mail.example.com");
    }

    #[test]
    fn base_domain_keeps_two_labels_by_default() {
        assert_eq!(base_domain("a.b.example.com"), "example.com");
    }

    #[test]
    fn base_domain_keeps_three_labels_for_known_suffixes() {
        assert_eq!(base_domain("a1234.akamaiedge.net"), "a1234.akamaiedge.net");
        assert_eq!(base_domain("x.y.a1234.akamaiedge.net"), "a1234.akamaiedge.net");
    }
}
