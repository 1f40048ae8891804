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

//! Component J: IMAP polling collector.
//!
//! ```text
//! IDLE -> CONNECT -> AUTH -> SELECT(mailbox)
//!   -> LIST(all UIDs) -> FETCH(headers+structure)
//!   -> FILTER(is-dmarc?) -> for each match: FETCH(body) -> PIPELINE -> POST-ACTION
//!   -> DISCONNECT -> SLEEP(check_interval) -> IDLE
//! ```
//!
//! One long-lived task, no per-message parallelism (spec §5): the
//! broker's rate limits and the pipeline's CPU use don't warrant it.

use std::sync::Arc;
use std::time::Duration;

use imap::types::{BodyStructure, Fetch};
use imap::{ClientBuilder, Session};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::ImapConfig;
use crate::pipeline::Pipeline;

const ERROR_BACKOFF: Duration = Duration::from_secs(30);
const DMARC_SUBJECT_HINTS: &[&str] = &["dmarc", "report domain", "aggregate report", "forensic report", "tlsrpt"];
const DMARC_MIME_TYPES: &[&str] = &[
    "application/xml",
    "application/zip",
    "application/gzip",
    "application/octet-stream",
    "application/tlsrpt+json",
    "application/tlsrpt+gzip",
    "text/xml",
];

pub async fn poll(cfg: ImapConfig, pipeline: Arc<Pipeline>, shutdown: CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match run_cycle(&cfg, &pipeline).await {
            Ok(processed) => {
                if processed > 0 {
                    info!("imap cycle processed {processed} message(s)");
                }
            }
            Err(err) => {
                error!("imap cycle aborted: {err}");
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    _ = shutdown.cancelled() => return,
                }
                continue;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(cfg.check_interval()) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

/// One CONNECT..DISCONNECT cycle. Runs on a blocking thread because the
/// `imap` crate is synchronous.
async fn run_cycle(cfg: &ImapConfig, pipeline: &Arc<Pipeline>) -> Result<usize, String> {
    let cfg = cfg.clone();
    let pipeline = pipeline.clone();
    tokio::task::spawn_blocking(move || run_cycle_blocking(&cfg, &pipeline))
        .await
        .map_err(|err| format!("imap worker task panicked: {err}"))?
}

fn run_cycle_blocking(cfg: &ImapConfig, pipeline: &Arc<Pipeline>) -> Result<usize, String> {
    let client = if cfg.use_tls {
        ClientBuilder::new(&cfg.host, cfg.port).connect().map_err(|e| e.to_string())?
    } else {
        // opportunistic STARTTLS: `imap` negotiates it automatically when
        // the server advertises the capability during an unencrypted connect.
        ClientBuilder::new(&cfg.host, cfg.port)
            .starttls()
            .connect()
            .map_err(|e| e.to_string())?
    };

    let mut session: Session<Box<dyn imap::ImapConnection>> =
        client.login(&cfg.username, &cfg.password).map_err(|(err, _)| err.to_string())?;

    session.select(&cfg.mailbox).map_err(|e| e.to_string())?;

    let uids = session.uid_search("ALL").map_err(|e| e.to_string())?;
    if uids.is_empty() {
        let _ = session.logout();
        return Ok(0);
    }
    let uid_list: Vec<String> = uids.iter().map(|u| u.to_string()).collect();

    let headers = session
        .uid_fetch(uid_list.join(","), "(ENVELOPE BODYSTRUCTURE UID)")
        .map_err(|e| e.to_string())?;

    let mut matched_uids = Vec::new();
    for fetch in headers.iter() {
        if looks_like_dmarc(fetch) {
            if let Some(uid) = fetch.uid {
                matched_uids.push(uid);
            }
        }
    }

    let mut processed = 0;
    for uid in matched_uids {
        let body_fetch = session.uid_fetch(uid.to_string(), "RFC822").map_err(|e| e.to_string())?;
        let Some(message) = body_fetch.iter().next().and_then(|f| f.body()) else {
            continue;
        };

        let result = tokio::runtime::Handle::current().block_on(pipeline.process(message, "imap"));
        match result {
            Ok(()) => {
                processed += 1;
                post_action(&mut session, uid, cfg, false);
            }
            Err(err) if err.is_storage() => {
                // storage is down, not the message; leave it for the next poll
                warn!("storage failure processing uid {uid}, leaving message for retry: {err}");
            }
            Err(err) => {
                warn!("uid {uid} could not be parsed, applying post-action policy: {err}");
                post_action(&mut session, uid, cfg, true);
            }
        }
    }

    session.logout().map_err(|e| e.to_string())?;
    Ok(processed)
}

/// `parse_failure` messages are archived/deleted per policy regardless
/// -- retrying a malformed input never fixes it (spec §4.J).
fn post_action(session: &mut Session<Box<dyn imap::ImapConnection>>, uid: imap::types::Uid, cfg: &ImapConfig, parse_failure: bool) {
    let _ = parse_failure;
    if cfg.delete_processed {
        if let Err(err) = session.uid_store(uid.to_string(), "+FLAGS (\\Deleted)") {
            warn!("failed to flag uid {uid} deleted: {err}");
            return;
        }
        if let Err(err) = session.expunge() {
            warn!("failed to expunge after deleting uid {uid}: {err}");
        }
    } else if let Some(archive) = &cfg.archive_mailbox {
        if archive != &cfg.mailbox {
            if let Err(err) = move_or_copy(session, uid, archive) {
                warn!("failed to archive uid {uid} to {archive}: {err}");
            }
        }
    }
}

/// RFC 6851 MOVE, falling back to COPY+STORE+EXPUNGE when the server
/// doesn't advertise it.
fn move_or_copy(session: &mut Session<Box<dyn imap::ImapConnection>>, uid: imap::types::Uid, target: &str) -> imap::error::Result<()> {
    match session.uid_mv(uid.to_string(), target) {
        Ok(()) => Ok(()),
        Err(_) => {
            session.uid_copy(uid.to_string(), target)?;
            session.uid_store(uid.to_string(), "+FLAGS (\\Deleted)")?;
            session.expunge()?;
            Ok(())
        }
    }
}

/// Matches on header/structure only, avoiding the cost of fetching the
/// full body for messages that obviously aren't reports (spec §4.J).
fn looks_like_dmarc(fetch: &Fetch) -> bool {
    if let Some(envelope) = fetch.envelope() {
        if let Some(subject) = envelope.subject.as_ref().and_then(|s| std::str::from_utf8(s).ok()) {
            let lower = subject.to_ascii_lowercase();
            if DMARC_SUBJECT_HINTS.iter().any(|hint| lower.contains(hint)) {
                return true;
            }
        }
    }
    if let Some(structure) = fetch.bodystructure() {
        return body_structure_matches(structure);
    }
    false
}

fn body_structure_matches(body: &BodyStructure) -> bool {
    match body {
        BodyStructure::Basic { common, .. } | BodyStructure::Text { common, .. } => {
            let ct = format!("{}/{}", common.ty.ty, common.ty.subtype).to_ascii_lowercase();
            DMARC_MIME_TYPES.iter().any(|mime| ct == *mime)
        }
        BodyStructure::Multipart { bodies, .. } => bodies.iter().any(body_structure_matches),
        _ => false,
    }
}
