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
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use simple_logger::SimpleLogger;
use tokio_util::sync::CancellationToken;

mod collectors;
mod config;
mod enrichment;
mod envelope;
mod error;
mod metrics;
mod model;
mod parsers;
mod pipeline;
mod sinks;
mod sniffer;

use config::{FileOutputFormat, HeraldConfig};
use enrichment::Enricher;
use pipeline::Pipeline;
use sinks::Dispatcher;

#[derive(Parser, Debug)]
#[command(version, author, about, long_about = "Copyright (C) 2025 nerou GmbH This program comes with ABSOLUTELY NO WARRANTY. This is free software, and you are welcome to redistribute it under certain conditions.")]
struct Args {
    #[arg(short, long, value_name = "FILE.yml", default_value = "dmarc-herald.yml")]
    config: PathBuf,

    /// process a file or directory once and exit, instead of running the daemon collectors
    #[arg(short, long, value_name = "PATH")]
    input: Option<PathBuf>,

    /// write output to this file instead of the configured sinks (one-shot mode only)
    #[arg(short, long, value_name = "PATH", requires = "input")]
    output: Option<PathBuf>,

    /// output format for --output
    #[arg(short, long, value_enum, default_value_t = FileOutputFormat::Json, requires = "output")]
    format: FileOutputFormat,

    /// run the HTTP/IMAP daemon collectors, ignoring --input if also given
    #[arg(short, long)]
    daemon: bool,
}

#[actix_web::main]
async fn main() -> ExitCode {
    SimpleLogger::new().env().init().unwrap();

    let args = Args::parse();

    let cfg = match config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::from(1);
        }
    };

    if args.daemon || args.input.is_none() {
        let pipeline = match build_pipeline(&cfg) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                log::error!("{err}");
                return ExitCode::from(1);
            }
        };
        return run_daemon(cfg, pipeline).await;
    }

    let input = args.input.as_ref().expect("checked above");
    let pipeline = match &args.output {
        Some(output) => build_file_pipeline(&cfg, output, args.format),
        None => build_pipeline(&cfg),
    };
    let pipeline = match pipeline {
        Ok(pipeline) => pipeline,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::from(1);
        }
    };
    run_once(&pipeline, input).await
}

fn build_pipeline(cfg: &HeraldConfig) -> Result<Pipeline, error::Error> {
    let enricher = Enricher::new(&cfg.enrichment);
    let dispatcher = Dispatcher::from_config(&cfg.sinks)?;
    Ok(Pipeline::new(enricher, dispatcher))
}

/// Builds a one-shot pipeline that writes straight to `output` in
/// `format`, bypassing the configured sinks entirely -- backs
/// `--output`/`--format`.
fn build_file_pipeline(cfg: &HeraldConfig, output: &PathBuf, format: FileOutputFormat) -> Result<Pipeline, error::Error> {
    let enricher = Enricher::new(&cfg.enrichment);
    let file_cfg = config::FileSinkConfig { path: output.clone(), format };
    let dispatcher = Dispatcher::to_file_only(&file_cfg)?;
    Ok(Pipeline::new(enricher, dispatcher))
}

/// Component K entry point: one-shot file driver.
async fn run_once(pipeline: &Pipeline, path: &PathBuf) -> ExitCode {
    match collectors::file::run(pipeline, path).await {
        Ok(0) => ExitCode::from(0),
        Ok(_) => ExitCode::from(2),
        Err(err) => {
            log::error!("could not read {}: {err}", path.display());
            ExitCode::from(2)
        }
    }
}

/// Runs the HTTP collector (always) and the IMAP collector (if
/// configured) until a termination signal requests a shared graceful
/// shutdown, with a 30s total budget (spec §5).
async fn run_daemon(cfg: HeraldConfig, pipeline: Pipeline) -> ExitCode {
    let pipeline = Arc::new(pipeline);
    let shutdown = CancellationToken::new();

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_termination().await;
        log::info!("shutdown signal received, draining in-flight work");
        signal_shutdown.cancel();
    });

    let http_shutdown = shutdown.clone();
    let http_pipeline = pipeline.clone();
    let http_task = tokio::spawn(collectors::http::serve(cfg.http, http_pipeline, http_shutdown));

    let imap_task = cfg.imap.map(|imap_cfg| {
        let imap_shutdown = shutdown.clone();
        let imap_pipeline = pipeline.clone();
        tokio::spawn(collectors::imap::poll(imap_cfg, imap_pipeline, imap_shutdown))
    });

    let http_result = http_task.await;
    if let Some(task) = imap_task {
        let _ = task.await;
    }

    match http_result {
        Ok(Ok(())) => ExitCode::from(0),
        Ok(Err(err)) => {
            log::error!("http collector exited with error: {err}");
            ExitCode::from(1)
        }
        Err(err) => {
            log::error!("http collector task panicked: {err}");
            ExitCode::from(1)
        }
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
