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

//! Component K: one-shot file driver, used by `dmarc-herald --input`
//! instead of running a daemon collector. A directory is read
//! non-recursively; every regular file in it is handed to the pipeline
//! independently, and one bad file does not stop the rest.

use std::path::Path;

use log::{error, info};

use crate::pipeline::Pipeline;

/// Returns the number of inputs that failed to process, so the caller
/// can turn it into the process exit code (spec §4.K: 0 on full
/// success, 2 if any input failed).
pub async fn run(pipeline: &Pipeline, input: &Path) -> std::io::Result<usize> {
    let metadata = std::fs::metadata(input)?;
    if metadata.is_dir() {
        let mut failures = 0;
        let mut entries: Vec<_> = std::fs::read_dir(input)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if process_one(pipeline, &path).await.is_err() {
                failures += 1;
            }
        }
        Ok(failures)
    } else {
        match process_one(pipeline, input).await {
            Ok(()) => Ok(0),
            Err(()) => Ok(1),
        }
    }
}

async fn process_one(pipeline: &Pipeline, path: &Path) -> Result<(), ()> {
    let raw = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("could not read {}: {err}", path.display());
            return Err(());
        }
    };

    match pipeline.process(&raw, "file").await {
        Ok(()) => {
            info!("processed {}", path.display());
            Ok(())
        }
        Err(err) => {
            error!("failed to process {}: {err}", path.display());
            Err(())
        }
    }
}
