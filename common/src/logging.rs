// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Logger construction for the daemon and its tests.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use anyhow::Context;
use slog::Drain;

/// How log records are rendered.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable terminal output
    Human,
    /// Bunyan-style newline-delimited JSON
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" | "text" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            x => Err(anyhow::anyhow!("unknown log format: {x}")),
        }
    }
}

fn drained_logger<D>(drain: D, name: String) -> slog::Logger
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!("name" => name))
}

/// Build the root logger.  Records go to `log_file` if one is named, to
/// stdout otherwise.
pub fn init(
    name: &str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    let name = name.to_string();
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            Ok(match log_format {
                LogFormat::Human => {
                    let decorator = slog_term::PlainDecorator::new(file);
                    let drain =
                        slog_term::FullFormat::new(decorator).build().fuse();
                    drained_logger(drain, name)
                }
                LogFormat::Json => {
                    let drain = slog_bunyan::with_name(
                        Box::leak(name.clone().into_boxed_str()),
                        file,
                    )
                        .build()
                        .fuse();
                    drained_logger(drain, name)
                }
            })
        }
        None => Ok(match log_format {
            LogFormat::Human => {
                let decorator = slog_term::TermDecorator::new().build();
                let drain =
                    slog_term::FullFormat::new(decorator).build().fuse();
                drained_logger(drain, name)
            }
            LogFormat::Json => {
                let drain =
                    slog_bunyan::with_name(
                        Box::leak(name.clone().into_boxed_str()),
                        LockedStdout,
                    )
                    .build()
                    .fuse();
                drained_logger(drain, name)
            }
        }),
    }
}

// stdout wrapper so the bunyan drain sees a Write that is safe to share
struct LockedStdout;

static STDOUT_LOCK: Mutex<()> = Mutex::new(());

impl Write for LockedStdout {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _guard = STDOUT_LOCK.lock().unwrap();
        std::io::stdout().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()
    }
}
