/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Bridges the core's typed event stream onto indicatif progress bars.

use colored::Colorize;
use human_bytes::human_bytes;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use cinder::progress::{Event, LogLevel};

use crate::logger::{INFO_SYMBOL, LOGGER_PREFIX};

fn styled_bar(total: u64) -> ProgressBar {
    let prefix = format!("{} {}", LOGGER_PREFIX.bold().yellow(), INFO_SYMBOL.yellow());

    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(&format!(
            "{}  [{{bar:40.yellow/red}}] {{bytes}}/{{total_bytes}} ({{elapsed}} / ETA: {{eta}}) {{msg}}",
            prefix
        ))
        .unwrap()
        .progress_chars("##-"),
    );

    pb
}

/// Consumes the event stream until the bus closes, rendering progress
/// bars for transfers and routing log events to the logger.
pub fn spawn_renderer(mut events: UnboundedReceiver<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut bar: Option<(String, ProgressBar)> = None;

        while let Some(event) = events.recv().await {
            match event {
                Event::Progress(p) => {
                    let key = format!(
                        "{}:{}",
                        p.phase,
                        p.partition.as_deref().unwrap_or_default()
                    );

                    if bar.as_ref().map(|(k, _)| k != &key).unwrap_or(true) {
                        if let Some((_, old)) = bar.take() {
                            old.finish_and_clear();
                        }
                        bar = Some((key.clone(), styled_bar(p.bytes_total)));
                    }

                    let (_, pb) = bar.as_ref().unwrap();
                    pb.set_position(p.bytes_done);

                    let label = match &p.partition {
                        Some(name) => format!("{} [{name}]", p.phase),
                        None => p.phase.to_string(),
                    };
                    pb.set_message(format!("{label} {}/s", human_bytes(p.speed_bps)));

                    if p.bytes_done >= p.bytes_total {
                        if let Some((_, pb)) = bar.take() {
                            pb.finish_and_clear();
                        }
                    }
                }
                Event::Log(log) => match log.level {
                    LogLevel::Debug => debug!("{}", log.message),
                    LogLevel::Info => info!("{}", log.message),
                    LogLevel::Warn => warn!("{}", log.message),
                    LogLevel::Error => log::error!("{}", log.message),
                },
                Event::StateChanged(state) => {
                    debug!("device state: {}", state.state);
                }
            }
        }

        if let Some((_, pb)) = bar.take() {
            pb.finish_and_clear();
        }
    })
}
