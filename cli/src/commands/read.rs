/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use human_bytes::human_bytes;
use log::info;

use cinder::FlashTarget;
use cinder::progress::FlashPhase;
use cinder::{CancelToken, ProgressBus, Timeouts};

use crate::commands::hook_ctrl_c;
use crate::connect::{self, DeviceArgs};
use crate::render::spawn_renderer;

#[derive(Args, Debug)]
pub struct ReadArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Partition to read back
    #[arg(short, long)]
    pub partition: String,
    /// Output file
    #[arg(short, long, value_name = "FILE")]
    pub out: PathBuf,
}

pub async fn run(args: &ReadArgs) -> Result<()> {
    let timeouts = Timeouts::default();
    let cancel = CancelToken::new();
    let (bus, events) = ProgressBus::new();

    hook_ctrl_c(cancel.clone());
    let renderer = spawn_renderer(events);

    let mut session =
        connect::establish(&args.device, timeouts, cancel.clone(), &bus).await?;

    let size = session
        .find_partition(&args.partition)
        .map(|p| p.size_bytes())
        .unwrap_or(0);

    let mut reporter = bus.reporter(FlashPhase::Extract, Some(&args.partition), size);
    let mut progress = |done: u64, _total: u64| {
        let delta = done.saturating_sub(reporter.bytes_done());
        reporter.add(delta);
    };

    session.read_partition(&args.partition, &args.out, &mut progress).await?;
    reporter.finish();

    // The renderer ends once every bus handle is gone.
    drop(reporter);
    drop(bus);
    drop(session);
    renderer.await.ok();

    let written = std::fs::metadata(&args.out).map(|m| m.len()).unwrap_or(0);
    info!(
        "read '{}' into {} ({})",
        args.partition,
        args.out.display(),
        human_bytes(written as f64)
    );
    Ok(())
}
