/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use anyhow::Result;
use clap::Args;
use log::info;

use cinder::FlashTarget;
use cinder::{CancelToken, ProgressBus, Timeouts};

use crate::commands::hook_ctrl_c;
use crate::connect::{self, DeviceArgs};
use crate::render::spawn_renderer;

#[derive(Args, Debug)]
pub struct EraseArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Partition to erase
    #[arg(short, long)]
    pub partition: String,
}

pub async fn run(args: &EraseArgs) -> Result<()> {
    let timeouts = Timeouts::default();
    let cancel = CancelToken::new();
    let (bus, events) = ProgressBus::new();

    hook_ctrl_c(cancel.clone());
    let renderer = spawn_renderer(events);

    let mut session =
        connect::establish(&args.device, timeouts, cancel.clone(), &bus).await?;

    session.erase(&args.partition).await?;

    drop(bus);
    drop(session);
    renderer.await.ok();

    info!("erased '{}'", args.partition);
    Ok(())
}
