/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
mod erase;
mod flash;
mod info;
mod read;

use anyhow::Result;
use clap::Subcommand;

use crate::CliArgs;

pub use erase::EraseArgs;
pub use flash::FlashArgs;
pub use info::InfoArgs;
pub use read::ReadArgs;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Flash a payload, image folder or flash script to a device
    Flash(FlashArgs),
    /// Read a partition back into a file (EDL and BSL modes)
    Read(ReadArgs),
    /// Erase a partition
    Erase(EraseArgs),
    /// Show device, chip and partition information
    Info(InfoArgs),
}

pub async fn run(args: &CliArgs) -> Result<()> {
    match &args.command {
        Commands::Flash(cmd) => flash::run(cmd).await,
        Commands::Read(cmd) => read::run(cmd).await,
        Commands::Erase(cmd) => erase::run(cmd).await,
        Commands::Info(cmd) => info::run(cmd).await,
    }
}

/// Installs a Ctrl-C handler that requests cooperative cancellation.
pub(crate) fn hook_ctrl_c(cancel: cinder::CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("cancellation requested, finishing the current chunk...");
            cancel.cancel();
        }
    });
}
