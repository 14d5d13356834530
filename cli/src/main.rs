/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
mod commands;
mod connect;
mod logger;
mod render;

use clap::Parser;
use commands::Commands;
use logger::init_logger;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliArgs {
    /// Enable verbose logging, including wire-level traces
    #[arg(short, long)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logger(args.verbose);

    if let Err(e) = commands::run(&args).await {
        log::error!("{e:#}");

        let code = e
            .downcast_ref::<cinder::Error>()
            .map(cinder::Error::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
