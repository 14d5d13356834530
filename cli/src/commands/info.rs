/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use human_bytes::human_bytes;

use cinder::chipdb;
use cinder::session::Session;
use cinder::{CancelToken, ProgressBus, Timeouts};

use crate::connect::{self, DeviceArgs, Mode};
use crate::render::spawn_renderer;

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
}

pub async fn run(args: &InfoArgs) -> Result<()> {
    let timeouts = Timeouts::default();
    let cancel = CancelToken::new();
    let (bus, events) = ProgressBus::new();
    let renderer = spawn_renderer(events);

    // EDL identity is available without staging a programmer; use the
    // lightweight probe when no loader was supplied.
    if args.device.mode == Mode::Edl && args.device.loader.is_none() {
        let transport = connect::open_transport(&args.device.device, args.device.interface).await?;
        let (identity, _transport) =
            Session::probe_edl_identity(transport, timeouts, cancel).await?;

        println!("{}", "Qualcomm EDL device".bold());
        println!("  serial:   0x{:08X}", identity.serial);
        println!("  chip:     {}", chipdb::describe(identity.msm_id()));
        println!("  oem id:   0x{:04X}", identity.oem_id());
        println!("  model id: 0x{:04X}", identity.model_id());
        println!("  pk hash:  {}", hex::encode(&identity.pk_hash));

        drop(bus);
        renderer.await.ok();
        return Ok(());
    }

    let mut session = connect::establish(&args.device, timeouts, cancel, &bus).await?;

    println!("{} {}", "Connected:".bold(), session.family());

    match &mut session {
        Session::Fastboot(s) => {
            let f = &s.features;
            println!("  userspace fastboot: {}", f.is_userspace);
            println!("  slots:              {} (current {})", f.slot_count, f.current_slot);
            println!("  virtual A/B:        {}", f.virtual_ab);
            println!("  max download:       {}", human_bytes(f.max_download_size as f64));
        }
        Session::Edl(s) => {
            for (lun, table) in s.tables.iter().enumerate() {
                println!("  LUN {lun}: {} partitions", table.len());
                for p in table.iter() {
                    println!(
                        "    {:<24} {:>12}  @ sector {}",
                        p.name,
                        human_bytes(p.size_bytes() as f64),
                        p.start_sector
                    );
                }
            }

            match s.read_logical_partitions().await {
                Ok(logical) if !logical.is_empty() => {
                    println!("  super: {} logical partitions", logical.len());
                    for p in &logical {
                        println!(
                            "    {:<24} {:>12}  (logical)",
                            p.name,
                            human_bytes(p.size_bytes() as f64)
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => log::debug!("no readable LP metadata: {e}"),
            }
        }
        Session::Bsl(s) => {
            println!("  partitions: {}", s.table.len());
            for p in s.table.iter() {
                println!("    {:<24} {:>12}", p.name, human_bytes(p.size_bytes() as f64));
            }
        }
    }

    drop(bus);
    drop(session);
    renderer.await.ok();
    Ok(())
}
