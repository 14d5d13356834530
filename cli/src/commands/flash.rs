/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, ValueEnum};
use log::{info, warn};

use cinder::error::Error;
use cinder::orchestrator::{FlashTask, ImageSource, PlatformHint, TaskOp};
use cinder::payload::{FileSource, HttpSource, PayloadExtractor};
use cinder::storage::Slot;
use cinder::{CancelToken, FlashOptions, Orchestrator, ProgressBus, Timeouts};

use crate::commands::hook_ctrl_c;
use crate::connect::{self, DeviceArgs, Mode, UsbMonitor};
use crate::render::spawn_renderer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SlotArg {
    A,
    B,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlatformArg {
    Unknown,
    Qualcomm,
    Mediatek,
}

#[derive(Args, Debug)]
pub struct FlashArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// A/B OTA payload: local `payload.bin` or an http(s) URL
    #[arg(long, value_name = "FILE_OR_URL", conflicts_with_all = ["folder", "script"])]
    pub payload: Option<String>,
    /// Directory of partition images (`boot.img` flashes `boot`)
    #[arg(long, value_name = "DIR", conflicts_with = "script")]
    pub folder: Option<PathBuf>,
    /// Flash script: `flash <partition> <file>` / `erase <partition>` lines
    #[arg(long, value_name = "FILE")]
    pub script: Option<PathBuf>,
    /// Target slot; `both` duplicates non-logical images to both slots
    #[arg(long, value_enum)]
    pub slot: Option<SlotArg>,
    /// Preserve userdata and metadata
    #[arg(long)]
    pub keep_data: bool,
    /// Wipe userdata after flashing (platform permitting)
    #[arg(long, conflicts_with = "keep_data")]
    pub wipe_data: bool,
    /// Clear factory-reset protection
    #[arg(long)]
    pub erase_frp: bool,
    /// Re-lock the bootloader after flashing
    #[arg(long)]
    pub lock: bool,
    /// Reboot the device once the job finishes
    #[arg(long)]
    pub auto_reboot: bool,
    /// Flash modem partitions in the main fastbootd pass
    #[arg(long)]
    pub pure_fbd: bool,
    /// Power off instead of resetting after an EDL flash
    #[arg(long)]
    pub power_flash: bool,
    /// Platform family, drives the data-wipe strategy
    #[arg(long, value_enum, default_value_t = PlatformArg::Unknown)]
    pub platform: PlatformArg,
}

/// Builds flash tasks out of an image directory.
fn tasks_from_folder(dir: &Path) -> Result<Vec<FlashTask>, Error> {
    let mut tasks = Vec::new();

    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::user_input(format!("{}: {e}", dir.display())))?;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("img") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        tasks.push(FlashTask::flash(stem, ImageSource::File(path.clone()), size));
    }

    if tasks.is_empty() {
        return Err(Error::user_input(format!("no .img files in {}", dir.display())));
    }
    Ok(tasks)
}

/// Parses a flash script: one operation per line, `#` comments.
fn tasks_from_script(path: &Path) -> Result<Vec<FlashTask>, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::user_input(format!("{}: {e}", path.display())))?;
    let base = path.parent().unwrap_or(Path::new("."));

    let mut tasks = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default();
        match verb {
            "flash" => {
                let (Some(partition), Some(file)) = (words.next(), words.next()) else {
                    return Err(Error::user_input(format!(
                        "{}:{}: flash needs <partition> <file>",
                        path.display(),
                        lineno + 1
                    )));
                };
                let image = base.join(file);
                let (size, exists) = match std::fs::metadata(&image) {
                    Ok(m) => (m.len(), true),
                    Err(_) => (0, false),
                };

                let mut task =
                    FlashTask::flash(partition, ImageSource::File(image), size);
                task.exists = exists;
                tasks.push(task);
            }
            "erase" => {
                let Some(partition) = words.next() else {
                    return Err(Error::user_input(format!(
                        "{}:{}: erase needs <partition>",
                        path.display(),
                        lineno + 1
                    )));
                };
                tasks.push(FlashTask::erase(partition));
            }
            "set_active" => {
                let slot = match words.next() {
                    Some("a") => Slot::A,
                    Some("b") => Slot::B,
                    _ => {
                        return Err(Error::user_input(format!(
                            "{}:{}: set_active needs a|b",
                            path.display(),
                            lineno + 1
                        )));
                    }
                };
                tasks.push(FlashTask {
                    op: TaskOp::SetActive(slot),
                    partition: String::new(),
                    source: None,
                    size_bytes: 0,
                    exists: true,
                });
            }
            other => {
                return Err(Error::user_input(format!(
                    "{}:{}: unknown operation '{other}'",
                    path.display(),
                    lineno + 1
                )));
            }
        }
    }

    Ok(tasks)
}

fn options_from(args: &FlashArgs) -> FlashOptions {
    let (target_slot, ab_both_slots) = match args.slot {
        Some(SlotArg::A) => (Slot::A, false),
        Some(SlotArg::B) => (Slot::B, false),
        Some(SlotArg::Both) => (Slot::A, true),
        None => (Slot::None, false),
    };

    FlashOptions {
        auto_reboot: args.auto_reboot,
        erase_frp: args.erase_frp,
        keep_data: args.keep_data,
        wipe_data: args.wipe_data,
        lock_bootloader_at_end: args.lock,
        ab_both_slots,
        pure_fbd: args.pure_fbd,
        power_flash: args.power_flash,
        target_slot,
        platform: match args.platform {
            PlatformArg::Qualcomm => PlatformHint::QualcommAbl,
            PlatformArg::Mediatek => PlatformHint::MediatekLk,
            PlatformArg::Unknown => match args.device.mode {
                Mode::Edl => PlatformHint::QualcommAbl,
                _ => PlatformHint::Unknown,
            },
        },
    }
}

pub async fn run(args: &FlashArgs) -> Result<()> {
    let timeouts = Timeouts::default();
    let cancel = CancelToken::new();
    let (bus, events) = ProgressBus::new();

    hook_ctrl_c(cancel.clone());
    let renderer = spawn_renderer(events);

    // Assemble the job before touching the device.
    let mut payload: Option<PayloadExtractor> = None;
    let tasks: Vec<FlashTask> = if let Some(source) = &args.payload {
        let extractor = if source.starts_with("http://") || source.starts_with("https://") {
            info!("streaming payload from {source}");
            PayloadExtractor::open(Box::new(HttpSource::open(source).await?)).await?
        } else {
            PayloadExtractor::open(Box::new(
                FileSource::open(Path::new(source)).await?,
            ))
            .await?
        };

        let tasks = extractor
            .manifest()
            .partitions
            .iter()
            .map(|p| FlashTask {
                op: TaskOp::Flash,
                partition: p.name.clone(),
                source: Some(ImageSource::PayloadPartition(p.name.clone())),
                size_bytes: p.new_info.size,
                exists: true,
            })
            .collect();
        payload = Some(extractor);
        tasks
    } else if let Some(folder) = &args.folder {
        tasks_from_folder(folder)?
    } else if let Some(script) = &args.script {
        tasks_from_script(script)?
    } else {
        return Err(Error::user_input("one of --payload, --folder or --script is required"))?;
    };

    info!("{} task(s) queued", tasks.len());

    let mut session =
        connect::establish(&args.device, timeouts.clone(), cancel.clone(), &bus).await?;

    let mut orchestrator =
        Orchestrator::new(options_from(args), timeouts, bus.clone(), cancel.clone());
    if let Some(monitor) = UsbMonitor::for_device(&args.device) {
        orchestrator = orchestrator.with_monitor(Arc::new(monitor));
    }

    let report = orchestrator.run(&mut session, tasks, payload.as_mut()).await?;

    // The renderer ends once every bus handle is gone.
    drop(orchestrator);
    drop(bus);
    drop(session);
    renderer.await.ok();

    for name in &report.flashed {
        info!("ok: {name}");
    }
    for name in &report.skipped {
        warn!("skipped: {name}");
    }
    for (name, reason) in &report.failed {
        log::error!("failed: {name}: {reason}");
    }

    if !report.all_ok() {
        return Err(Error::proto(format!(
            "{} of {} partitions failed",
            report.failed.len(),
            report.failed.len() + report.flashed.len()
        )))?;
    }

    info!("all done");
    Ok(())
}
