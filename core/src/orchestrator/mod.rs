/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! The flash orchestrator: turns a task list plus options into a
//! deterministic, cancellable, progress-reporting flash procedure across
//! vendor sessions.

pub mod plan;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::fastboot::RebootTarget;
use crate::payload::PayloadExtractor;
use crate::progress::{FlashPhase, LogLevel, ProgressBus, ProgressReporter};
use crate::session::{FlashTarget, Session};
use crate::storage::Slot;
use crate::timeouts::Timeouts;
use crate::transport::Transport;
use crate::watchdog::{Watchdog, WatchdogVerdict};

pub use plan::{FlashTask, ImageSource, Plan, TaskOp};

/// FRP erase candidates; the first success wins.
const FRP_PARTITIONS: &[&str] = &["frp", "config", "persistent"];

/// Platform family driving the wipe strategy of phase 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlatformHint {
    #[default]
    Unknown,
    QualcommAbl,
    MediatekLk,
}

#[derive(Debug, Clone)]
pub struct FlashOptions {
    pub auto_reboot: bool,
    pub erase_frp: bool,
    pub keep_data: bool,
    pub wipe_data: bool,
    pub lock_bootloader_at_end: bool,
    pub ab_both_slots: bool,
    pub pure_fbd: bool,
    pub power_flash: bool,
    /// Slot the job targets; `None` keeps the device's current slot.
    pub target_slot: Slot,
    pub platform: PlatformHint,
}

impl Default for FlashOptions {
    fn default() -> Self {
        FlashOptions {
            auto_reboot: false,
            erase_frp: false,
            keep_data: false,
            wipe_data: false,
            lock_bootloader_at_end: false,
            ab_both_slots: false,
            pure_fbd: false,
            power_flash: false,
            target_slot: Slot::None,
            platform: PlatformHint::Unknown,
        }
    }
}

/// Aggregate job outcome. Per-partition failures do not abort the job
/// (except disconnects), so success is a matter of degree.
#[derive(Debug, Default)]
pub struct FlashReport {
    pub flashed: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<String>,
}

impl FlashReport {
    pub fn all_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Reconnect source for device mode transitions. Implementations poll
/// the platform device list (every few seconds) until the device
/// reappears or the timeout lapses.
#[async_trait]
pub trait DeviceMonitor: Send + Sync {
    async fn wait_for_device(&self, timeout: Duration) -> Result<Box<dyn Transport>>;
}

/// Per-job scratch directory under the process temp root; removed on
/// every exit path.
struct JobScratch {
    path: PathBuf,
}

impl JobScratch {
    fn create() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let path = std::env::temp_dir().join(format!(
            "cinder-job-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&path)?;
        Ok(JobScratch { path })
    }

    fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for JobScratch {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            debug!("scratch cleanup of {} failed: {e}", self.path.display());
        }
    }
}

pub struct Orchestrator {
    options: FlashOptions,
    timeouts: Timeouts,
    bus: ProgressBus,
    cancel: CancelToken,
    monitor: Option<Arc<dyn DeviceMonitor>>,
}

impl Orchestrator {
    pub fn new(
        options: FlashOptions,
        timeouts: Timeouts,
        bus: ProgressBus,
        cancel: CancelToken,
    ) -> Self {
        Orchestrator { options, timeouts, bus, cancel, monitor: None }
    }

    /// Injects the reconnect source used across mode transitions.
    pub fn with_monitor(mut self, monitor: Arc<dyn DeviceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Runs one flash job. The session is borrowed for the duration and
    /// may change identity across mode transitions (fastboot ->
    /// fastbootd).
    pub async fn run(
        &self,
        session: &mut Session,
        tasks: Vec<FlashTask>,
        mut payload: Option<&mut PayloadExtractor>,
    ) -> Result<FlashReport> {
        self.cancel.check()?;

        let scratch = JobScratch::create()?;
        let mut report = FlashReport::default();

        let wd_cancel = self.cancel.clone();
        let wd_bus = self.bus.clone();
        let watchdog = Watchdog::start(
            "flash-job",
            self.timeouts.firehose_io,
            Box::new(|name, elapsed, strikes| {
                warn!("'{name}' stalled for {elapsed:?} (strike {strikes})");
                WatchdogVerdict::Continue
            }),
            move || {
                wd_bus.log(LogLevel::Error, "watchdog expired, tearing the session down");
                wd_cancel.cancel();
            },
        );

        // Phase 1: resolve payload references, then normalize.
        let tasks = self.resolve_payload_tasks(tasks, payload.as_deref_mut(), &scratch).await?;
        let split_modem =
            matches!(session, Session::Fastboot(_)) && !self.options.pure_fbd;
        let mut plan = plan::normalize(tasks, self.options.keep_data, !split_modem);
        report.skipped.extend(plan.dropped.drain(..));

        if plan.is_empty() {
            info!("nothing to do after normalization");
            return Ok(report);
        }

        // Phase 2: pick the right fastboot flavor for logical partitions.
        let logical = self.select_mode(session, &mut plan, &mut report).await?;

        // Phase 3: slot alignment before logical writes.
        self.prepare_slots(session).await?;

        // Phase 4: stale virtual A/B snapshots would corrupt logical
        // writes; cancelling them is best-effort.
        if let Session::Fastboot(fb) = &mut *session
            && fb.features.virtual_ab
        {
            fb.client.snapshot_update_cancel().await?;
        }

        // Control tasks run before the flash loops.
        for task in &plan.control {
            self.cancel.check()?;
            self.run_control_task(session, task, &mut report).await?;
        }

        // Phases 5 and 6: the flash loops.
        let total = plan.total_flash_bytes();
        let mut reporter = self.bus.reporter(FlashPhase::Flash, None, total);

        for task in &plan.main {
            self.flash_one(session, task, &logical, &mut reporter, &watchdog, &mut report)
                .await?;
        }

        if !plan.modem.is_empty() {
            self.modem_pass(session, &plan, &logical, &mut reporter, &watchdog, &mut report)
                .await?;
        }

        // Phase 7: FRP and data wipe policy.
        self.erase_frp(session, &mut report).await?;
        self.wipe_data(session, &mut report).await?;

        // Phase 8: lock and reboot, both best-effort.
        self.finish(session).await;

        reporter.finish();
        watchdog.stop();

        info!(
            "job done: {} flashed, {} failed, {} skipped",
            report.flashed.len(),
            report.failed.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Extracts payload-referenced tasks into the job scratch directory.
    async fn resolve_payload_tasks(
        &self,
        tasks: Vec<FlashTask>,
        mut payload: Option<&mut PayloadExtractor>,
        scratch: &JobScratch,
    ) -> Result<Vec<FlashTask>> {
        let mut resolved = Vec::with_capacity(tasks.len());

        for mut task in tasks {
            let Some(ImageSource::PayloadPartition(part_name)) = task.source.clone() else {
                resolved.push(task);
                continue;
            };

            self.cancel.check()?;
            let extractor = payload.as_deref_mut().ok_or_else(|| {
                Error::user_input(format!(
                    "task '{}' references a payload partition but no payload was given",
                    task.partition
                ))
            })?;

            let size = extractor
                .partition(&part_name)
                .map(|p| p.new_info.size)
                .ok_or_else(|| {
                    Error::user_input(format!("payload has no partition '{part_name}'"))
                })?;

            let out = scratch.file(&format!("{part_name}.img"));
            let mut reporter =
                self.bus.reporter(FlashPhase::Extract, Some(&part_name), size);
            let mut progress = |done: u64, _: u64| {
                let delta = done.saturating_sub(reporter.bytes_done());
                reporter.add(delta);
            };

            extractor
                .extract_partition(&part_name, &out, None, &self.cancel, &mut progress)
                .await?;
            reporter.finish();

            task.source = Some(ImageSource::File(out));
            task.size_bytes = size;
            resolved.push(task);
        }

        Ok(resolved)
    }

    /// Determines which tasks target logical partitions and, when needed,
    /// moves the device into fastbootd. Without a reconnect monitor the
    /// logical tasks are skipped with an advisory instead.
    async fn select_mode(
        &self,
        session: &mut Session,
        plan: &mut Plan,
        report: &mut FlashReport,
    ) -> Result<HashMap<String, bool>> {
        let mut logical = HashMap::new();

        let Session::Fastboot(fb) = &mut *session else {
            return Ok(logical);
        };

        for task in &plan.main {
            let is_logical = fb.client.is_logical(&task.partition).await;
            logical.insert(task.partition.clone(), is_logical);
        }

        let any_logical = logical.values().any(|&l| l);
        if !any_logical || fb.features.is_userspace {
            return Ok(logical);
        }

        info!("logical partitions need fastbootd, switching");
        if self.monitor.is_none() {
            self.bus.log(
                LogLevel::Warn,
                "cannot reach fastbootd without a device monitor; skipping logical partitions",
            );
            plan.main.retain(|t| {
                let keep = !logical.get(&t.partition).copied().unwrap_or(false);
                if !keep {
                    report.skipped.push(t.partition.clone());
                }
                keep
            });
            return Ok(logical);
        }

        self.switch_fastboot_mode(session, RebootTarget::Fastboot).await?;
        Ok(logical)
    }

    /// Reboots between fastboot flavors and reconnects through the
    /// monitor. Cancellation during the wait returns immediately.
    async fn switch_fastboot_mode(
        &self,
        session: &mut Session,
        target: RebootTarget,
    ) -> Result<()> {
        let Session::Fastboot(fb) = &mut *session else {
            return Err(Error::internal("mode switch on a non-fastboot session"));
        };

        let monitor = self
            .monitor
            .as_ref()
            .ok_or_else(|| Error::unsupported("mode switch needs a device monitor"))?;

        fb.client.reboot(target).await?;
        self.bus.state_changed("reconnect-wait");

        let transport = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = monitor.wait_for_device(self.timeouts.reconnect_wait) => result?,
        };

        *session = Session::connect_fastboot(
            transport,
            self.timeouts.clone(),
            self.cancel.clone(),
            &self.bus,
        )
        .await?;

        Ok(())
    }

    /// Phase 3: align the active slot before rebuilding logical
    /// partitions on the target slot.
    async fn prepare_slots(&self, session: &mut Session) -> Result<()> {
        let target = self.options.target_slot;
        if !self.options.ab_both_slots || target == Slot::None {
            return Ok(());
        }

        let current = session.current_slot();
        if current == target || current == Slot::None {
            return Ok(());
        }

        match session {
            Session::Fastboot(fb) => {
                info!("switching active slot {current} -> {target} before logical writes");
                fb.client.set_active(target).await?;
                session.invalidate_tables();
            }
            _ => {
                // EDL/BSL have no set-active command; the super image in
                // the task list re-creates the metadata instead.
                debug!("slot alignment deferred to the super image flash");
            }
        }

        Ok(())
    }

    async fn run_control_task(
        &self,
        session: &mut Session,
        task: &FlashTask,
        report: &mut FlashReport,
    ) -> Result<()> {
        let outcome = match &task.op {
            TaskOp::Erase => session.erase(&task.partition).await,
            TaskOp::SetActive(slot) => match session {
                Session::Fastboot(fb) => fb.client.set_active(*slot).await,
                _ => Err(Error::unsupported("set-active outside fastboot")),
            },
            TaskOp::Reboot(target) => match session {
                Session::Fastboot(fb) => fb.client.reboot(*target).await,
                _ => session.reboot().await,
            },
            TaskOp::Flash => Err(Error::internal("flash task in the control list")),
        };

        match outcome {
            Ok(()) => report.flashed.push(task.partition.clone()),
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!("control task on '{}' failed: {e}", task.partition);
                report.failed.push((task.partition.clone(), e.to_string()));
            }
        }

        Ok(())
    }

    /// Targets a flash task resolves to, given slot policy.
    async fn resolve_targets(
        &self,
        session: &mut Session,
        task: &FlashTask,
        logical: &HashMap<String, bool>,
    ) -> Vec<String> {
        let base = task.partition.clone();
        let is_logical = logical.get(&base).copied().unwrap_or(false);

        let replicated = match session {
            Session::Fastboot(fb) => {
                matches!(
                    fb.client.getvar(&format!("has-slot:{base}")).await.as_deref(),
                    Ok("yes")
                )
            }
            _ => session.find_partition(&format!("{base}_a")).is_some(),
        };

        if !replicated {
            return vec![base];
        }

        if self.options.ab_both_slots && !is_logical {
            return vec![format!("{base}_a"), format!("{base}_b")];
        }

        let slot = match self.options.target_slot {
            Slot::None => match session.current_slot() {
                Slot::None => Slot::A,
                s => s,
            },
            s => s,
        };
        vec![format!("{base}{}", slot.suffix())]
    }

    /// One task of the main/modem flash loop: resolve targets, stream the
    /// image, aggregate failures.
    async fn flash_one(
        &self,
        session: &mut Session,
        task: &FlashTask,
        logical: &HashMap<String, bool>,
        reporter: &mut ProgressReporter,
        watchdog: &Watchdog,
        report: &mut FlashReport,
    ) -> Result<()> {
        self.cancel.check()?;

        let Some(ImageSource::File(path)) = &task.source else {
            return Err(Error::internal(format!(
                "task '{}' reached the flash loop unresolved",
                task.partition
            )));
        };

        if !task.exists {
            report.skipped.push(task.partition.clone());
            return Ok(());
        }

        let targets = self.resolve_targets(session, task, logical).await;
        let copies = targets.len() as u64;
        let budget_per_copy = task.size_bytes / copies;

        for target in &targets {
            self.cancel.check()?;
            info!("flashing '{target}' from {}", path.display());
            self.bus.state_changed(format!("flash:{target}"));

            let mut copy_done = 0u64;
            let result = {
                let mut progress = |done: u64, total: u64| {
                    watchdog.feed();
                    // Each slot copy accounts its share of the task budget.
                    let scaled = if total == 0 {
                        budget_per_copy
                    } else {
                        (done as u128 * budget_per_copy as u128 / total as u128) as u64
                    };
                    let delta = scaled.saturating_sub(copy_done);
                    copy_done += delta;
                    reporter.add(delta);
                };
                session.flash(target, path, &mut progress).await
            };

            match result {
                Ok(()) => {
                    reporter.add(budget_per_copy.saturating_sub(copy_done));
                    report.flashed.push(target.clone());
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if e.is_session_fatal() => {
                    report.failed.push((target.clone(), e.to_string()));
                    return Err(e);
                }
                Err(e) => {
                    warn!("flashing '{target}' failed: {e}");
                    report.failed.push((target.clone(), e.to_string()));
                    reporter.add(budget_per_copy.saturating_sub(copy_done));
                }
            }
        }

        Ok(())
    }

    /// Phase 6: modem partitions flash from bootloader fastboot, then the
    /// session returns to fastbootd when later phases need it.
    async fn modem_pass(
        &self,
        session: &mut Session,
        plan: &Plan,
        logical: &HashMap<String, bool>,
        reporter: &mut ProgressReporter,
        watchdog: &Watchdog,
        report: &mut FlashReport,
    ) -> Result<()> {
        let in_userspace = match &*session {
            Session::Fastboot(fb) => fb.features.is_userspace,
            _ => return Err(Error::internal("modem pass outside fastboot")),
        };

        if in_userspace {
            info!("modem images need the bootloader, leaving fastbootd");
            self.switch_fastboot_mode(session, RebootTarget::Bootloader).await?;
        }

        for task in &plan.modem {
            self.flash_one(session, task, logical, reporter, watchdog, report).await?;
        }

        let needs_userspace_later = self.options.erase_frp || self.options.wipe_data;
        if in_userspace && needs_userspace_later {
            info!("returning to fastbootd for the remaining steps");
            self.switch_fastboot_mode(session, RebootTarget::Fastboot).await?;
        }

        Ok(())
    }

    /// Phase 7a: best-effort FRP clear; the first candidate that erases
    /// wins, and total failure is only an advisory.
    async fn erase_frp(&self, session: &mut Session, report: &mut FlashReport) -> Result<()> {
        if !self.options.erase_frp {
            return Ok(());
        }

        for candidate in FRP_PARTITIONS {
            self.cancel.check()?;
            match session.erase(candidate).await {
                Ok(()) => {
                    info!("FRP cleared via '{candidate}'");
                    report.flashed.push(format!("{candidate} (erased)"));
                    return Ok(());
                }
                Err(e) if e.is_session_fatal() => return Err(e),
                Err(e) => debug!("FRP candidate '{candidate}': {e}"),
            }
        }

        self.bus.log(LogLevel::Warn, "no FRP partition could be erased");
        Ok(())
    }

    /// Phase 7b: data wipe, platform-dependent.
    async fn wipe_data(&self, session: &mut Session, report: &mut FlashReport) -> Result<()> {
        if self.options.keep_data || !self.options.wipe_data {
            return Ok(());
        }

        match self.options.platform {
            PlatformHint::QualcommAbl => {
                for partition in ["userdata", "metadata"] {
                    self.cancel.check()?;
                    match session.erase(partition).await {
                        Ok(()) => report.flashed.push(format!("{partition} (erased)")),
                        Err(e) if e.is_session_fatal() => return Err(e),
                        Err(e) => {
                            warn!("wiping '{partition}' failed: {e}");
                            report.failed.push((partition.to_string(), e.to_string()));
                        }
                    }
                }
            }
            PlatformHint::MediatekLk | PlatformHint::Unknown => {
                self.bus.log(
                    LogLevel::Warn,
                    "data wipe is not reliable on this platform; wipe manually from recovery",
                );
            }
        }

        Ok(())
    }

    /// Phase 8: lock and reboot, both best-effort.
    async fn finish(&self, session: &mut Session) {
        if self.options.lock_bootloader_at_end {
            if let Session::Fastboot(fb) = &mut *session {
                match fb.client.flashing("lock").await {
                    Ok(_) => info!("bootloader lock requested"),
                    Err(e) => warn!("bootloader lock failed: {e}"),
                }
            } else {
                warn!("bootloader locking is a fastboot operation, skipped");
            }
        }

        if self.options.auto_reboot {
            // Power-flash jobs leave the device off instead of booting it.
            let result = match (&mut *session, self.options.power_flash) {
                (Session::Edl(s), true) => {
                    s.firehose.power(crate::firehose::PowerAction::Off).await
                }
                _ => session.reboot().await,
            };

            if let Err(e) = result {
                warn!("final reboot failed: {e}");
            }
        }
    }
}
