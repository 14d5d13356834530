/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Vendor sessions: one connected device, one protocol stack.
//!
//! The vendor dispatch is a tagged variant plus a small capability trait;
//! vendor-specific flashing strategy (slot duplication, modem staging)
//! lives in the orchestrator, not here.

use std::path::Path;

use async_trait::async_trait;
use log::{info, warn};

use crate::auth::{AuthOutcome, AuthStrategy};
use crate::bsl::{BslClient, ChipProfile, FdlStage};
use crate::cancel::CancelToken;
use crate::chipdb;
use crate::error::{Error, Result};
use crate::fastboot::{FastbootClient, FastbootFeatures, RebootTarget};
use crate::firehose::{FirehoseClient, PowerAction};
use crate::progress::{FlashPhase, ProgressBus};
use crate::sahara::{ChipIdentity, SaharaClient};
use crate::storage::{Partition, PartitionTable, Slot, StorageKind, lp};
use crate::timeouts::Timeouts;
use crate::transport::Transport;

/// UFS exposes at most this many user LUNs worth probing for a GPT.
const MAX_LUNS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorFamily {
    Fastboot,
    Qualcomm,
    Spreadtrum,
}

impl std::fmt::Display for VendorFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VendorFamily::Fastboot => "fastboot",
            VendorFamily::Qualcomm => "qualcomm-edl",
            VendorFamily::Spreadtrum => "spreadtrum-bsl",
        };
        f.write_str(name)
    }
}

/// Shared per-operation progress callback shape.
pub type Progress<'a> = &'a mut (dyn FnMut(u64, u64) + Send);

/// The capability surface the orchestrator flashes through.
#[async_trait]
pub trait FlashTarget: Send {
    async fn flash(&mut self, partition: &str, image: &Path, progress: Progress<'_>)
    -> Result<()>;
    async fn erase(&mut self, partition: &str) -> Result<()>;
    async fn read_partition(
        &mut self,
        partition: &str,
        out: &Path,
        progress: Progress<'_>,
    ) -> Result<()>;
    async fn reboot(&mut self) -> Result<()>;
}

/// A fastboot device, with its probed capability set.
pub struct FastbootSession {
    pub client: FastbootClient,
    pub features: FastbootFeatures,
}

/// A Qualcomm device past Sahara, speaking Firehose.
pub struct EdlSession {
    pub firehose: FirehoseClient,
    /// One table per LUN that answered a GPT read.
    pub tables: Vec<PartitionTable>,
}

impl EdlSession {
    /// Decodes the LP metadata at the head of `super`, exposing the
    /// logical partitions it describes. Devices without a super
    /// partition yield an empty list.
    pub async fn read_logical_partitions(&mut self) -> Result<Vec<Partition>> {
        let Some(super_part) = self.tables.iter().find_map(|t| t.find("super")).cloned() else {
            return Ok(Vec::new());
        };

        let ss = super_part.sector_size as u64;
        let sectors_for = |bytes: u64| bytes.div_ceil(ss).max(1);

        let geometry_sector = super_part.start_sector + lp::PARTITION_RESERVED_BYTES / ss;
        let geometry_raw = self
            .firehose
            .read_sectors(super_part.lun, geometry_sector, sectors_for(lp::GEOMETRY_SIZE))
            .await?;
        let geometry = lp::Geometry::parse(&geometry_raw)?;

        let metadata_sector = super_part.start_sector + geometry.metadata_offset(0) / ss;
        let metadata_raw = self
            .firehose
            .read_sectors(
                super_part.lun,
                metadata_sector,
                sectors_for(geometry.metadata_max_size as u64),
            )
            .await?;
        let metadata = lp::LpMetadata::parse(&metadata_raw)?;

        info!("super carries {} logical partitions", metadata.partitions.len());
        Ok(metadata.to_partitions(&super_part))
    }
}

/// A Spreadtrum device with FDL2 running.
pub struct BslSession {
    pub client: BslClient,
    pub table: PartitionTable,
}

/// One connected device session. Exactly one protocol operation may be
/// in flight at a time; the orchestrator borrows it for a job.
pub enum Session {
    Fastboot(FastbootSession),
    Edl(EdlSession),
    Bsl(BslSession),
}

impl Session {
    pub fn family(&self) -> VendorFamily {
        match self {
            Session::Fastboot(_) => VendorFamily::Fastboot,
            Session::Edl(_) => VendorFamily::Qualcomm,
            Session::Bsl(_) => VendorFamily::Spreadtrum,
        }
    }

    /// Connects to a device already in fastboot(d) and probes features.
    pub async fn connect_fastboot(
        mut transport: Box<dyn Transport>,
        timeouts: Timeouts,
        cancel: CancelToken,
        bus: &ProgressBus,
    ) -> Result<Session> {
        transport.open().await?;
        let mut client = FastbootClient::new(transport, timeouts, cancel);
        let features = client.probe_features().await?;

        bus.state_changed(if features.is_userspace { "fastbootd" } else { "fastboot" });
        Ok(Session::Fastboot(FastbootSession { client, features }))
    }

    /// Full EDL bring-up: Sahara upload, auth hooks, `<configure>`, GPT
    /// scan across LUNs.
    pub async fn connect_edl(
        transport: Box<dyn Transport>,
        programmer: &[u8],
        storage: StorageKind,
        auth: &AuthStrategy,
        timeouts: Timeouts,
        cancel: CancelToken,
        bus: &ProgressBus,
    ) -> Result<Session> {
        let mut sahara = SaharaClient::new(transport, timeouts.clone(), cancel.clone());

        bus.state_changed("sahara");
        let mut reporter =
            bus.reporter(FlashPhase::LoaderUpload, None, programmer.len() as u64);
        let mut progress = |done: u64, _total: u64| {
            let delta = done.saturating_sub(reporter.bytes_done());
            reporter.add(delta);
        };
        sahara.upload_programmer(programmer, &mut progress).await?;
        reporter.finish();

        let mut firehose =
            FirehoseClient::new(sahara.into_transport(), storage, timeouts, cancel);

        bus.state_changed("firehose");
        match auth.pre_configure(&mut firehose).await {
            AuthOutcome::Fatal(msg) => return Err(Error::unauthorized(msg)),
            AuthOutcome::RecoverableFailure(msg) => warn!("auth downgrade: {msg}"),
            AuthOutcome::Ok => {}
        }

        firehose.configure().await?;

        match auth.post_configure(&mut firehose).await {
            AuthOutcome::Fatal(msg) => return Err(Error::unauthorized(msg)),
            AuthOutcome::RecoverableFailure(msg) => warn!("auth downgrade: {msg}"),
            AuthOutcome::Ok => {}
        }

        let mut tables = Vec::new();
        for lun in 0..MAX_LUNS {
            match firehose.gpt_read(lun, None).await {
                Ok(table) => tables.push(table),
                Err(e) => {
                    if lun == 0 {
                        return Err(e);
                    }
                    // Further LUNs simply don't exist on eMMC parts.
                    break;
                }
            }
        }

        bus.state_changed("firehose-ready");
        Ok(Session::Edl(EdlSession { firehose, tables }))
    }

    /// Reads the chip identity over Sahara command mode without staging a
    /// programmer, then resets the Sahara state for a later full connect.
    pub async fn probe_edl_identity(
        transport: Box<dyn Transport>,
        timeouts: Timeouts,
        cancel: CancelToken,
    ) -> Result<(ChipIdentity, Box<dyn Transport>)> {
        let mut sahara = SaharaClient::new(transport, timeouts, cancel);
        let identity = sahara.read_device_info().await?;
        info!("EDL device: {}", chipdb::describe(identity.msm_id()));
        sahara.reset().await?;
        Ok((identity, sahara.into_transport()))
    }

    /// Full BSL bring-up: BROM handshake, FDL1/FDL2 staging, transcode
    /// off, partition table read.
    pub async fn connect_bsl(
        transport: Box<dyn Transport>,
        chip: &ChipProfile,
        fdl1: &[u8],
        fdl2: &[u8],
        timeouts: Timeouts,
        cancel: CancelToken,
        bus: &ProgressBus,
    ) -> Result<Session> {
        let mut client = BslClient::new(transport, timeouts, cancel);

        bus.state_changed("brom");
        let version = client.handshake().await?;
        info!("BROM version: {version}");

        let total = (fdl1.len() + fdl2.len()) as u64;
        let mut reporter = bus.reporter(FlashPhase::LoaderUpload, None, total);

        let mut sent_before = 0u64;
        {
            let mut progress = |done: u64, _: u64| {
                let delta = (sent_before + done).saturating_sub(reporter.bytes_done());
                reporter.add(delta);
            };
            client.load_stage(FdlStage::Fdl1, fdl1, chip.fdl1_addr, &mut progress).await?;
        }
        bus.state_changed("fdl1");

        sent_before = fdl1.len() as u64;
        {
            let mut progress = |done: u64, _: u64| {
                let delta = (sent_before + done).saturating_sub(reporter.bytes_done());
                reporter.add(delta);
            };
            client.load_stage(FdlStage::Fdl2, fdl2, chip.fdl2_addr, &mut progress).await?;
        }
        reporter.finish();
        bus.state_changed("fdl2");

        let table = client.read_partition_table().await?;
        Ok(Session::Bsl(BslSession { client, table }))
    }

    /// Case-insensitive partition lookup in the session's cached tables.
    pub fn find_partition(&self, name: &str) -> Option<Partition> {
        match self {
            Session::Fastboot(_) => None,
            Session::Edl(s) => {
                s.tables.iter().find_map(|t| t.find(name)).cloned()
            }
            Session::Bsl(s) => s.table.find(name).cloned(),
        }
    }

    /// Current slot, where the concept applies.
    pub fn current_slot(&self) -> Slot {
        match self {
            Session::Fastboot(s) => s.features.current_slot,
            Session::Edl(s) => {
                // Infer from which boot replica the tables carry; EDL has
                // no slot query of its own.
                let ab = s.tables.iter().any(|t| t.is_ab());
                if ab { Slot::A } else { Slot::None }
            }
            Session::Bsl(s) => {
                if s.table.is_ab() { Slot::A } else { Slot::None }
            }
        }
    }

    /// Invalidates cached partition tables (after repartition or
    /// set-active rebuilds).
    pub fn invalidate_tables(&mut self) {
        match self {
            Session::Fastboot(_) => {}
            Session::Edl(s) => s.tables.clear(),
            Session::Bsl(s) => s.table = PartitionTable::new(),
        }
    }
}

#[async_trait]
impl FlashTarget for Session {
    async fn flash(
        &mut self,
        partition: &str,
        image: &Path,
        progress: Progress<'_>,
    ) -> Result<()> {
        match self {
            Session::Fastboot(s) => s.client.flash(partition, image, progress).await,
            Session::Edl(s) => {
                let part = s
                    .tables
                    .iter()
                    .find_map(|t| t.find(partition))
                    .cloned()
                    .ok_or_else(|| {
                        Error::user_input(format!("partition '{partition}' not on device"))
                    })?;

                let size = tokio::fs::metadata(image).await?.len();
                if size > part.size_bytes() {
                    return Err(Error::user_input(format!(
                        "image of {size} bytes exceeds '{partition}' ({} bytes)",
                        part.size_bytes()
                    )));
                }

                let mut file = tokio::fs::File::open(image).await?;
                s.firehose
                    .program(part.lun, part.start_sector, size, &mut file, progress)
                    .await
            }
            Session::Bsl(s) => {
                let size = tokio::fs::metadata(image).await?.len();
                let mut file = tokio::fs::File::open(image).await?;
                s.client.write_partition(partition, &mut file, size, progress).await
            }
        }
    }

    async fn erase(&mut self, partition: &str) -> Result<()> {
        match self {
            Session::Fastboot(s) => s.client.erase(partition).await,
            Session::Edl(s) => {
                let part = s
                    .tables
                    .iter()
                    .find_map(|t| t.find(partition))
                    .cloned()
                    .ok_or_else(|| {
                        Error::user_input(format!("partition '{partition}' not on device"))
                    })?;
                s.firehose.erase(part.lun, part.start_sector, part.num_sectors).await
            }
            Session::Bsl(s) => s.client.erase_partition(partition).await,
        }
    }

    async fn read_partition(
        &mut self,
        partition: &str,
        out: &Path,
        progress: Progress<'_>,
    ) -> Result<()> {
        match self {
            Session::Fastboot(_) => Err(Error::unsupported(
                "fastboot cannot read partitions back; use EDL or BSL mode",
            )),
            Session::Edl(s) => {
                let part = s
                    .tables
                    .iter()
                    .find_map(|t| t.find(partition))
                    .cloned()
                    .ok_or_else(|| {
                        Error::user_input(format!("partition '{partition}' not on device"))
                    })?;

                let mut file = tokio::fs::File::create(out).await?;
                s.firehose
                    .read_sectors_to(part.lun, part.start_sector, part.num_sectors, &mut file, progress)
                    .await
            }
            Session::Bsl(s) => {
                let part = s.table.find(partition).cloned().ok_or_else(|| {
                    Error::user_input(format!("partition '{partition}' not on device"))
                })?;

                let data =
                    s.client.read_partition(partition, part.size_bytes(), progress).await?;
                tokio::fs::write(out, data).await?;
                Ok(())
            }
        }
    }

    async fn reboot(&mut self) -> Result<()> {
        match self {
            Session::Fastboot(s) => s.client.reboot(RebootTarget::System).await,
            Session::Edl(s) => s.firehose.power(PowerAction::Reset).await,
            Session::Bsl(s) => s.client.reset().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Partition;

    fn edl_session_with(parts: &[(&str, u32)]) -> Session {
        let mut table = PartitionTable::new();
        let mut start = 6u64;
        for (name, lun) in parts {
            table.insert(Partition::new(*name, *lun, start, 1024, 4096));
            start += 1024;
        }

        Session::Edl(EdlSession {
            firehose: FirehoseClient::new(
                Box::new(crate::transport::mock::MockTransport::new().loose()),
                StorageKind::Ufs,
                Timeouts::default(),
                CancelToken::new(),
            ),
            tables: vec![table],
        })
    }

    #[test]
    fn partition_lookup_spans_tables() {
        let session = edl_session_with(&[("boot_a", 0), ("boot_b", 0), ("xbl_a", 1)]);
        assert!(session.find_partition("BOOT_B").is_some());
        assert!(session.find_partition("nope").is_none());
        assert_eq!(session.family(), VendorFamily::Qualcomm);
    }

    #[tokio::test]
    async fn fastboot_cannot_read_back() {
        let mut session = Session::Fastboot(FastbootSession {
            client: FastbootClient::new(
                Box::new(crate::transport::mock::MockTransport::new().loose()),
                Timeouts::default(),
                CancelToken::new(),
            ),
            features: FastbootFeatures::default(),
        });

        let mut progress = |_: u64, _: u64| {};
        let err = session
            .read_partition("boot", Path::new("/tmp/x"), &mut progress)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
