/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Flash-task model and the normalization pass that turns a raw task
//! list into a deterministic execution plan.

use std::path::PathBuf;

use crate::fastboot::RebootTarget;
use crate::storage::{Slot, is_modem_partition};

/// Where a flash task's image bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    File(PathBuf),
    /// Resolved against the job's payload (local or remote) during
    /// normalization.
    PayloadPartition(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOp {
    Flash,
    Erase,
    SetActive(Slot),
    Reboot(RebootTarget),
}

/// One unit of work in a flash job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashTask {
    pub op: TaskOp,
    pub partition: String,
    pub source: Option<ImageSource>,
    pub size_bytes: u64,
    /// Whether the backing image was present when the task was built.
    pub exists: bool,
}

impl FlashTask {
    pub fn flash(partition: impl Into<String>, source: ImageSource, size_bytes: u64) -> Self {
        FlashTask {
            op: TaskOp::Flash,
            partition: partition.into(),
            source: Some(source),
            size_bytes,
            exists: true,
        }
    }

    pub fn erase(partition: impl Into<String>) -> Self {
        FlashTask {
            op: TaskOp::Erase,
            partition: partition.into(),
            source: None,
            size_bytes: 0,
            exists: true,
        }
    }
}

/// Partitions dropped from the plan when user data is preserved.
const DATA_PARTITIONS: &[&str] = &["userdata", "userdata_ab", "metadata"];

/// The normalized execution plan: control tasks first, then the sorted
/// main flash loop, with modem tasks staged separately.
#[derive(Debug, Default)]
pub struct Plan {
    /// Erase / set-active / reboot tasks, in submission order.
    pub control: Vec<FlashTask>,
    /// Non-modem flash tasks, size-ascending, name tie-break.
    pub main: Vec<FlashTask>,
    /// Modem-family flash tasks, same ordering.
    pub modem: Vec<FlashTask>,
    /// Names dropped by normalization, for the report.
    pub dropped: Vec<String>,
}

impl Plan {
    pub fn total_flash_bytes(&self) -> u64 {
        self.main.iter().chain(self.modem.iter()).map(|t| t.size_bytes).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.control.is_empty() && self.main.is_empty() && self.modem.is_empty()
    }
}

/// Normalizes a task list.
///
/// `keep_data` drops data partitions; flash tasks sort size-ascending so
/// small critical partitions land first and an early failure has the
/// smallest blast radius. Modem-family partitions are split out unless
/// `pure_fbd` keeps everything in one pass.
pub fn normalize(tasks: Vec<FlashTask>, keep_data: bool, pure_fbd: bool) -> Plan {
    let mut plan = Plan::default();

    for task in tasks {
        let base = task.partition.to_ascii_lowercase();

        if keep_data
            && matches!(task.op, TaskOp::Flash | TaskOp::Erase)
            && DATA_PARTITIONS.iter().any(|d| base == *d)
        {
            plan.dropped.push(task.partition);
            continue;
        }

        match task.op {
            TaskOp::Flash => {
                if !pure_fbd && is_modem_partition(&base) {
                    plan.modem.push(task);
                } else {
                    plan.main.push(task);
                }
            }
            _ => plan.control.push(task),
        }
    }

    let by_size = |a: &FlashTask, b: &FlashTask| {
        a.size_bytes.cmp(&b.size_bytes).then_with(|| a.partition.cmp(&b.partition))
    };
    plan.main.sort_by(by_size);
    plan.modem.sort_by(by_size);

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_task(name: &str, size: u64) -> FlashTask {
        FlashTask::flash(name, ImageSource::File(PathBuf::from(format!("{name}.img"))), size)
    }

    #[test]
    fn sort_is_size_ascending_with_name_tiebreak() {
        let plan = normalize(
            vec![
                file_task("system", 2_000_000),
                file_task("boot", 32_000),
                file_task("dtbo", 32_000),
                file_task("abl", 1_000),
            ],
            false,
            false,
        );

        let order: Vec<&str> = plan.main.iter().map(|t| t.partition.as_str()).collect();
        assert_eq!(order, ["abl", "boot", "dtbo", "system"]);
    }

    #[test]
    fn sort_is_deterministic_across_input_orders() {
        let tasks = vec![
            file_task("vendor", 500),
            file_task("boot", 500),
            file_task("system", 900),
        ];
        let mut reversed = tasks.clone();
        reversed.reverse();

        let a: Vec<String> =
            normalize(tasks, false, false).main.into_iter().map(|t| t.partition).collect();
        let b: Vec<String> =
            normalize(reversed, false, false).main.into_iter().map(|t| t.partition).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn keep_data_drops_data_partitions() {
        let plan = normalize(
            vec![
                file_task("boot", 10),
                file_task("userdata", 100),
                file_task("metadata", 5),
                FlashTask::erase("userdata"),
            ],
            true,
            false,
        );

        assert_eq!(plan.main.len(), 1);
        assert!(plan.control.is_empty());
        assert_eq!(plan.dropped.len(), 3);
    }

    #[test]
    fn modem_partitions_are_split_out() {
        let plan = normalize(
            vec![file_task("boot", 10), file_task("modem_a", 20), file_task("nv_data", 5)],
            false,
            false,
        );

        assert_eq!(plan.main.len(), 1);
        assert_eq!(plan.modem.len(), 2);
        // modem list is also size-sorted
        assert_eq!(plan.modem[0].partition, "nv_data");
    }

    #[test]
    fn pure_fbd_keeps_modem_in_the_main_pass() {
        let plan = normalize(
            vec![file_task("boot", 10), file_task("modem_a", 20)],
            false,
            true,
        );

        assert_eq!(plan.main.len(), 2);
        assert!(plan.modem.is_empty());
    }

    #[test]
    fn control_tasks_keep_submission_order() {
        let plan = normalize(
            vec![
                FlashTask {
                    op: TaskOp::SetActive(Slot::A),
                    partition: String::new(),
                    source: None,
                    size_bytes: 0,
                    exists: true,
                },
                FlashTask::erase("frp"),
            ],
            false,
            false,
        );

        assert!(matches!(plan.control[0].op, TaskOp::SetActive(Slot::A)));
        assert!(matches!(plan.control[1].op, TaskOp::Erase));
    }
}
