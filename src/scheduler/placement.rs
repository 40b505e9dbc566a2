//! Mapping a job onto the cores of the node it lands on.
//!
//! Nodes that share one physical host are told apart by their slot number.
//! The architecture tag picks how threads are pinned:
//!
//! - `knc` tags: Intel OpenMP thread placement, four hardware threads per core
//! - `knl` tags: a contiguous `numactl` core range per slot
//! - anything else: just the OpenMP thread count

use crate::config::NodeConfig;

const KNC_TAG: &str = "knc";
const KNL_TAG: &str = "knl";
const KNC_THREADS_PER_CORE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// `KMP_PLACE_THREADS=<cores>C,4T,<offset>O`
    ThreadPlacement { cores_per_job: u32, offset: u32 },
    /// `numactl -C <first>-<last>`
    CoreRange { first: u32, last: u32 },
    /// `OMP_NUM_THREADS=<threads>`
    ThreadCount(u32),
}

impl Placement {
    pub fn for_node(node: &NodeConfig) -> Self {
        if node.arch.contains(KNC_TAG) {
            let cores_per_job = node.threads / KNC_THREADS_PER_CORE;
            Placement::ThreadPlacement {
                cores_per_job,
                offset: node.slot.saturating_mul(cores_per_job),
            }
        } else if node.arch.contains(KNL_TAG) {
            Placement::CoreRange {
                first: node.slot.saturating_mul(node.threads),
                last: node
                    .slot
                    .saturating_add(1)
                    .saturating_mul(node.threads)
                    .saturating_sub(1),
            }
        } else {
            Placement::ThreadCount(node.threads)
        }
    }

    /// Prefix `command` with the placement directive and, when given, a
    /// change into the remote working directory.
    pub fn apply(&self, command: &str, remote_dir: Option<&str>) -> String {
        let cd = remote_dir
            .map(|dir| format!("cd {} ; ", shell_quote(dir)))
            .unwrap_or_default();
        match *self {
            Placement::ThreadPlacement {
                cores_per_job,
                offset,
            } => format!(
                "export KMP_PLACE_THREADS={}C,{}T,{}O ; {}{}",
                cores_per_job, KNC_THREADS_PER_CORE, offset, cd, command
            ),
            Placement::CoreRange { first, last } => {
                format!("{}numactl -C {}-{} {}", cd, first, last, command)
            }
            Placement::ThreadCount(threads) => {
                format!("{}export OMP_NUM_THREADS={};{}", cd, threads, command)
            }
        }
    }
}

/// Quote `s` for a POSIX shell. Plain path-like words pass through bare.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Rewrite `command` for execution on `node`.
pub fn build_command(node: &NodeConfig, command: &str, remote_dir: Option<&str>) -> String {
    Placement::for_node(node).apply(command, remote_dir)
}
