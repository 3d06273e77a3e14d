//! Aggregate audit statistics
//!
//! [`EventCounters`] are bumped under the shared-state lock as events arrive.
//! [`AuditStats`] is the snapshot emitted on heartbeat and at exit.

use crate::error::FaultClass;
use serde::Serialize;

/// Counters mutated while the shared-state lock is held
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventCounters {
    pub fragments_created: u64,
    pub fragments_rebuilt: u64,
    pub fragments_retired: u64,
    pub edges_removed: u64,
    pub links_rejected: u64,
    pub links_complete: u64,
    pub syscalls: u64,
    pub suspicious_syscalls: u64,
    pub code_modifications: u64,
    pub cache_resets: u64,
    pub heartbeats: u64,
}

/// Fault totals by class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FaultTotals {
    pub consistency: u64,
    pub resync: u64,
    pub dedup_warning: u64,
    pub external_input: u64,
}

impl FaultTotals {
    pub fn get(&self, class: FaultClass) -> u64 {
        match class {
            FaultClass::Consistency => self.consistency,
            FaultClass::Resync => self.resync,
            FaultClass::DedupWarning => self.dedup_warning,
            FaultClass::ExternalInput => self.external_input,
        }
    }

    pub fn total(&self) -> u64 {
        self.consistency + self.resync + self.dedup_warning + self.external_input
    }
}

/// Point-in-time view of the audit state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditStats {
    pub nodes: usize,
    pub live_nodes: usize,
    pub edges_direct: usize,
    pub edges_indirect: usize,
    pub edges_return: usize,
    pub shadow_regions: usize,
    pub executable_regions: usize,
    pub live_threads: usize,
    pub records_dropped: u64,
    pub counters: EventCounters,
    pub faults: FaultTotals,
}

impl AuditStats {
    pub fn edges(&self) -> usize {
        self.edges_direct + self.edges_indirect + self.edges_return
    }

    /// Print a summary table to stderr
    pub fn print_summary(&self) {
        eprintln!("flowaudit summary");
        eprintln!("------------------------------");
        eprintln!("{:<22} {:>8}", "nodes", self.nodes);
        eprintln!("{:<22} {:>8}", "live nodes", self.live_nodes);
        eprintln!(
            "{:<22} {:>8}  (direct {}, indirect {}, return {})",
            "edges",
            self.edges(),
            self.edges_direct,
            self.edges_indirect,
            self.edges_return
        );
        eprintln!("{:<22} {:>8}", "retired fragments", self.counters.fragments_retired);
        eprintln!("{:<22} {:>8}", "shadow regions", self.shadow_regions);
        eprintln!("{:<22} {:>8}", "syscalls", self.counters.syscalls);
        eprintln!("{:<22} {:>8}", "suspicious syscalls", self.counters.suspicious_syscalls);
        eprintln!(
            "{:<22} {:>8}  (consistency {}, resync {}, dedup {}, external {})",
            "faults",
            self.faults.total(),
            self.faults.consistency,
            self.faults.resync,
            self.faults.dedup_warning,
            self.faults.external_input
        );
        if self.records_dropped > 0 {
            eprintln!("{:<22} {:>8}", "records dropped", self.records_dropped);
        }
    }
}
