//! Audit records and the bounded record queue
//!
//! Components push [`AuditRecord`]s from the hot path into a [`RecordQueue`].
//! The queue never blocks: when it is full the record is dropped and counted.
//! The heartbeat drains it in one batch and hands the batch to a
//! [`RecordWriter`] after the shared-state lock has been released.
//!
//! ```text
//! engine thread ── push() ──▶ ArrayQueue ── drain() on heartbeat ──▶ RecordWriter
//!                 (lock-free)                                        (JSON lines, tracing, memory)
//! ```

use crate::error::{AuditFault, FaultClass};
use crate::fragment::Tag;
use crate::handles::NetworkEvent;
use crate::indirect_branch::IndirectPath;
use crate::link_graph::{EdgeKey, EdgeKind, EdgeRecord};
use crate::shadow_pages::{AddressRange, RegionOrigin};
use crate::shadow_stack::SuspicionMark;
use crate::stats::AuditStats;
use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Whether a region appeared or went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionAction {
    Added,
    Removed,
}

/// One unit of audit output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum AuditRecord {
    Edge {
        from: Tag,
        to: Tag,
        ordinal: u8,
        kind: EdgeKind,
        discovered: u64,
        indirect_seen: Option<u64>,
    },
    SyscallTraversal {
        thread: u64,
        tag: Tag,
        sysnum: i64,
        name: String,
        first: bool,
    },
    SuspiciousSyscall {
        thread: u64,
        tag: Tag,
        sysnum: i64,
        name: String,
        mark: SuspicionMark,
        path: Option<IndirectPath>,
        stack_depth: usize,
    },
    Fault {
        class: FaultClass,
        message: String,
        fault: AuditFault,
    },
    ShadowRegion {
        action: RegionAction,
        start: u64,
        end: u64,
        origin: Option<RegionOrigin>,
        shadow: bool,
    },
    CodeModification {
        thread: u64,
        writer: Option<Tag>,
        target: AddressRange,
    },
    CrossModuleHash {
        from: Tag,
        to: Tag,
        from_module: String,
        to_module: String,
        hash: u64,
    },
    Network {
        thread: u64,
        event: NetworkEvent,
    },
    Statistics(AuditStats),
    ProcessTerminating {
        crash: bool,
        live_threads: usize,
    },
    Fork {
        thread: u64,
        name: String,
    },
}

impl AuditRecord {
    pub fn edge(key: EdgeKey, edge: EdgeRecord) -> Self {
        AuditRecord::Edge {
            from: key.from,
            to: key.to,
            ordinal: key.ordinal,
            kind: edge.kind,
            discovered: edge.discovered,
            indirect_seen: edge.indirect_seen,
        }
    }

    pub fn fault(fault: AuditFault) -> Self {
        AuditRecord::Fault {
            class: fault.class(),
            message: fault.to_string(),
            fault,
        }
    }

    /// Short record name, matches the serialized tag
    pub fn name(&self) -> &'static str {
        match self {
            AuditRecord::Edge { .. } => "edge",
            AuditRecord::SyscallTraversal { .. } => "syscall_traversal",
            AuditRecord::SuspiciousSyscall { .. } => "suspicious_syscall",
            AuditRecord::Fault { .. } => "fault",
            AuditRecord::ShadowRegion { .. } => "shadow_region",
            AuditRecord::CodeModification { .. } => "code_modification",
            AuditRecord::CrossModuleHash { .. } => "cross_module_hash",
            AuditRecord::Network { .. } => "network",
            AuditRecord::Statistics(_) => "statistics",
            AuditRecord::ProcessTerminating { .. } => "process_terminating",
            AuditRecord::Fork { .. } => "fork",
        }
    }
}

/// Bounded lock-free queue between the hot path and the writer
pub struct RecordQueue {
    queue: ArrayQueue<AuditRecord>,
    total_pushed: AtomicU64,
    total_dropped: AtomicU64,
}

impl RecordQueue {
    /// A zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            total_pushed: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue; drops the record when the queue is full
    pub fn push(&self, record: AuditRecord) -> bool {
        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        match self.queue.push(record) {
            Ok(()) => true,
            Err(dropped) => {
                self.total_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(record = dropped.name(), "record queue full, record dropped");
                false
            }
        }
    }

    pub fn drain(&self) -> Vec<AuditRecord> {
        let mut batch = Vec::with_capacity(self.queue.len());
        while let Some(record) = self.queue.pop() {
            batch.push(record);
        }
        batch
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }
}

impl std::fmt::Debug for RecordQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordQueue").field("stats", &self.stats()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total_pushed: u64,
    pub total_dropped: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl QueueStats {
    /// Fraction of pushed records that were dropped (0.0 to 1.0)
    pub fn drop_rate(&self) -> f64 {
        if self.total_pushed == 0 {
            0.0
        } else {
            self.total_dropped as f64 / self.total_pushed as f64
        }
    }
}

/// Sink for drained record batches
pub trait RecordWriter: Send {
    fn write_batch(&mut self, batch: &[AuditRecord]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Keeps records in memory; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, name: &str) -> usize {
        self.records().iter().filter(|r| r.name() == name).count()
    }
}

impl RecordWriter for MemoryWriter {
    fn write_batch(&mut self, batch: &[AuditRecord]) -> io::Result<()> {
        if let Ok(mut records) = self.records.lock() {
            records.extend_from_slice(batch);
        }
        Ok(())
    }
}

/// Logs every record through `tracing`
#[derive(Debug, Default)]
pub struct TracingWriter;

impl RecordWriter for TracingWriter {
    fn write_batch(&mut self, batch: &[AuditRecord]) -> io::Result<()> {
        for record in batch {
            match record {
                AuditRecord::Fault { message, .. } => {
                    tracing::warn!(record = "fault", "{}", message)
                }
                AuditRecord::SuspiciousSyscall { .. } => tracing::warn!(?record, "suspicious"),
                _ => tracing::debug!(record = record.name(), ?record),
            }
        }
        Ok(())
    }
}

/// One JSON object per line
pub struct JsonLinesWriter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> RecordWriter for JsonLinesWriter<W> {
    fn write_batch(&mut self, batch: &[AuditRecord]) -> io::Result<()> {
        for record in batch {
            serde_json::to_writer(&mut self.out, record)?;
            self.out.write_all(b"\n")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
