//! Process and thread contexts
//!
//! [`ProcessContext`] is built once from the options and handed to the
//! dispatcher. It owns the record queue and the fault counters and carries
//! the lifecycle `init -> active -> shutdown`.
//!
//! [`ThreadContext`] holds everything a single monitored thread owns. Only
//! the dispatcher creates one (on thread init) and it is consumed on thread
//! exit, so nothing can reach per-thread state after the thread is gone.

use crate::config::AuditOptions;
use crate::error::{AuditFault, FaultClass};
use crate::fragment::Tag;
use crate::indirect_branch::IndirectBranchTracker;
use crate::modules::ModuleResolver;
use crate::records::{AuditRecord, RecordQueue};
use crate::shadow_stack::ShadowStack;
use crate::stats::FaultTotals;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Init,
    Active,
    Shutdown,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Init,
            1 => Lifecycle::Active,
            _ => Lifecycle::Shutdown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Lifecycle::Init => 0,
            Lifecycle::Active => 1,
            Lifecycle::Shutdown => 2,
        }
    }
}

pub struct ProcessContext {
    options: Arc<AuditOptions>,
    resolver: Arc<dyn ModuleResolver>,
    records: RecordQueue,
    lifecycle: AtomicU8,
    faults: [AtomicU64; 4],
}

impl ProcessContext {
    pub fn new(options: AuditOptions, resolver: Arc<dyn ModuleResolver>) -> Self {
        let records = RecordQueue::new(options.record_queue_capacity);
        Self {
            options: Arc::new(options),
            resolver,
            records,
            lifecycle: AtomicU8::new(Lifecycle::Init.as_u8()),
            faults: Default::default(),
        }
    }

    pub fn options(&self) -> &AuditOptions {
        &self.options
    }

    pub fn resolver(&self) -> &dyn ModuleResolver {
        self.resolver.as_ref()
    }

    pub fn records(&self) -> &RecordQueue {
        &self.records
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Move to `next`; returns the previous state
    pub(crate) fn transition(&self, next: Lifecycle) -> Lifecycle {
        let previous = Lifecycle::from_u8(self.lifecycle.swap(next.as_u8(), Ordering::AcqRel));
        if previous != next {
            tracing::debug!(?previous, ?next, "audit lifecycle");
        }
        previous
    }

    fn slot(class: FaultClass) -> usize {
        match class {
            FaultClass::Consistency => 0,
            FaultClass::Resync => 1,
            FaultClass::DedupWarning => 2,
            FaultClass::ExternalInput => 3,
        }
    }

    /// Log, count and record a fault
    pub fn report(&self, fault: AuditFault) {
        fault.log();
        self.faults[Self::slot(fault.class())].fetch_add(1, Ordering::Relaxed);
        self.records.push(AuditRecord::fault(fault));
    }

    pub fn fault_totals(&self) -> FaultTotals {
        let load = |class| self.faults[Self::slot(class)].load(Ordering::Relaxed);
        FaultTotals {
            consistency: load(FaultClass::Consistency),
            resync: load(FaultClass::Resync),
            dedup_warning: load(FaultClass::DedupWarning),
            external_input: load(FaultClass::ExternalInput),
        }
    }
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("options", &self.options)
            .field("lifecycle", &self.lifecycle())
            .field("records", &self.records)
            .finish()
    }
}

/// Engine thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State owned by one monitored thread
#[derive(Debug)]
pub struct ThreadContext {
    pub(crate) id: ThreadId,
    pub(crate) indirect: IndirectBranchTracker,
    pub(crate) shadow_stack: ShadowStack,
    pub(crate) current: Option<Tag>,
    pub(crate) dispatches: u64,
}

impl ThreadContext {
    pub(crate) fn new(id: ThreadId) -> Self {
        Self {
            id,
            indirect: IndirectBranchTracker::new(id.0),
            shadow_stack: ShadowStack::new(id.0),
            current: None,
            dispatches: 0,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn indirect(&self) -> &IndirectBranchTracker {
        &self.indirect
    }

    pub fn shadow_stack(&self) -> &ShadowStack {
        &self.shadow_stack
    }

    /// Fragment the thread most recently entered
    pub fn current_fragment(&self) -> Option<Tag> {
        self.current
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }
}
