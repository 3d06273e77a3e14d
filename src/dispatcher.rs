//! The audit dispatcher
//!
//! [`AuditDispatcher`] is the only type the engine adapter talks to. It routes
//! each event to the component that owns it. Per-thread work happens on the
//! caller's [`ThreadContext`] without locking. Process-wide state (fragment
//! table, link graph, executable regions, hooks and handles) sits behind one
//! coarse mutex held only for the mutation itself.
//!
//! Module lookups, cross-module hashing, fault reporting and record writing
//! all happen with the lock released.

use crate::config::AuditOptions;
use crate::context::{Lifecycle, ProcessContext, ThreadContext, ThreadId};
use crate::error::AuditFault;
use crate::events::{
    AddressRange, AreaExpansion, AuditEvents, CallbackAuditEvents, DeviceIoControl, Termination,
};
use crate::fragment::{FragmentRef, FragmentTable, Removal, Tag, Translation};
use crate::handles::{HandleTracker, NetworkEvent};
use crate::hooks::{HookId, HookRegistry};
use crate::indirect_branch::{BranchClass, ResolvedBranch};
use crate::link_graph::{EdgeKey, EdgeKind, LinkGraph, LinkOutcome, UNKNOWN_ORDINAL};
use crate::modules::{ModuleKind, ModuleResolver};
use crate::records::{AuditRecord, RecordWriter, RegionAction};
use crate::shadow_pages::{Backing, RegionChange, ShadowPageManager};
use crate::shadow_stack::{ReturnCheck, ShadowFrame, SuspicionReason};
use crate::stats::{AuditStats, EventCounters};
use crate::syscall_audit::{syscall_name, SyscallAuditor, SyscallVerdict};
use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Process-wide state guarded by the coarse lock
#[derive(Debug, Default)]
pub struct SharedState {
    pub fragments: FragmentTable,
    pub graph: LinkGraph,
    pub pages: ShadowPageManager,
    pub hooks: HookRegistry,
    pub handles: HandleTracker,
    pub counters: EventCounters,
}

pub struct AuditDispatcher {
    process: ProcessContext,
    shared: Mutex<SharedState>,
    syscalls: SyscallAuditor,
    writer: Mutex<Box<dyn RecordWriter>>,
    live_threads: AtomicUsize,
}

impl AuditDispatcher {
    pub fn new(
        options: AuditOptions,
        resolver: Arc<dyn ModuleResolver>,
        writer: Box<dyn RecordWriter>,
    ) -> Self {
        let syscalls = SyscallAuditor::new(&options.watched_syscalls, options.monitor);
        Self {
            process: ProcessContext::new(options, resolver),
            shared: Mutex::new(SharedState::default()),
            syscalls,
            writer: Mutex::new(writer),
            live_threads: AtomicUsize::new(0),
        }
    }

    pub fn process(&self) -> &ProcessContext {
        &self.process
    }

    pub fn options(&self) -> &AuditOptions {
        self.process.options()
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        // a panicked audit thread must not stop the others from auditing
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` with the shared state locked
    pub fn with_shared<R>(&self, f: impl FnOnce(&mut SharedState) -> R) -> R {
        let mut shared = self.lock();
        f(&mut shared)
    }

    fn report(&self, fault: AuditFault) {
        self.process.report(fault);
    }

    fn report_all(&self, faults: impl IntoIterator<Item = AuditFault>) {
        for fault in faults {
            self.report(fault);
        }
    }

    fn push(&self, record: AuditRecord) {
        self.process.records().push(record);
    }

    fn push_region_change(&self, change: RegionChange) {
        for range in change.removed {
            self.push(AuditRecord::ShadowRegion {
                action: RegionAction::Removed,
                start: range.start,
                end: range.end,
                origin: None,
                shadow: false,
            });
        }
        for region in change.added {
            self.push(AuditRecord::ShadowRegion {
                action: RegionAction::Added,
                start: region.base,
                end: region.end(),
                origin: Some(region.origin),
                shadow: region.shadow,
            });
        }
    }

    /// Classify the memory backing `addr`; lookup failures count as unknown
    fn backing_of(&self, addr: u64) -> Backing {
        match self.process.resolver().module_for(Tag(addr)) {
            Ok(Some(module)) if module.kind == ModuleKind::Image => Backing::ModuleImage,
            Ok(_) => Backing::Unknown,
            Err(err) => {
                self.report(AuditFault::ModuleLookupFailed {
                    addr: Tag(addr),
                    reason: err.to_string(),
                });
                Backing::Unknown
            }
        }
    }

    /// Cross-module edge hash, recorded once when the edge is first inserted
    fn record_xhash(&self, key: EdgeKey) {
        if !self.options().record_xhash {
            return;
        }
        let resolver = self.process.resolver();
        let lookup = |tag: Tag| match resolver.module_for(tag) {
            Ok(module) => module,
            Err(err) => {
                self.report(AuditFault::ModuleLookupFailed {
                    addr: tag,
                    reason: err.to_string(),
                });
                None
            }
        };
        let (Some(from), Some(to)) = (lookup(key.from), lookup(key.to)) else {
            return;
        };
        if from.name == to.name {
            return;
        }
        let hash = cross_module_hash(
            &from.name,
            from.offset_of(key.from.0),
            &to.name,
            to.offset_of(key.to.0),
        );
        self.push(AuditRecord::CrossModuleHash {
            from: key.from,
            to: key.to,
            from_module: from.name,
            to_module: to.name,
            hash,
        });
    }

    fn handle_resolved(&self, thread: &mut ThreadContext, resolved: ResolvedBranch) {
        let mut faults = Vec::new();
        let kind = match resolved.class {
            BranchClass::Return => {
                match thread.shadow_stack.pop_return(resolved.to) {
                    ReturnCheck::Matched(_) => {}
                    ReturnCheck::Mismatch { fault, .. } => {
                        thread
                            .shadow_stack
                            .raise_suspicion(resolved.from, SuspicionReason::ReturnMismatch);
                        faults.push(fault);
                    }
                    ReturnCheck::Underflow(fault) => faults.push(fault),
                }
                EdgeKind::Return
            }
            BranchClass::Call | BranchClass::Jump => EdgeKind::Indirect,
        };

        let (ordinal, outcome, into_shadow) = self.with_shared(|shared| {
            let ordinal = shared
                .graph
                .direct_ordinal(resolved.from, resolved.to)
                .unwrap_or(UNKNOWN_ORDINAL);
            let outcome = shared
                .graph
                .notify_indirect_link(resolved.from, resolved.to, ordinal, kind);
            (ordinal, outcome, shared.pages.is_shadow(resolved.to.0))
        });

        if into_shadow {
            thread
                .shadow_stack
                .raise_suspicion(resolved.from, SuspicionReason::ShadowCodeTarget);
        }
        tracing::trace!(
            thread = thread.id.0,
            from = %resolved.from,
            to = %resolved.to,
            ?kind,
            "indirect branch resolved"
        );
        self.report_all(faults);
        if outcome.is_new() {
            self.record_xhash(EdgeKey::new(resolved.from, resolved.to, ordinal));
        }
    }

    /// Snapshot of the current audit state
    pub fn stats(&self) -> AuditStats {
        let mut stats = self.with_shared(|shared| AuditStats {
            nodes: shared.fragments.len(),
            live_nodes: shared.fragments.live_count(),
            edges_direct: shared.graph.count_by_kind(EdgeKind::Direct),
            edges_indirect: shared.graph.count_by_kind(EdgeKind::Indirect),
            edges_return: shared.graph.count_by_kind(EdgeKind::Return),
            shadow_regions: shared.pages.shadow_count(),
            executable_regions: shared.pages.len(),
            counters: shared.counters,
            ..Default::default()
        });
        stats.live_threads = self.live_threads.load(Ordering::Relaxed);
        stats.records_dropped = self.process.records().stats().total_dropped;
        stats.faults = self.process.fault_totals();
        stats
    }

    /// Drain queued records into the writer
    pub fn flush(&self) {
        let batch = self.process.records().drain();
        if batch.is_empty() {
            return;
        }
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = writer.write_batch(&batch).and_then(|()| writer.flush()) {
            tracing::error!("failed to write {} audit records: {}", batch.len(), err);
        }
    }
}

impl std::fmt::Debug for AuditDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditDispatcher")
            .field("process", &self.process)
            .field("live_threads", &self.live_threads.load(Ordering::Relaxed))
            .finish()
    }
}

/// FNV-1a over both endpoints' module name and offset
pub fn cross_module_hash(
    from_module: &str,
    from_offset: u64,
    to_module: &str,
    to_offset: u64,
) -> u64 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(from_module.as_bytes());
    hasher.write_u64(from_offset);
    hasher.write(to_module.as_bytes());
    hasher.write_u64(to_offset);
    hasher.finish()
}

impl AuditEvents for AuditDispatcher {
    fn init(&self, is_fork: bool) {
        let previous = self.process.transition(Lifecycle::Active);
        tracing::info!(is_fork, ?previous, "audit session started");
    }

    fn exit(&self) {
        self.heartbeat();
        self.process.transition(Lifecycle::Shutdown);
        tracing::info!("audit session ended");
    }

    fn engine_initialized(&self) {
        tracing::info!("translation engine initialized");
    }

    fn thread_init(&self, thread: ThreadId) -> ThreadContext {
        self.live_threads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(thread = thread.0, "thread init");
        ThreadContext::new(thread)
    }

    fn thread_exit(&self, mut thread: ThreadContext) {
        if let Some(fault) = thread.indirect.drain() {
            self.report(fault);
        }
        self.live_threads.fetch_sub(1, Ordering::Relaxed);
        tracing::debug!(
            thread = thread.id.0,
            dispatches = thread.dispatches,
            "thread exit"
        );
    }

    fn process_fork(&self, thread: &mut ThreadContext, name: &str) {
        tracing::info!(thread = thread.id.0, name, "process fork");
        self.push(AuditRecord::Fork {
            thread: thread.id.0,
            name: name.to_string(),
        });
    }

    fn process_terminating(&self, threads: Vec<ThreadContext>, termination: &Termination) {
        if termination.crash {
            tracing::error!(
                external = termination.external,
                location = termination.location.as_deref().unwrap_or("unknown"),
                "engine crash"
            );
        }
        let live_threads = threads.len();
        for thread in threads {
            self.thread_exit(thread);
        }
        self.push(AuditRecord::ProcessTerminating {
            crash: termination.crash,
            live_threads,
        });
        self.exit();
    }

    fn dispatch(&self, thread: &mut ThreadContext, tag: Tag) {
        thread.current = Some(tag);
        thread.dispatches += 1;
        if let Some(resolved) = thread.indirect.resolve(tag) {
            self.handle_resolved(thread, resolved);
        }
    }

    fn fcache_enter(&self, thread: &mut ThreadContext) {
        if let Err(fault) = thread.indirect.check_cache_entry() {
            self.report(fault);
        }
    }

    fn fragment_link(&self, _thread: &ThreadContext, from: &FragmentRef, to: Tag) {
        let ordinal = from.exit_ordinal(to).unwrap_or(UNKNOWN_ORDINAL);
        self.fragment_link_tags(from.tag, to, ordinal);
    }

    fn fragment_link_tags(&self, from: Tag, to: Tag, ordinal: u8) {
        let outcome = self.with_shared(|shared| {
            let outcome = shared
                .graph
                .notify_direct_link(&mut shared.fragments, from, to, ordinal);
            if matches!(outcome, LinkOutcome::Rejected(_)) {
                shared.counters.links_rejected += 1;
            }
            outcome
        });
        match outcome {
            LinkOutcome::Rejected(fault) => self.report(fault),
            LinkOutcome::Inserted => self.record_xhash(EdgeKey::new(from, to, ordinal)),
            LinkOutcome::Upgraded | LinkOutcome::Unchanged => {}
        }
    }

    fn bb_link_complete(&self, fragment: &FragmentRef) {
        self.with_shared(|shared| {
            if shared.fragments.mark_link_complete(fragment.tag) {
                shared.counters.links_complete += 1;
            }
        });
    }

    fn syscall(&self, thread: &mut ThreadContext, tag: Tag, sysnum: i64) {
        let first = self.with_shared(|shared| {
            shared.counters.syscalls += 1;
            shared.graph.notify_syscall(tag, sysnum)
        });

        let watched = self.syscalls.should_intercept(sysnum);
        if first || watched {
            self.push(AuditRecord::SyscallTraversal {
                thread: thread.id.0,
                tag,
                sysnum,
                name: syscall_name(sysnum),
                first,
            });
        }

        let verdict = self.syscalls.classify(
            tag,
            sysnum,
            thread.shadow_stack.suspicion(),
            thread.indirect.last_path(),
            thread.shadow_stack.depth(),
        );
        if let SyscallVerdict::Suspicious {
            mark,
            path,
            stack_depth,
        } = verdict
        {
            self.with_shared(|shared| shared.counters.suspicious_syscalls += 1);
            self.push(AuditRecord::SuspiciousSyscall {
                thread: thread.id.0,
                tag,
                sysnum,
                name: syscall_name(sysnum),
                mark,
                path,
                stack_depth,
            });
        }
    }

    fn filter_syscall(&self, sysnum: i64) -> bool {
        self.syscalls.should_intercept(sysnum)
    }

    fn translation(&self, thread: &ThreadContext, translation: &Translation) {
        let fragment = translation.fragment();
        let constructed = self.with_shared(|shared| {
            let shadow_origin = shared.pages.is_shadow(fragment.tag.0);
            let constructed = shared.fragments.construct(fragment, shadow_origin);
            match translation {
                Translation::BasicBlock {
                    syscall: Some(sysnum),
                    ..
                } => shared.fragments.set_syscall(fragment.tag, *sysnum),
                Translation::Trace { blocks, .. } => {
                    shared.fragments.set_trace_blocks(fragment.tag, blocks)
                }
                Translation::BasicBlock { .. } => {}
            }
            if constructed.created {
                shared.counters.fragments_created += 1;
            }
            if constructed.rebuilt {
                shared.counters.fragments_rebuilt += 1;
            }
            constructed
        });
        tracing::trace!(
            thread = thread.id.0,
            tag = %fragment.tag,
            kind = ?fragment.kind,
            sharing = ?fragment.sharing,
            created = constructed.created,
            "fragment constructed"
        );
    }

    fn fragment_removed(&self, fragment: &FragmentRef) {
        let removal = self.with_shared(|shared| {
            let was_retired = shared
                .fragments
                .get(fragment.tag)
                .is_some_and(|node| node.retired);
            let removal = shared.fragments.remove(fragment);
            if let Removal::Retire { .. } = removal {
                // a copy that outlived the retirement may have linked since
                let removed = shared.graph.notify_link_removed(fragment.tag);
                if !was_retired {
                    shared.counters.fragments_retired += 1;
                }
                shared.counters.edges_removed += removed as u64;
            }
            removal
        });
        if let Removal::Retire {
            warning: Some(warning),
        } = removal
        {
            self.report(warning);
        }
    }

    fn cache_reset(&self) {
        self.with_shared(|shared| {
            shared.fragments.reset_cache();
            shared.counters.cache_resets += 1;
        });
        tracing::info!("code cache reset");
    }

    fn memory_executable_change(&self, range: AddressRange, becomes_executable: bool) {
        let backing = if becomes_executable {
            self.backing_of(range.start)
        } else {
            Backing::Unknown
        };
        let change = self.with_shared(|shared| {
            shared
                .pages
                .executable_change(range, becomes_executable, backing)
        });
        self.push_region_change(change);
    }

    fn code_area_expansion(&self, expansion: AreaExpansion, is_engine_area: bool) {
        tracing::debug!(
            start = expansion.expanded.start,
            end = expansion.expanded.end,
            is_engine_area,
            "code area expanded"
        );
        self.with_shared(|shared| shared.pages.code_area_expanded(expansion, is_engine_area));
    }

    fn code_area(&self, range: AddressRange, created: bool) {
        if created {
            self.with_shared(|shared| shared.pages.code_area_created(range));
            return;
        }
        let removed = self.with_shared(|shared| shared.pages.code_area_destroyed(range));
        self.push_region_change(RegionChange {
            added: Vec::new(),
            removed,
        });
    }

    fn code_modification(
        &self,
        thread: &mut ThreadContext,
        writer: Option<Tag>,
        target: AddressRange,
    ) {
        let added = self.with_shared(|shared| {
            shared.counters.code_modifications += 1;
            shared.pages.mark_modified(target)
        });
        tracing::debug!(
            thread = thread.id.0,
            start = target.start,
            end = target.end,
            "code modification"
        );
        self.push(AuditRecord::CodeModification {
            thread: thread.id.0,
            writer,
            target,
        });
        self.push_region_change(RegionChange {
            added,
            removed: Vec::new(),
        });
    }

    fn intercept(&self, range: AddressRange) {
        self.with_shared(|shared| shared.pages.register_interception(range));
    }

    fn indirect_branchpoint(&self, tag: Tag, is_return: bool, syscall: Option<i64>) -> HookId {
        self.with_shared(|shared| shared.hooks.indirect_branchpoint(tag, is_return, syscall))
    }

    fn return_site(&self, tag: Tag) -> HookId {
        self.with_shared(|shared| shared.hooks.return_site(tag))
    }

    fn instrument_ibl_handler(&self, routine: Tag) {
        self.with_shared(|shared| shared.hooks.instrument_ibl_handler(routine));
    }

    fn instrument_ibl_hook(&self, routine: Tag) {
        self.with_shared(|shared| shared.hooks.instrument_ibl_hook(routine));
    }

    fn instrument_ibl_fcache_return(&self, routine: Tag) {
        self.with_shared(|shared| shared.hooks.instrument_ibl_fcache_return(routine));
    }

    fn adjust_for_ibl_instrumentation(&self, pc: Tag, raw_start: Tag) -> Tag {
        self.with_shared(|shared| shared.hooks.adjust_for_ibl_instrumentation(pc, raw_start))
    }

    fn gencode_phase(&self, starting: bool) {
        self.with_shared(|shared| shared.hooks.gencode_phase(starting));
    }

    fn gencode_ibl_routine(&self, pc: Tag, is_syscall: bool) {
        self.with_shared(|shared| shared.hooks.gencode_routine(pc, is_syscall));
    }

    fn indirect_branch_taken(&self, thread: &mut ThreadContext, from: Tag, class: BranchClass) {
        if let Err(fault) = thread.indirect.branch_taken(from, class) {
            self.report(fault);
        }
    }

    fn call_taken(&self, thread: &mut ThreadContext, call_site: Tag, return_target: Tag) {
        let in_shadow_region = self.with_shared(|shared| shared.pages.is_shadow(call_site.0));
        let frame = ShadowFrame {
            call_site,
            return_target,
            in_shadow_region,
        };
        if let Some(fault) = thread.shadow_stack.push_call(frame, thread.current) {
            self.report(fault);
        }
    }

    fn heartbeat(&self) {
        let (edges, snapshot) = self.with_shared(|shared| {
            shared.counters.heartbeats += 1;
            (shared.graph.take_unflushed(), shared.counters)
        });
        for (key, edge) in edges {
            self.push(AuditRecord::edge(key, edge));
        }
        if self.options().meta_on_clock {
            let stats = self.stats();
            tracing::info!(
                nodes = stats.nodes,
                edges = stats.edges(),
                shadow_regions = stats.shadow_regions,
                "heartbeat"
            );
            self.push(AuditRecord::Statistics(stats));
        } else {
            tracing::debug!(heartbeats = snapshot.heartbeats, "heartbeat");
        }
        self.flush();
    }
}

impl CallbackAuditEvents for AuditDispatcher {
    fn callback_context_switch(&self, thread: &mut ThreadContext, is_return: bool) {
        tracing::debug!(
            thread = thread.id.0,
            depth = thread.shadow_stack.depth(),
            nesting = thread.shadow_stack.nesting(),
            "{}",
            if is_return { "callback return" } else { "callback" }
        );
        if is_return {
            if let Some(fault) = thread.indirect.discard_pending() {
                self.report(fault);
            }
        }
    }

    fn nested_shadow_stack(&self, thread: &mut ThreadContext, push: bool) {
        if push {
            thread.shadow_stack.push_nested();
        } else if let Some(fault) = thread.shadow_stack.pop_nested() {
            self.report(fault);
        }
    }

    fn post_resume(&self, thread: &mut ThreadContext) {
        if let Some(fault) = thread.indirect.discard_pending() {
            self.report(fault);
        }
    }

    fn socket_handle(&self, thread: &ThreadContext, handle: u64, created: bool) {
        if !self.options().network_monitor {
            return;
        }
        let event = self.with_shared(|shared| {
            shared
                .handles
                .socket_handle(thread.id.0, handle, created)
        });
        self.push_network(thread, event);
    }

    fn device_io_control(&self, thread: &ThreadContext, request: &DeviceIoControl) {
        if !self.options().network_monitor {
            return;
        }
        let event = self.with_shared(|shared| shared.handles.device_io_control(request));
        self.push_network(thread, event);
    }

    fn wait_for_single_object(&self, thread: &ThreadContext, handle: u64) {
        if !self.options().network_monitor {
            return;
        }
        let event = self.with_shared(|shared| shared.handles.wait_for_single_object(handle));
        self.push_network(thread, event);
    }

    fn wait_for_multiple_objects(
        &self,
        thread: &ThreadContext,
        result: u32,
        handles: &[u64],
        wait_all: bool,
    ) {
        if !self.options().network_monitor {
            return;
        }
        let event = self.with_shared(|shared| {
            shared
                .handles
                .wait_for_multiple_objects(result, handles, wait_all)
        });
        self.push_network(thread, event);
    }
}

impl AuditDispatcher {
    fn push_network(&self, thread: &ThreadContext, event: Option<NetworkEvent>) {
        if let Some(event) = event {
            self.push(AuditRecord::Network {
                thread: thread.id.0,
                event,
            });
        }
    }
}
