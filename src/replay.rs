//! Scripted engine driver
//!
//! Replays a recorded or hand-written stream of engine events against an
//! [`AuditDispatcher`], playing the part of the translation engine adapter.
//! Scripts are either one JSON array or JSON lines (blank lines and lines
//! starting with `#` are skipped).
//!
//! ```
//! use flowaudit::replay::{parse_script, EngineEvent};
//!
//! let events = parse_script(r#"
//!     {"event": "thread_init", "thread": 1}
//!     {"event": "dispatch", "thread": 1, "tag": 4096}
//! "#).unwrap();
//! assert_eq!(events.len(), 2);
//! assert!(matches!(events[1], EngineEvent::Dispatch { .. }));
//! ```

use crate::context::{ThreadContext, ThreadId};
use crate::dispatcher::AuditDispatcher;
use crate::events::{
    AddressRange, AreaExpansion, AuditEvents, CallbackAuditEvents, DeviceIoControl, Termination,
};
use crate::fragment::{FragmentRef, Tag, Translation};
use crate::indirect_branch::BranchClass;
use crate::stats::AuditStats;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One engine event as it appears in a script
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Init {
        #[serde(default)]
        is_fork: bool,
    },
    EngineInitialized,
    Exit,
    ThreadInit {
        thread: ThreadId,
    },
    ThreadExit {
        thread: ThreadId,
    },
    Fork {
        thread: ThreadId,
        name: String,
    },
    ProcessTerminating {
        #[serde(default)]
        crash: bool,
        #[serde(default)]
        external: bool,
        #[serde(default)]
        location: Option<String>,
    },
    Dispatch {
        thread: ThreadId,
        tag: Tag,
    },
    FcacheEnter {
        thread: ThreadId,
    },
    Link {
        thread: ThreadId,
        from: FragmentRef,
        to: Tag,
    },
    LinkTags {
        from: Tag,
        to: Tag,
        ordinal: u8,
    },
    BbLinkComplete {
        fragment: FragmentRef,
    },
    Syscall {
        thread: ThreadId,
        tag: Tag,
        sysnum: i64,
    },
    Translation {
        thread: ThreadId,
        translation: Translation,
    },
    FragmentRemoved {
        fragment: FragmentRef,
    },
    CacheReset,
    ExecutableChange {
        start: u64,
        end: u64,
        executable: bool,
    },
    CodeAreaExpansion {
        original: AddressRange,
        expanded: AddressRange,
        #[serde(default)]
        engine: bool,
    },
    CodeArea {
        start: u64,
        end: u64,
        created: bool,
    },
    CodeModification {
        thread: ThreadId,
        #[serde(default)]
        writer: Option<Tag>,
        start: u64,
        size: u64,
    },
    Intercept {
        start: u64,
        end: u64,
    },
    IndirectBranchpoint {
        tag: Tag,
        #[serde(default)]
        is_return: bool,
        #[serde(default)]
        syscall: Option<i64>,
    },
    ReturnSite {
        tag: Tag,
    },
    IblHandler {
        routine: Tag,
    },
    IblHook {
        routine: Tag,
    },
    IblFcacheReturn {
        routine: Tag,
    },
    GencodePhase {
        starting: bool,
    },
    GencodeRoutine {
        pc: Tag,
        #[serde(default)]
        syscall: bool,
    },
    BranchTaken {
        thread: ThreadId,
        from: Tag,
        class: BranchClass,
    },
    CallTaken {
        thread: ThreadId,
        call_site: Tag,
        return_target: Tag,
    },
    Heartbeat,
    CallbackSwitch {
        thread: ThreadId,
        is_return: bool,
    },
    NestedStack {
        thread: ThreadId,
        push: bool,
    },
    PostResume {
        thread: ThreadId,
    },
    Socket {
        thread: ThreadId,
        handle: u64,
        created: bool,
    },
    DeviceIoControl {
        thread: ThreadId,
        request: DeviceIoControl,
    },
    WaitSingle {
        thread: ThreadId,
        handle: u64,
    },
    WaitMultiple {
        thread: ThreadId,
        result: u32,
        handles: Vec<u64>,
        #[serde(default)]
        wait_all: bool,
    },
}

/// Parse a JSON array or JSON-lines script
pub fn parse_script(text: &str) -> Result<Vec<EngineEvent>> {
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(text).context("Failed to parse event array");
    }

    let mut events = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str(line)
            .with_context(|| format!("Failed to parse event on line {}", idx + 1))?;
        events.push(event);
    }
    Ok(events)
}

/// Read and parse a script file
pub fn load_script<P: AsRef<Path>>(path: P) -> Result<Vec<EngineEvent>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    parse_script(&text)
}

fn thread_mut(
    threads: &mut BTreeMap<ThreadId, ThreadContext>,
    id: ThreadId,
) -> Result<&mut ThreadContext> {
    match threads.get_mut(&id) {
        Some(thread) => Ok(thread),
        None => bail!("event for unknown thread {}", id),
    }
}

/// Fake engine adapter owning the live thread contexts
#[derive(Debug)]
pub struct Replayer {
    audit: AuditDispatcher,
    threads: BTreeMap<ThreadId, ThreadContext>,
    applied: usize,
}

impl Replayer {
    pub fn new(audit: AuditDispatcher) -> Self {
        Self {
            audit,
            threads: BTreeMap::new(),
            applied: 0,
        }
    }

    pub fn dispatcher(&self) -> &AuditDispatcher {
        &self.audit
    }

    pub fn thread(&self, id: ThreadId) -> Option<&ThreadContext> {
        self.threads.get(&id)
    }

    pub fn live_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn applied(&self) -> usize {
        self.applied
    }

    pub fn run(&mut self, events: impl IntoIterator<Item = EngineEvent>) -> Result<()> {
        for event in events {
            let index = self.applied;
            self.apply(event)
                .with_context(|| format!("Event #{} failed", index))?;
        }
        Ok(())
    }

    /// Feed one event to the dispatcher
    ///
    /// Errors are script errors (unknown or duplicate thread), never audit
    /// faults.
    pub fn apply(&mut self, event: EngineEvent) -> Result<()> {
        let audit = &self.audit;
        match event {
            EngineEvent::Init { is_fork } => audit.init(is_fork),
            EngineEvent::EngineInitialized => audit.engine_initialized(),
            EngineEvent::Exit => audit.exit(),
            EngineEvent::ThreadInit { thread } => {
                if self.threads.contains_key(&thread) {
                    bail!("thread {} initialised twice", thread);
                }
                let ctx = audit.thread_init(thread);
                self.threads.insert(thread, ctx);
            }
            EngineEvent::ThreadExit { thread } => match self.threads.remove(&thread) {
                Some(ctx) => audit.thread_exit(ctx),
                None => bail!("exit of unknown thread {}", thread),
            },
            EngineEvent::Fork { thread, name } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.process_fork(ctx, &name);
            }
            EngineEvent::ProcessTerminating {
                crash,
                external,
                location,
            } => {
                let threads = std::mem::take(&mut self.threads).into_values().collect();
                let termination = Termination {
                    crash,
                    external,
                    location,
                };
                audit.process_terminating(threads, &termination);
            }
            EngineEvent::Dispatch { thread, tag } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.dispatch(ctx, tag);
            }
            EngineEvent::FcacheEnter { thread } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.fcache_enter(ctx);
            }
            EngineEvent::Link { thread, from, to } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.fragment_link(ctx, &from, to);
            }
            EngineEvent::LinkTags { from, to, ordinal } => {
                audit.fragment_link_tags(from, to, ordinal)
            }
            EngineEvent::BbLinkComplete { fragment } => audit.bb_link_complete(&fragment),
            EngineEvent::Syscall {
                thread,
                tag,
                sysnum,
            } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.syscall(ctx, tag, sysnum);
            }
            EngineEvent::Translation {
                thread,
                translation,
            } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.translation(ctx, &translation);
            }
            EngineEvent::FragmentRemoved { fragment } => audit.fragment_removed(&fragment),
            EngineEvent::CacheReset => audit.cache_reset(),
            EngineEvent::ExecutableChange {
                start,
                end,
                executable,
            } => audit.memory_executable_change(AddressRange::new(start, end), executable),
            EngineEvent::CodeAreaExpansion {
                original,
                expanded,
                engine,
            } => audit.code_area_expansion(AreaExpansion { original, expanded }, engine),
            EngineEvent::CodeArea {
                start,
                end,
                created,
            } => audit.code_area(AddressRange::new(start, end), created),
            EngineEvent::CodeModification {
                thread,
                writer,
                start,
                size,
            } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.code_modification(ctx, writer, AddressRange::with_size(start, size));
            }
            EngineEvent::Intercept { start, end } => audit.intercept(AddressRange::new(start, end)),
            EngineEvent::IndirectBranchpoint {
                tag,
                is_return,
                syscall,
            } => {
                audit.indirect_branchpoint(tag, is_return, syscall);
            }
            EngineEvent::ReturnSite { tag } => {
                audit.return_site(tag);
            }
            EngineEvent::IblHandler { routine } => audit.instrument_ibl_handler(routine),
            EngineEvent::IblHook { routine } => audit.instrument_ibl_hook(routine),
            EngineEvent::IblFcacheReturn { routine } => audit.instrument_ibl_fcache_return(routine),
            EngineEvent::GencodePhase { starting } => audit.gencode_phase(starting),
            EngineEvent::GencodeRoutine { pc, syscall } => audit.gencode_ibl_routine(pc, syscall),
            EngineEvent::BranchTaken {
                thread,
                from,
                class,
            } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.indirect_branch_taken(ctx, from, class);
            }
            EngineEvent::CallTaken {
                thread,
                call_site,
                return_target,
            } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.call_taken(ctx, call_site, return_target);
            }
            EngineEvent::Heartbeat => audit.heartbeat(),
            EngineEvent::CallbackSwitch { thread, is_return } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.callback_context_switch(ctx, is_return);
            }
            EngineEvent::NestedStack { thread, push } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.nested_shadow_stack(ctx, push);
            }
            EngineEvent::PostResume { thread } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.post_resume(ctx);
            }
            EngineEvent::Socket {
                thread,
                handle,
                created,
            } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.socket_handle(ctx, handle, created);
            }
            EngineEvent::DeviceIoControl { thread, request } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.device_io_control(ctx, &request);
            }
            EngineEvent::WaitSingle { thread, handle } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.wait_for_single_object(ctx, handle);
            }
            EngineEvent::WaitMultiple {
                thread,
                result,
                handles,
                wait_all,
            } => {
                let ctx = thread_mut(&mut self.threads, thread)?;
                audit.wait_for_multiple_objects(ctx, result, &handles, wait_all);
            }
        }
        self.applied += 1;
        Ok(())
    }

    /// Tear down anything the script left running and return final stats
    pub fn finish(mut self) -> AuditStats {
        if !self.threads.is_empty() {
            let threads = std::mem::take(&mut self.threads).into_values().collect();
            self.audit.process_terminating(threads, &Termination::clean());
        } else {
            self.audit.heartbeat();
        }
        self.audit.stats()
    }
}
