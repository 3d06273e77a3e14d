//! Event contract between the translation engine and the audit layer
//!
//! The engine adapter calls one method per engine event. Methods never return
//! errors: faults are handled inside the audit layer. Per-thread events take
//! the thread's [`ThreadContext`] by mutable reference; the context itself is
//! created by [`AuditEvents::thread_init`] and consumed by
//! [`AuditEvents::thread_exit`].
//!
//! Platforms with callback reentrancy and handle-based IO additionally
//! implement [`CallbackAuditEvents`].

use crate::context::{ThreadContext, ThreadId};
use crate::fragment::{FragmentRef, Tag, Translation};
use crate::hooks::HookId;
use crate::indirect_branch::BranchClass;
use serde::{Deserialize, Serialize};

pub use crate::handles::DeviceIoControl;
pub use crate::shadow_pages::{AddressRange, AreaExpansion};

/// How the process is going down
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Termination {
    #[serde(default)]
    pub crash: bool,
    /// The crash was raised outside the engine
    #[serde(default)]
    pub external: bool,
    /// Source location of an engine assertion, if any
    #[serde(default)]
    pub location: Option<String>,
}

impl Termination {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn crash(location: impl Into<String>) -> Self {
        Self {
            crash: true,
            external: false,
            location: Some(location.into()),
        }
    }
}

pub trait AuditEvents {
    // process lifecycle
    fn init(&self, is_fork: bool);
    fn exit(&self);
    fn engine_initialized(&self);
    fn thread_init(&self, thread: ThreadId) -> ThreadContext;
    fn thread_exit(&self, thread: ThreadContext);
    fn process_fork(&self, thread: &mut ThreadContext, name: &str);
    /// Ordered teardown; every still-live thread context is handed back
    fn process_terminating(&self, threads: Vec<ThreadContext>, termination: &Termination);

    // dispatch
    /// The thread is about to execute fragment `tag`
    fn dispatch(&self, thread: &mut ThreadContext, tag: Tag);
    /// The engine is about to resume execution in the code cache
    fn fcache_enter(&self, thread: &mut ThreadContext);

    // linking
    fn fragment_link(&self, thread: &ThreadContext, from: &FragmentRef, to: Tag);
    fn fragment_link_tags(&self, from: Tag, to: Tag, ordinal: u8);
    fn bb_link_complete(&self, fragment: &FragmentRef);

    // syscalls
    fn syscall(&self, thread: &mut ThreadContext, tag: Tag, sysnum: i64);
    fn filter_syscall(&self, sysnum: i64) -> bool;

    // fragment lifecycle
    fn translation(&self, thread: &ThreadContext, translation: &Translation);
    fn fragment_removed(&self, fragment: &FragmentRef);
    fn cache_reset(&self);

    // memory
    fn memory_executable_change(&self, range: AddressRange, becomes_executable: bool);
    fn code_area_expansion(&self, expansion: AreaExpansion, is_engine_area: bool);
    fn code_area(&self, range: AddressRange, created: bool);
    fn code_modification(
        &self,
        thread: &mut ThreadContext,
        writer: Option<Tag>,
        target: AddressRange,
    );
    fn intercept(&self, range: AddressRange);

    // instrumentation points
    fn indirect_branchpoint(&self, tag: Tag, is_return: bool, syscall: Option<i64>) -> HookId;
    fn return_site(&self, tag: Tag) -> HookId;
    fn instrument_ibl_handler(&self, routine: Tag);
    fn instrument_ibl_hook(&self, routine: Tag);
    fn instrument_ibl_fcache_return(&self, routine: Tag);
    fn adjust_for_ibl_instrumentation(&self, pc: Tag, raw_start: Tag) -> Tag;
    fn gencode_phase(&self, starting: bool);
    fn gencode_ibl_routine(&self, pc: Tag, is_syscall: bool);

    // runtime notifications from inserted instrumentation
    fn indirect_branch_taken(&self, thread: &mut ThreadContext, from: Tag, class: BranchClass);
    fn call_taken(&self, thread: &mut ThreadContext, call_site: Tag, return_target: Tag);

    fn heartbeat(&self);
}

/// Callback reentrancy and handle-based IO
pub trait CallbackAuditEvents: AuditEvents {
    fn callback_context_switch(&self, thread: &mut ThreadContext, is_return: bool);
    fn nested_shadow_stack(&self, thread: &mut ThreadContext, push: bool);
    /// The OS restored a saved thread context
    fn post_resume(&self, thread: &mut ThreadContext);
    fn socket_handle(&self, thread: &ThreadContext, handle: u64, created: bool);
    fn device_io_control(&self, thread: &ThreadContext, request: &DeviceIoControl);
    fn wait_for_single_object(&self, thread: &ThreadContext, handle: u64);
    fn wait_for_multiple_objects(
        &self,
        thread: &ThreadContext,
        result: u32,
        handles: &[u64],
        wait_all: bool,
    );
}
