//! Instrumentation hook registry
//!
//! The engine asks where to insert indirect-branch and return-site
//! instrumentation while it builds fragments and generated routines. Each
//! insertion point gets a [`HookId`] that later runtime notifications carry.
//! The registry also remembers which indirect branch lookup (IBL) routines
//! were instrumented, so a pc that lands inside an inserted prologue can be
//! mapped back to the routine start.

use crate::fragment::Tag;
use fnv::FnvHashMap;
use serde::Serialize;

/// Bytes inserted at the start of an IBL routine by the notification hook
pub const IBL_HOOK_PROLOGUE_LEN: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HookId(pub u32);

/// What an inserted hook reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HookSite {
    IndirectBranch {
        tag: Tag,
        is_return: bool,
        syscall: Option<i64>,
    },
    ReturnSite {
        tag: Tag,
    },
}

/// Instrumentation applied to one IBL routine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IblInstrumentation {
    pub not_found_handler: bool,
    pub notification_hook: bool,
    pub fcache_return: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GencodePhase {
    Idle,
    Generating,
    Complete,
}

#[derive(Debug)]
pub struct HookRegistry {
    sites: Vec<HookSite>,
    by_site: FnvHashMap<(Tag, bool), HookId>,
    ibl: FnvHashMap<Tag, IblInstrumentation>,
    ibl_routines: Vec<Tag>,
    syscall_routines: Vec<Tag>,
    phase: GencodePhase,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self {
            sites: Vec::new(),
            by_site: FnvHashMap::default(),
            ibl: FnvHashMap::default(),
            ibl_routines: Vec::new(),
            syscall_routines: Vec::new(),
            phase: GencodePhase::Idle,
        }
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, key: (Tag, bool), site: HookSite) -> HookId {
        if let Some(&id) = self.by_site.get(&key) {
            return id;
        }
        let id = HookId(self.sites.len() as u32);
        self.sites.push(site);
        self.by_site.insert(key, id);
        id
    }

    /// Indirect branch at the end of fragment `tag`
    pub fn indirect_branchpoint(
        &mut self,
        tag: Tag,
        is_return: bool,
        syscall: Option<i64>,
    ) -> HookId {
        self.register(
            (tag, false),
            HookSite::IndirectBranch {
                tag,
                is_return,
                syscall,
            },
        )
    }

    /// Return site that follows a call in fragment `tag`
    pub fn return_site(&mut self, tag: Tag) -> HookId {
        self.register((tag, true), HookSite::ReturnSite { tag })
    }

    pub fn site(&self, id: HookId) -> Option<&HookSite> {
        self.sites.get(id.0 as usize)
    }

    pub fn hook_count(&self) -> usize {
        self.sites.len()
    }

    pub fn instrument_ibl_handler(&mut self, routine: Tag) {
        self.ibl.entry(routine).or_default().not_found_handler = true;
    }

    pub fn instrument_ibl_hook(&mut self, routine: Tag) {
        self.ibl.entry(routine).or_default().notification_hook = true;
    }

    pub fn instrument_ibl_fcache_return(&mut self, routine: Tag) {
        self.ibl.entry(routine).or_default().fcache_return = true;
    }

    pub fn ibl_instrumentation(&self, routine: Tag) -> Option<IblInstrumentation> {
        self.ibl.get(&routine).copied()
    }

    /// Map a pc inside an inserted IBL prologue back to the routine start
    pub fn adjust_for_ibl_instrumentation(&self, pc: Tag, raw_start: Tag) -> Tag {
        let hooked = self
            .ibl
            .get(&raw_start)
            .is_some_and(|ibl| ibl.notification_hook);
        if hooked && pc.0 >= raw_start.0 && pc.0 < raw_start.0 + IBL_HOOK_PROLOGUE_LEN {
            raw_start
        } else {
            pc
        }
    }

    pub fn gencode_phase(&mut self, starting: bool) {
        self.phase = if starting {
            GencodePhase::Generating
        } else {
            GencodePhase::Complete
        };
    }

    pub fn phase(&self) -> GencodePhase {
        self.phase
    }

    pub fn gencode_routine(&mut self, pc: Tag, is_syscall: bool) {
        let routines = if is_syscall {
            &mut self.syscall_routines
        } else {
            &mut self.ibl_routines
        };
        if !routines.contains(&pc) {
            routines.push(pc);
        }
    }

    pub fn is_ibl_routine(&self, pc: Tag) -> bool {
        self.ibl_routines.contains(&pc)
    }

    pub fn is_syscall_routine(&self, pc: Tag) -> bool {
        self.syscall_routines.contains(&pc)
    }
}
