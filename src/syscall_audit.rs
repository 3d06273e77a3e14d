//! Watched-syscall filter and classifier

use crate::fragment::Tag;
use crate::indirect_branch::IndirectPath;
use crate::shadow_stack::SuspicionMark;
use fnv::FnvHashSet;
use serde::Serialize;

/// x86_64 name of the syscalls the auditor cares about
///
/// Returns `"syscall_NNN"` for anything else.
pub fn syscall_name(num: i64) -> String {
    let name = match num {
        0 => "read",
        1 => "write",
        3 => "close",
        9 => "mmap",
        10 => "mprotect",
        11 => "munmap",
        16 => "ioctl",
        25 => "mremap",
        41 => "socket",
        42 => "connect",
        43 => "accept",
        44 => "sendto",
        45 => "recvfrom",
        56 => "clone",
        57 => "fork",
        58 => "vfork",
        59 => "execve",
        60 => "exit",
        231 => "exit_group",
        322 => "execveat",
        329 => "pkey_mprotect",
        _ => return format!("syscall_{}", num),
    };
    name.to_string()
}

/// How a syscall crossing was classified
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyscallVerdict {
    /// Forwarded as a plain traversal
    Plain,
    /// Watched syscall reached while a suspicion marker is active
    Suspicious {
        mark: SuspicionMark,
        path: Option<IndirectPath>,
        stack_depth: usize,
    },
}

impl SyscallVerdict {
    pub fn is_suspicious(&self) -> bool {
        matches!(self, SyscallVerdict::Suspicious { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SyscallAuditor {
    watched: FnvHashSet<i64>,
    monitor: bool,
}

impl SyscallAuditor {
    pub fn new(watched: &[i64], monitor: bool) -> Self {
        Self {
            watched: watched.iter().copied().collect(),
            monitor,
        }
    }

    /// Fast filter consulted by the engine before routing a syscall to us
    pub fn should_intercept(&self, sysnum: i64) -> bool {
        self.watched.contains(&sysnum)
    }

    pub fn watched(&self) -> impl Iterator<Item = i64> + '_ {
        self.watched.iter().copied()
    }

    /// Classify one crossing from fragment `tag`
    ///
    /// Suspicion needs monitoring enabled, a watched syscall and an active
    /// marker on the calling thread. Traversal bookkeeping happens elsewhere
    /// regardless of the verdict.
    pub fn classify(
        &self,
        tag: Tag,
        sysnum: i64,
        mark: Option<SuspicionMark>,
        path: Option<IndirectPath>,
        stack_depth: usize,
    ) -> SyscallVerdict {
        if !self.monitor || !self.should_intercept(sysnum) {
            return SyscallVerdict::Plain;
        }
        match mark {
            Some(mark) => {
                tracing::warn!(
                    %tag,
                    syscall = %syscall_name(sysnum),
                    raised_at = %mark.raised_at,
                    "watched syscall under suspicion"
                );
                SyscallVerdict::Suspicious {
                    mark,
                    path,
                    stack_depth,
                }
            }
            None => SyscallVerdict::Plain,
        }
    }
}
