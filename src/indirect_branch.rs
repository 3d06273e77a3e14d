//! Per-thread indirect branch state machine
//!
//! ```text
//!            branch_taken(from)             resolve(to)
//!   Idle ─────────────────────────▶ Pending ───────────▶ Idle
//!                                      │
//!                                      │ check_cache_entry()
//!                                      ▼
//!                                  Disabled   (no further indirect tracking)
//! ```
//!
//! A thread must never re-enter the code cache while its own branch is
//! pending: the destination of that branch was never observed, so its edge is
//! lost. That is a consistency fault. The tracker stops tracking indirect
//! branches for the thread instead of recording edges it can no longer
//! attribute; the monitored program keeps running.

use crate::error::AuditFault;
use crate::fragment::Tag;
use serde::{Deserialize, Serialize};

/// What kind of indirect transfer is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchClass {
    Call,
    Jump,
    Return,
}

/// Current state of one thread's tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndirectBranchState {
    Idle,
    Pending { from: Tag, class: BranchClass },
    /// Tracking stopped after a consistency fault
    Disabled,
}

/// A branch whose target has been observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedBranch {
    pub from: Tag,
    pub to: Tag,
    pub class: BranchClass,
}

/// The pending or most recently resolved indirect path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndirectPath {
    pub from: Tag,
    pub to: Option<Tag>,
    pub class: BranchClass,
}

#[derive(Debug)]
pub struct IndirectBranchTracker {
    thread: u64,
    state: IndirectBranchState,
    last_path: Option<IndirectPath>,
    resolved: u64,
}

impl IndirectBranchTracker {
    pub fn new(thread: u64) -> Self {
        Self {
            thread,
            state: IndirectBranchState::Idle,
            last_path: None,
            resolved: 0,
        }
    }

    pub fn state(&self) -> IndirectBranchState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, IndirectBranchState::Pending { .. })
    }

    pub fn is_disabled(&self) -> bool {
        self.state == IndirectBranchState::Disabled
    }

    pub fn pending_from(&self) -> Option<Tag> {
        match self.state {
            IndirectBranchState::Pending { from, .. } => Some(from),
            _ => None,
        }
    }

    /// Pending path, or the last resolved one
    pub fn last_path(&self) -> Option<IndirectPath> {
        match self.state {
            IndirectBranchState::Pending { from, class } => Some(IndirectPath {
                from,
                to: None,
                class,
            }),
            _ => self.last_path,
        }
    }

    pub fn resolved_count(&self) -> u64 {
        self.resolved
    }

    /// An indirect exit was taken from `from` and its target is not cached
    ///
    /// A branch that was still pending is replaced and reported, since only
    /// one branch may be in flight per thread.
    pub fn branch_taken(&mut self, from: Tag, class: BranchClass) -> Result<(), AuditFault> {
        match self.state {
            IndirectBranchState::Disabled => Ok(()),
            IndirectBranchState::Idle => {
                self.state = IndirectBranchState::Pending { from, class };
                Ok(())
            }
            IndirectBranchState::Pending { from: previous, .. } => {
                self.state = IndirectBranchState::Pending { from, class };
                Err(AuditFault::PendingOverwritten {
                    thread: self.thread,
                    previous,
                    from,
                })
            }
        }
    }

    /// The thread entered fragment `to`; resolves a pending branch
    pub fn resolve(&mut self, to: Tag) -> Option<ResolvedBranch> {
        let IndirectBranchState::Pending { from, class } = self.state else {
            return None;
        };
        self.state = IndirectBranchState::Idle;
        self.resolved += 1;
        self.last_path = Some(IndirectPath {
            from,
            to: Some(to),
            class,
        });
        Some(ResolvedBranch { from, to, class })
    }

    /// The engine is about to resume dispatch into the cache
    pub fn check_cache_entry(&mut self) -> Result<(), AuditFault> {
        match self.state {
            IndirectBranchState::Pending { from, .. } => {
                self.state = IndirectBranchState::Disabled;
                Err(AuditFault::PendingOnCacheEntry {
                    thread: self.thread,
                    from,
                })
            }
            _ => Ok(()),
        }
    }

    /// Drop a pending branch after the OS restored a thread context
    pub fn discard_pending(&mut self) -> Option<AuditFault> {
        let from = self.pending_from()?;
        self.state = IndirectBranchState::Idle;
        Some(AuditFault::PendingDiscarded {
            thread: self.thread,
            from,
        })
    }

    /// Teardown: report a branch that never resolved
    pub fn drain(&mut self) -> Option<AuditFault> {
        let from = self.pending_from()?;
        self.state = IndirectBranchState::Idle;
        Some(AuditFault::PendingAtExit {
            thread: self.thread,
            from,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_pending_idle() {
        let mut tracker = IndirectBranchTracker::new(1);
        assert!(tracker.branch_taken(Tag(0xA), BranchClass::Jump).is_ok());
        assert!(tracker.is_pending());

        let resolved = tracker.resolve(Tag(0xB)).unwrap();
        assert_eq!(resolved.from, Tag(0xA));
        assert_eq!(resolved.to, Tag(0xB));
        assert_eq!(tracker.state(), IndirectBranchState::Idle);
        assert!(tracker.check_cache_entry().is_ok());
    }

    #[test]
    fn test_resolve_without_pending() {
        let mut tracker = IndirectBranchTracker::new(1);
        assert!(tracker.resolve(Tag(0xB)).is_none());
        assert_eq!(tracker.resolved_count(), 0);
    }

    #[test]
    fn test_cache_entry_while_pending_disables() {
        let mut tracker = IndirectBranchTracker::new(7);
        tracker.branch_taken(Tag(0xA), BranchClass::Call).unwrap();

        let fault = tracker.check_cache_entry().unwrap_err();
        assert_eq!(
            fault,
            AuditFault::PendingOnCacheEntry {
                thread: 7,
                from: Tag(0xA)
            }
        );
        assert!(tracker.is_disabled());

        // further indirect tracking is off for this thread
        assert!(tracker.branch_taken(Tag(0xC), BranchClass::Jump).is_ok());
        assert!(!tracker.is_pending());
        assert!(tracker.check_cache_entry().is_ok());
    }

    #[test]
    fn test_second_branch_replaces_pending() {
        let mut tracker = IndirectBranchTracker::new(1);
        tracker.branch_taken(Tag(0xA), BranchClass::Jump).unwrap();
        let fault = tracker.branch_taken(Tag(0xC), BranchClass::Jump).unwrap_err();

        assert!(matches!(
            fault,
            AuditFault::PendingOverwritten { previous, .. } if previous == Tag(0xA)
        ));
        assert_eq!(tracker.pending_from(), Some(Tag(0xC)));
    }

    #[test]
    fn test_last_path_tracks_pending_then_resolved() {
        let mut tracker = IndirectBranchTracker::new(1);
        assert!(tracker.last_path().is_none());

        tracker.branch_taken(Tag(0xA), BranchClass::Return).unwrap();
        assert_eq!(tracker.last_path().unwrap().to, None);

        tracker.resolve(Tag(0xB));
        let path = tracker.last_path().unwrap();
        assert_eq!(path.to, Some(Tag(0xB)));
        assert_eq!(path.class, BranchClass::Return);
    }

    #[test]
    fn test_discard_and_drain() {
        let mut tracker = IndirectBranchTracker::new(1);
        assert!(tracker.discard_pending().is_none());

        tracker.branch_taken(Tag(0xA), BranchClass::Jump).unwrap();
        assert!(matches!(
            tracker.discard_pending(),
            Some(AuditFault::PendingDiscarded { .. })
        ));

        tracker.branch_taken(Tag(0xA), BranchClass::Jump).unwrap();
        assert!(matches!(tracker.drain(), Some(AuditFault::PendingAtExit { .. })));
        assert!(tracker.drain().is_none());
    }
}
