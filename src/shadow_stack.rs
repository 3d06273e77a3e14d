//! Per-thread shadow call stack
//!
//! The stack is a best-effort control-flow aid. Mismatches and underflows are
//! reported and resynchronised; they never change the monitored program's
//! control flow.
//!
//! Platform callbacks can re-enter the program while calls are outstanding.
//! Each callback entry opens a new segment on top of the call stack, so frames
//! pushed inside the callback can never pair with returns outside it, and
//! the callback exit discards whatever the segment still holds.
//!
//! The stack also carries the thread's suspicion marker: the depth at which a
//! suspicious transfer was observed. The marker clears when the stack unwinds
//! below that depth.

use crate::error::AuditFault;
use crate::fragment::Tag;
use serde::Serialize;

/// One outstanding call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShadowFrame {
    pub call_site: Tag,
    pub return_target: Tag,
    /// The call was made from dynamically generated code
    pub in_shadow_region: bool,
}

/// Why the suspicion marker was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionReason {
    ReturnMismatch,
    ShadowCodeTarget,
}

/// Stack position at which something suspicious happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SuspicionMark {
    pub depth: usize,
    pub raised_at: Tag,
    pub reason: SuspicionReason,
}

/// Outcome of a return transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnCheck {
    Matched(ShadowFrame),
    /// Target did not match the top frame; the stack was resynchronised
    Mismatch {
        expected: Tag,
        fault: AuditFault,
    },
    /// Nothing to return to in the current segment
    Underflow(AuditFault),
}

#[derive(Debug)]
pub struct ShadowStack {
    thread: u64,
    /// Never empty; index 0 is the base call stack
    segments: Vec<Vec<ShadowFrame>>,
    suspicion: Option<SuspicionMark>,
}

impl ShadowStack {
    pub fn new(thread: u64) -> Self {
        Self {
            thread,
            segments: vec![Vec::new()],
            suspicion: None,
        }
    }

    /// Total frames across all segments
    pub fn depth(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    /// Frames in the innermost segment
    pub fn segment_depth(&self) -> usize {
        self.top_segment().len()
    }

    /// Number of open callback segments
    pub fn nesting(&self) -> usize {
        self.segments.len() - 1
    }

    pub fn top(&self) -> Option<&ShadowFrame> {
        self.top_segment().last()
    }

    fn top_segment(&self) -> &Vec<ShadowFrame> {
        // segments always holds the base call stack
        &self.segments[self.segments.len() - 1]
    }

    fn top_segment_mut(&mut self) -> &mut Vec<ShadowFrame> {
        let idx = self.segments.len() - 1;
        &mut self.segments[idx]
    }

    /// Push a call; `current` is the fragment the thread is executing
    ///
    /// The frame is pushed even when the call site does not match.
    pub fn push_call(&mut self, frame: ShadowFrame, current: Option<Tag>) -> Option<AuditFault> {
        self.top_segment_mut().push(frame);
        match current {
            Some(current) if current != frame.call_site => Some(AuditFault::CallSiteMismatch {
                thread: self.thread,
                call_site: frame.call_site,
                current,
            }),
            _ => None,
        }
    }

    /// Whether `target` is the return target of the top frame
    pub fn validate_return(&self, target: Tag) -> bool {
        self.top().is_some_and(|f| f.return_target == target)
    }

    /// Pop on a return transfer to `target`
    ///
    /// On mismatch the segment is unwound to the nearest frame returning to
    /// `target` (longjmp and exception unwinding skip frames). If no frame
    /// matches, only the top frame is popped.
    pub fn pop_return(&mut self, target: Tag) -> ReturnCheck {
        let thread = self.thread;
        let segment = self.top_segment_mut();
        let Some(top) = segment.last().copied() else {
            return ReturnCheck::Underflow(AuditFault::ShadowStackUnderflow { thread, target });
        };

        let check = if top.return_target == target {
            segment.pop();
            ReturnCheck::Matched(top)
        } else {
            match segment.iter().rposition(|f| f.return_target == target) {
                Some(idx) => segment.truncate(idx),
                None => {
                    segment.pop();
                }
            }
            ReturnCheck::Mismatch {
                expected: top.return_target,
                fault: AuditFault::ReturnMismatch {
                    thread,
                    expected: top.return_target,
                    actual: target,
                },
            }
        };

        self.clear_stale_suspicion();
        check
    }

    /// Callback entry: open a new segment
    pub fn push_nested(&mut self) {
        self.segments.push(Vec::new());
    }

    /// Callback exit: discard the innermost segment
    ///
    /// An exit with no open segment means the call accounting is lost; the
    /// stack resynchronises to empty.
    pub fn pop_nested(&mut self) -> Option<AuditFault> {
        if self.segments.len() == 1 {
            self.reset();
            return Some(AuditFault::NestedStackUnderflow {
                thread: self.thread,
            });
        }
        self.segments.pop();
        self.clear_stale_suspicion();
        None
    }

    /// Drop every frame and segment
    pub fn reset(&mut self) {
        self.segments.truncate(1);
        self.segments[0].clear();
        self.suspicion = None;
    }

    pub fn raise_suspicion(&mut self, raised_at: Tag, reason: SuspicionReason) {
        if self.suspicion.is_none() {
            self.suspicion = Some(SuspicionMark {
                depth: self.depth(),
                raised_at,
                reason,
            });
        }
    }

    pub fn suspicion(&self) -> Option<SuspicionMark> {
        self.suspicion
    }

    fn clear_stale_suspicion(&mut self) {
        if let Some(mark) = self.suspicion {
            if self.depth() < mark.depth {
                self.suspicion = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(call_site: u64, ret: u64) -> ShadowFrame {
        ShadowFrame {
            call_site: Tag(call_site),
            return_target: Tag(ret),
            in_shadow_region: false,
        }
    }

    #[test]
    fn test_balanced_calls_return_to_zero() {
        let mut stack = ShadowStack::new(1);
        for i in 0..5u64 {
            assert!(stack.push_call(frame(i * 0x10, i * 0x10 + 5), None).is_none());
        }
        assert_eq!(stack.depth(), 5);
        for i in (0..5u64).rev() {
            assert!(matches!(stack.pop_return(Tag(i * 0x10 + 5)), ReturnCheck::Matched(_)));
        }
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_call_site_mismatch_still_pushes() {
        let mut stack = ShadowStack::new(1);
        let fault = stack.push_call(frame(0x10, 0x15), Some(Tag(0x99)));
        assert!(matches!(fault, Some(AuditFault::CallSiteMismatch { .. })));
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_validate_return() {
        let mut stack = ShadowStack::new(1);
        assert!(!stack.validate_return(Tag(0x15)));
        stack.push_call(frame(0x10, 0x15), None);
        assert!(stack.validate_return(Tag(0x15)));
        assert!(!stack.validate_return(Tag(0x16)));
    }

    #[test]
    fn test_underflow_stays_at_zero() {
        let mut stack = ShadowStack::new(3);
        match stack.pop_return(Tag(0x15)) {
            ReturnCheck::Underflow(AuditFault::ShadowStackUnderflow { thread, .. }) => {
                assert_eq!(thread, 3)
            }
            other => panic!("expected underflow, got {:?}", other),
        }
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_mismatch_unwinds_to_matching_frame() {
        let mut stack = ShadowStack::new(1);
        stack.push_call(frame(0x10, 0x15), None);
        stack.push_call(frame(0x20, 0x25), None);
        stack.push_call(frame(0x30, 0x35), None);

        let check = stack.pop_return(Tag(0x15));
        assert!(matches!(check, ReturnCheck::Mismatch { expected, .. } if expected == Tag(0x35)));
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_mismatch_without_match_pops_top() {
        let mut stack = ShadowStack::new(1);
        stack.push_call(frame(0x10, 0x15), None);
        stack.push_call(frame(0x20, 0x25), None);

        assert!(matches!(stack.pop_return(Tag(0x99)), ReturnCheck::Mismatch { .. }));
        assert_eq!(stack.depth(), 1);
        assert!(stack.validate_return(Tag(0x15)));
    }

    #[test]
    fn test_nested_segment_isolates_callback() {
        let mut stack = ShadowStack::new(1);
        stack.push_call(frame(0x10, 0x15), None);

        stack.push_nested();
        assert_eq!(stack.nesting(), 1);
        // a return inside the callback cannot consume the outer frame
        assert!(matches!(stack.pop_return(Tag(0x15)), ReturnCheck::Underflow(_)));
        stack.push_call(frame(0x40, 0x45), None);
        assert!(stack.pop_nested().is_none());

        assert_eq!(stack.depth(), 1);
        assert!(matches!(stack.pop_return(Tag(0x15)), ReturnCheck::Matched(_)));
    }

    #[test]
    fn test_nested_underflow_resynchronises() {
        let mut stack = ShadowStack::new(1);
        stack.push_call(frame(0x10, 0x15), None);
        stack.raise_suspicion(Tag(0x10), SuspicionReason::ReturnMismatch);

        assert!(matches!(
            stack.pop_nested(),
            Some(AuditFault::NestedStackUnderflow { .. })
        ));
        assert_eq!(stack.nesting(), 0);
        assert_eq!(stack.depth(), 0);
        assert!(stack.suspicion().is_none());
    }

    #[test]
    fn test_suspicion_clears_below_mark() {
        let mut stack = ShadowStack::new(1);
        stack.push_call(frame(0x10, 0x15), None);
        stack.push_call(frame(0x20, 0x25), None);
        stack.raise_suspicion(Tag(0x20), SuspicionReason::ShadowCodeTarget);
        assert_eq!(stack.suspicion().unwrap().depth, 2);

        stack.pop_return(Tag(0x25));
        assert!(stack.suspicion().is_none());
    }

    #[test]
    fn test_reset() {
        let mut stack = ShadowStack::new(1);
        stack.push_call(frame(0x10, 0x15), None);
        stack.push_nested();
        stack.raise_suspicion(Tag(0x10), SuspicionReason::ReturnMismatch);
        stack.reset();
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.nesting(), 0);
        assert!(stack.suspicion().is_none());
    }
}
