//! Fault taxonomy for the audit layer
//!
//! Faults are values. The component that detects one logs it and turns it into
//! an [`AuditRecord::Fault`](crate::records::AuditRecord) so nothing ever
//! unwinds into the translation engine.

use crate::fragment::Tag;
use serde::Serialize;
use thiserror::Error;

/// Broad classification used for counters and log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    /// Lost or mis-ordered state; tracking for the offender degrades
    Consistency,
    /// State was reset to a safe baseline and execution continues
    Resync,
    /// Diagnostic about upstream copy deduplication
    DedupWarning,
    /// Bad data from an external collaborator
    ExternalInput,
}

/// A fault detected while processing an engine event
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AuditFault {
    #[error("entering fcache with pending indirect branch {from} (thread {thread})")]
    PendingOnCacheEntry { thread: u64, from: Tag },

    #[error("indirect branch from {previous} was still pending when {from} was taken (thread {thread})")]
    PendingOverwritten {
        thread: u64,
        previous: Tag,
        from: Tag,
    },

    #[error("indirect branch from {from} still pending at process exit (thread {thread})")]
    PendingAtExit { thread: u64, from: Tag },

    #[error("pending indirect branch from {from} discarded by context restore (thread {thread})")]
    PendingDiscarded { thread: u64, from: Tag },

    #[error("conflicting direct link {from} exit {ordinal}: existing target {existing}, new target {rejected}")]
    ConflictingDirectLink {
        from: Tag,
        ordinal: u8,
        existing: Tag,
        rejected: Tag,
    },

    #[error("shadow stack underflow on return to {target} (thread {thread})")]
    ShadowStackUnderflow { thread: u64, target: Tag },

    #[error("nested shadow stack underflow (thread {thread})")]
    NestedStackUnderflow { thread: u64 },

    #[error("call site {call_site} does not match executing fragment {current} (thread {thread})")]
    CallSiteMismatch {
        thread: u64,
        call_site: Tag,
        current: Tag,
    },

    #[error("return to {actual} but shadow stack expected {expected} (thread {thread})")]
    ReturnMismatch {
        thread: u64,
        expected: Tag,
        actual: Tag,
    },

    #[error("removing one of {copies} live copies of basic block {tag}")]
    DuplicateCopyRemoved { tag: Tag, copies: u32 },

    #[error("module lookup failed for {addr}: {reason}")]
    ModuleLookupFailed { addr: Tag, reason: String },
}

impl AuditFault {
    pub fn class(&self) -> FaultClass {
        match self {
            AuditFault::PendingOnCacheEntry { .. }
            | AuditFault::PendingOverwritten { .. }
            | AuditFault::PendingAtExit { .. }
            | AuditFault::ConflictingDirectLink { .. } => FaultClass::Consistency,
            AuditFault::PendingDiscarded { .. }
            | AuditFault::ShadowStackUnderflow { .. }
            | AuditFault::NestedStackUnderflow { .. }
            | AuditFault::CallSiteMismatch { .. }
            | AuditFault::ReturnMismatch { .. } => FaultClass::Resync,
            AuditFault::DuplicateCopyRemoved { .. } => FaultClass::DedupWarning,
            AuditFault::ModuleLookupFailed { .. } => FaultClass::ExternalInput,
        }
    }

    /// Log the fault at the level its class calls for
    pub fn log(&self) {
        match self.class() {
            FaultClass::Consistency => tracing::error!(fault = ?self.class(), "{}", self),
            FaultClass::Resync | FaultClass::DedupWarning => {
                tracing::warn!(fault = ?self.class(), "{}", self)
            }
            FaultClass::ExternalInput => tracing::debug!(fault = ?self.class(), "{}", self),
        }
    }
}
