//! Link graph between fragment identities
//!
//! Edges are keyed by `(from, to, exit ordinal)`. Direct edges come from the
//! engine's link events with an explicit ordinal; indirect and return edges
//! are discovered when the branch executes and usually carry the
//! [`UNKNOWN_ORDINAL`] sentinel.
//!
//! # Invariants
//!
//! - A key is inserted at most once; repeating an insert is a no-op.
//! - If a transfer is seen both as direct and as indirect, the edge is direct.
//!   The indirect observation is kept on the edge as an audit-trail sequence
//!   number, never as a second edge. An indirect edge recorded under
//!   [`UNKNOWN_ORDINAL`] is folded into the direct edge once the link names
//!   its ordinal.
//! - A direct exit ordinal names one target for the lifetime of the `from`
//!   identity. A conflicting link is rejected and the old edge wins.
//!
//! ```
//! use flowaudit::fragment::{FragmentTable, Tag};
//! use flowaudit::link_graph::{EdgeKind, LinkGraph, LinkOutcome};
//!
//! let mut fragments = FragmentTable::new();
//! let mut graph = LinkGraph::new();
//!
//! let first = graph.notify_direct_link(&mut fragments, Tag(0x1000), Tag(0x2000), 0);
//! let again = graph.notify_direct_link(&mut fragments, Tag(0x1000), Tag(0x2000), 0);
//! assert_eq!(first, LinkOutcome::Inserted);
//! assert_eq!(again, LinkOutcome::Unchanged);
//! assert_eq!(graph.edge_count(), 1);
//! assert_eq!(graph.kind_of(Tag(0x1000), Tag(0x2000), 0), Some(EdgeKind::Direct));
//! ```

use crate::error::AuditFault;
use crate::fragment::{FragmentTable, Tag};
use fnv::{FnvHashMap, FnvHashSet};
use serde::Serialize;

/// Exit ordinal used when the engine could not classify the exit
pub const UNKNOWN_ORDINAL: u8 = 0xFF;

/// Classification of an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Direct,
    Indirect,
    Return,
}

/// Identity of an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EdgeKey {
    pub from: Tag,
    pub to: Tag,
    pub ordinal: u8,
}

impl EdgeKey {
    pub fn new(from: Tag, to: Tag, ordinal: u8) -> Self {
        Self { from, to, ordinal }
    }
}

/// Per-edge bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EdgeRecord {
    pub kind: EdgeKind,
    /// Discovery sequence number of the first observation
    pub discovered: u64,
    /// Sequence number of the first indirect observation, if any
    pub indirect_seen: Option<u64>,
}

/// What an insert did to the graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Inserted,
    /// An indirect edge was reclassified as direct
    Upgraded,
    Unchanged,
    Rejected(AuditFault),
}

impl LinkOutcome {
    /// True when the edge set changed shape
    pub fn is_new(&self) -> bool {
        matches!(self, LinkOutcome::Inserted)
    }
}

/// The process-wide directed link graph
#[derive(Debug, Default)]
pub struct LinkGraph {
    edges: FnvHashMap<EdgeKey, EdgeRecord>,
    outgoing: FnvHashMap<Tag, FnvHashSet<EdgeKey>>,
    incoming: FnvHashMap<Tag, FnvHashSet<EdgeKey>>,
    syscalls: FnvHashMap<(Tag, i64), u64>,
    sequence: u64,
    unflushed: Vec<EdgeKey>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a direct edge known at link time
    ///
    /// An ordinal of [`UNKNOWN_ORDINAL`] is routed to
    /// [`notify_incoming_link`](Self::notify_incoming_link).
    pub fn notify_direct_link(
        &mut self,
        fragments: &mut FragmentTable,
        from: Tag,
        to: Tag,
        ordinal: u8,
    ) -> LinkOutcome {
        if ordinal == UNKNOWN_ORDINAL {
            return self.notify_incoming_link(from, to);
        }

        if let Err(existing) = fragments.record_exit_target(from, ordinal, to) {
            return LinkOutcome::Rejected(AuditFault::ConflictingDirectLink {
                from,
                ordinal,
                existing,
                rejected: to,
            });
        }

        let key = EdgeKey::new(from, to, ordinal);
        match self.edges.get_mut(&key) {
            Some(edge) if edge.kind == EdgeKind::Direct => LinkOutcome::Unchanged,
            Some(edge) => {
                edge.kind = EdgeKind::Direct;
                tracing::trace!(%from, %to, ordinal, "indirect edge reclassified as direct");
                LinkOutcome::Upgraded
            }
            None => {
                let folded = self.take_unknown_indirect(from, to);
                self.insert(key, EdgeKind::Direct);
                match (folded, self.edges.get_mut(&key)) {
                    (Some(seen), Some(edge)) => {
                        edge.indirect_seen = Some(seen);
                        tracing::trace!(%from, %to, ordinal, "indirect edge folded into direct");
                        LinkOutcome::Upgraded
                    }
                    _ => LinkOutcome::Inserted,
                }
            }
        }
    }

    /// Remove the unknown-ordinal indirect edge `from -> to`, if any
    ///
    /// Returns its indirect observation sequence number.
    fn take_unknown_indirect(&mut self, from: Tag, to: Tag) -> Option<u64> {
        let key = EdgeKey::new(from, to, UNKNOWN_ORDINAL);
        if self.edges.get(&key)?.kind != EdgeKind::Indirect {
            return None;
        }
        let edge = self.edges.remove(&key)?;
        if let Some(set) = self.outgoing.get_mut(&from) {
            set.remove(&key);
        }
        if let Some(set) = self.incoming.get_mut(&to) {
            set.remove(&key);
        }
        edge.indirect_seen
    }

    /// Exit ordinal of a direct edge `from -> to`
    ///
    /// Runtime resolution uses it so that an observed transfer over a
    /// direct link lands on the direct key. The lowest ordinal wins when
    /// several exits lead to `to`.
    pub fn direct_ordinal(&self, from: Tag, to: Tag) -> Option<u8> {
        self.outgoing
            .get(&from)?
            .iter()
            .filter(|k| k.to == to)
            .filter(|k| self.edges.get(*k).is_some_and(|e| e.kind == EdgeKind::Direct))
            .map(|k| k.ordinal)
            .min()
    }

    /// Record an edge whose exit ordinal is unknown
    pub fn notify_incoming_link(&mut self, from: Tag, to: Tag) -> LinkOutcome {
        self.notify_indirect_link(from, to, UNKNOWN_ORDINAL, EdgeKind::Indirect)
    }

    /// Record an edge discovered at run time
    pub fn notify_indirect_link(
        &mut self,
        from: Tag,
        to: Tag,
        ordinal: u8,
        kind: EdgeKind,
    ) -> LinkOutcome {
        let key = EdgeKey::new(from, to, ordinal);
        match self.edges.get_mut(&key) {
            Some(edge) => {
                if edge.kind == EdgeKind::Direct && edge.indirect_seen.is_none() {
                    self.sequence += 1;
                    edge.indirect_seen = Some(self.sequence);
                }
                LinkOutcome::Unchanged
            }
            None => {
                let kind = if kind == EdgeKind::Direct {
                    EdgeKind::Indirect
                } else {
                    kind
                };
                self.insert(key, kind);
                LinkOutcome::Inserted
            }
        }
    }

    fn insert(&mut self, key: EdgeKey, kind: EdgeKind) {
        self.sequence += 1;
        let indirect_seen = (kind != EdgeKind::Direct).then_some(self.sequence);
        self.edges.insert(
            key,
            EdgeRecord {
                kind,
                discovered: self.sequence,
                indirect_seen,
            },
        );
        self.outgoing.entry(key.from).or_default().insert(key);
        self.incoming.entry(key.to).or_default().insert(key);
        self.unflushed.push(key);
        tracing::trace!(
            from = %key.from,
            to = %key.to,
            ordinal = key.ordinal,
            ?kind,
            "edge inserted"
        );
    }

    /// Remove every edge and syscall traversal touching a retired identity
    ///
    /// Returns the number of edges removed.
    pub fn notify_link_removed(&mut self, tag: Tag) -> usize {
        let mut keys: Vec<EdgeKey> = Vec::new();
        if let Some(out) = self.outgoing.remove(&tag) {
            keys.extend(out);
        }
        if let Some(inc) = self.incoming.remove(&tag) {
            keys.extend(inc);
        }

        let mut removed = 0;
        for key in keys {
            if self.edges.remove(&key).is_none() {
                // self loop, already counted through the other index
                continue;
            }
            removed += 1;
            if key.from != tag {
                if let Some(set) = self.outgoing.get_mut(&key.from) {
                    set.remove(&key);
                }
            }
            if key.to != tag {
                if let Some(set) = self.incoming.get_mut(&key.to) {
                    set.remove(&key);
                }
            }
        }

        self.syscalls.retain(|(from, _), _| *from != tag);
        tracing::debug!(%tag, removed, "edges removed for retired fragment");
        removed
    }

    /// Bookkeeping for a syscall crossing; returns true on first traversal
    pub fn notify_syscall(&mut self, tag: Tag, sysnum: i64) -> bool {
        let count = self.syscalls.entry((tag, sysnum)).or_insert(0);
        *count += 1;
        *count == 1
    }

    pub fn syscall_count(&self, tag: Tag, sysnum: i64) -> u64 {
        self.syscalls.get(&(tag, sysnum)).copied().unwrap_or(0)
    }

    pub fn edge(&self, from: Tag, to: Tag, ordinal: u8) -> Option<&EdgeRecord> {
        self.edges.get(&EdgeKey::new(from, to, ordinal))
    }

    pub fn kind_of(&self, from: Tag, to: Tag, ordinal: u8) -> Option<EdgeKind> {
        self.edge(from, to, ordinal).map(|e| e.kind)
    }

    /// Any edge from `from` to `to`, regardless of ordinal
    pub fn has_edge(&self, from: Tag, to: Tag) -> bool {
        self.outgoing
            .get(&from)
            .is_some_and(|set| set.iter().any(|k| k.to == to))
    }

    pub fn edges_from(&self, tag: Tag) -> Vec<(EdgeKey, EdgeRecord)> {
        self.collect(self.outgoing.get(&tag))
    }

    pub fn edges_to(&self, tag: Tag) -> Vec<(EdgeKey, EdgeRecord)> {
        self.collect(self.incoming.get(&tag))
    }

    fn collect(&self, keys: Option<&FnvHashSet<EdgeKey>>) -> Vec<(EdgeKey, EdgeRecord)> {
        let mut edges: Vec<_> = keys
            .into_iter()
            .flatten()
            .filter_map(|k| self.edges.get(k).map(|e| (*k, *e)))
            .collect();
        edges.sort_by_key(|(k, _)| *k);
        edges
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn count_by_kind(&self, kind: EdgeKind) -> usize {
        self.edges.values().filter(|e| e.kind == kind).count()
    }

    /// Edges inserted since the previous call that are still present
    pub fn take_unflushed(&mut self) -> Vec<(EdgeKey, EdgeRecord)> {
        std::mem::take(&mut self.unflushed)
            .into_iter()
            .filter_map(|k| self.edges.get(&k).map(|e| (k, *e)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EdgeKey, &EdgeRecord)> {
        self.edges.iter()
    }
}
