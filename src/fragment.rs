//! Fragment identity and lifecycle tracking
//!
//! The translation engine may hold several physical copies of the code at one
//! tag: a private basic block, a shared basic block, a trace, and scratch
//! temp-private copies. The audit graph only ever sees one canonical node per
//! tag. This module keeps that node in an arena keyed by tag and tracks how
//! many copies of each class are alive, so that removal of one copy is only
//! turned into a graph mutation when the rules below say the canonical copy
//! is gone.
//!
//! # Removal rules
//!
//! | removed copy              | effect                                         |
//! |---------------------------|------------------------------------------------|
//! | shared trace              | retire (always)                                |
//! | private basic block       | retire, warn if other copies were alive        |
//! | shared basic block        | retire only if it was the last live copy and   |
//! |                           | no live trace contains it                      |
//! | temp-private, private trace | nothing                                      |
//!
//! The rules apply to every qualifying removal, including one that arrives
//! after the node already retired while another copy stayed alive: that copy
//! may have linked since, and its edges must go with it. Retiring never
//! forgets the node. A later rebuild of the same tag re-associates the same
//! [`NodeId`] with an empty exit table.

use crate::error::AuditFault;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entry address of a fragment
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub u64);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({:#x})", self.0)
    }
}

/// Basic block or trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    BasicBlock,
    Trace,
}

/// Sharing class of one physical copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingClass {
    Private,
    Shared,
    TempPrivate,
}

/// The engine's description of one physical fragment copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentRef {
    pub tag: Tag,
    pub kind: FragmentKind,
    pub sharing: SharingClass,
    /// Direct exit targets in exit-ordinal order
    #[serde(default)]
    pub exit_targets: Vec<Tag>,
}

impl FragmentRef {
    pub fn basic_block(tag: Tag, sharing: SharingClass) -> Self {
        Self {
            tag,
            kind: FragmentKind::BasicBlock,
            sharing,
            exit_targets: Vec::new(),
        }
    }

    pub fn trace(tag: Tag, sharing: SharingClass) -> Self {
        Self {
            tag,
            kind: FragmentKind::Trace,
            sharing,
            exit_targets: Vec::new(),
        }
    }

    pub fn with_exits(mut self, exits: impl IntoIterator<Item = Tag>) -> Self {
        self.exit_targets = exits.into_iter().collect();
        self
    }

    /// Ordinal of the direct exit that targets `target`
    ///
    /// Returns `None` when no exit names it or the ordinal would collide with
    /// the unknown-ordinal sentinel.
    pub fn exit_ordinal(&self, target: Tag) -> Option<u8> {
        self.exit_targets
            .iter()
            .position(|&t| t == target)
            .and_then(|idx| u8::try_from(idx).ok())
            .filter(|&ord| ord < crate::link_graph::UNKNOWN_ORDINAL)
    }
}

/// What the engine just built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Translation {
    /// A basic block, optionally ending in a syscall
    BasicBlock {
        fragment: FragmentRef,
        #[serde(default)]
        syscall: Option<i64>,
    },
    /// A trace stitched from the listed block tags
    Trace {
        fragment: FragmentRef,
        #[serde(default)]
        blocks: Vec<Tag>,
    },
}

impl Translation {
    pub fn fragment(&self) -> &FragmentRef {
        match self {
            Translation::BasicBlock { fragment, .. } | Translation::Trace { fragment, .. } => {
                fragment
            }
        }
    }
}

/// Index of a canonical node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub u32);

/// Live copy counts per (kind, sharing class)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CopyCounts([u32; 6]);

impl CopyCounts {
    fn slot(kind: FragmentKind, sharing: SharingClass) -> usize {
        let base = match kind {
            FragmentKind::BasicBlock => 0,
            FragmentKind::Trace => 3,
        };
        base + match sharing {
            SharingClass::Private => 0,
            SharingClass::Shared => 1,
            SharingClass::TempPrivate => 2,
        }
    }

    fn add(&mut self, kind: FragmentKind, sharing: SharingClass) {
        self.0[Self::slot(kind, sharing)] += 1;
    }

    fn remove(&mut self, kind: FragmentKind, sharing: SharingClass) {
        let slot = &mut self.0[Self::slot(kind, sharing)];
        *slot = slot.saturating_sub(1);
    }

    pub fn get(&self, kind: FragmentKind, sharing: SharingClass) -> u32 {
        self.0[Self::slot(kind, sharing)]
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }

    pub fn traces(&self) -> u32 {
        self.0[3..].iter().sum()
    }
}

/// The single graph-visible identity of a tag
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalFragment {
    pub tag: Tag,
    /// Becomes `Trace` once any trace was built at this tag
    pub kind: FragmentKind,
    /// Sharing class of the first observed copy
    pub first_sharing: SharingClass,
    pub copies: CopyCounts,
    pub exit_count: usize,
    /// Exit ordinal -> target, filled in as direct links resolve
    exit_targets: Vec<Option<Tag>>,
    /// Built from code inside a shadow region
    pub shadow_origin: bool,
    pub link_complete: bool,
    pub syscall: Option<i64>,
    /// Number of live traces that contain this block
    pub trace_refs: u32,
    trace_blocks: Vec<Tag>,
    pub retired: bool,
    /// Incremented every time a retired node is rebuilt
    pub generation: u32,
}

impl CanonicalFragment {
    fn new(fragment: &FragmentRef, shadow_origin: bool) -> Self {
        Self {
            tag: fragment.tag,
            kind: fragment.kind,
            first_sharing: fragment.sharing,
            copies: CopyCounts::default(),
            exit_count: fragment.exit_targets.len(),
            exit_targets: vec![None; fragment.exit_targets.len()],
            shadow_origin,
            link_complete: false,
            syscall: None,
            trace_refs: 0,
            trace_blocks: Vec::new(),
            retired: false,
            generation: 0,
        }
    }

    /// Resolved target of a direct exit
    pub fn exit_target(&self, ordinal: u8) -> Option<Tag> {
        self.exit_targets.get(ordinal as usize).copied().flatten()
    }

    pub fn trace_blocks(&self) -> &[Tag] {
        &self.trace_blocks
    }

    pub fn is_live(&self) -> bool {
        self.copies.total() > 0
    }
}

/// Result of a construction event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constructed {
    pub node: NodeId,
    /// First observation of this tag
    pub created: bool,
    /// A retired node was brought back by this construction
    pub rebuilt: bool,
}

/// Result of a removal event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// The canonical copy is gone; the caller removes the tag's edges
    Retire { warning: Option<AuditFault> },
    /// Another copy still backs the node, or the copy was scratch
    Keep,
    /// Never constructed
    Ignored,
}

/// Arena of canonical fragment identities
#[derive(Debug, Default)]
pub struct FragmentTable {
    nodes: Vec<CanonicalFragment>,
    index: FnvHashMap<Tag, NodeId>,
}

impl FragmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes with at least one live copy
    pub fn live_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_live()).count()
    }

    pub fn node_id(&self, tag: Tag) -> Option<NodeId> {
        self.index.get(&tag).copied()
    }

    pub fn get(&self, tag: Tag) -> Option<&CanonicalFragment> {
        self.node_id(tag).map(|id| &self.nodes[id.0 as usize])
    }

    pub fn node(&self, id: NodeId) -> Option<&CanonicalFragment> {
        self.nodes.get(id.0 as usize)
    }

    fn get_mut(&mut self, tag: Tag) -> Option<&mut CanonicalFragment> {
        let id = self.node_id(tag)?;
        self.nodes.get_mut(id.0 as usize)
    }

    /// Record a constructed copy; first observation wins, later ones merge
    pub fn construct(&mut self, fragment: &FragmentRef, shadow_origin: bool) -> Constructed {
        let (node, created) = match self.index.get(&fragment.tag) {
            Some(&id) => (id, false),
            None => {
                let id = NodeId(self.nodes.len() as u32);
                self.nodes.push(CanonicalFragment::new(fragment, shadow_origin));
                self.index.insert(fragment.tag, id);
                (id, true)
            }
        };

        let entry = &mut self.nodes[node.0 as usize];
        let rebuilt = entry.retired;
        if rebuilt {
            entry.retired = false;
            entry.generation += 1;
            tracing::trace!(
                tag = %fragment.tag,
                generation = entry.generation,
                "rebuilt retired fragment"
            );
        }
        if fragment.kind == FragmentKind::Trace {
            entry.kind = FragmentKind::Trace;
        }
        if fragment.exit_targets.len() > entry.exit_count {
            entry.exit_count = fragment.exit_targets.len();
            entry.exit_targets.resize(entry.exit_count, None);
        }
        entry.shadow_origin |= shadow_origin;
        entry.copies.add(fragment.kind, fragment.sharing);

        Constructed {
            node,
            created,
            rebuilt,
        }
    }

    /// Attach the constituent blocks of a freshly built trace
    pub fn set_trace_blocks(&mut self, trace: Tag, blocks: &[Tag]) {
        let previous = match self.get_mut(trace) {
            Some(node) => std::mem::replace(&mut node.trace_blocks, blocks.to_vec()),
            None => return,
        };
        for block in previous {
            if let Some(node) = self.get_mut(block) {
                node.trace_refs = node.trace_refs.saturating_sub(1);
            }
        }
        for &block in blocks {
            if let Some(node) = self.get_mut(block) {
                node.trace_refs += 1;
            }
        }
    }

    pub fn set_syscall(&mut self, tag: Tag, sysnum: i64) {
        if let Some(node) = self.get_mut(tag) {
            node.syscall = Some(sysnum);
        }
    }

    pub fn mark_link_complete(&mut self, tag: Tag) -> bool {
        match self.get_mut(tag) {
            Some(node) => {
                node.link_complete = true;
                true
            }
            None => false,
        }
    }

    /// Apply a removal event to the copy counts and decide the graph effect
    pub fn remove(&mut self, fragment: &FragmentRef) -> Removal {
        let Some(node) = self.get_mut(fragment.tag) else {
            tracing::debug!(tag = %fragment.tag, "removal of unknown fragment");
            return Removal::Ignored;
        };

        let copies_before = node.copies.total();
        node.copies.remove(fragment.kind, fragment.sharing);
        let remaining = node.copies.total();
        let released_blocks = if fragment.kind == FragmentKind::Trace && node.copies.traces() == 0
        {
            std::mem::take(&mut node.trace_blocks)
        } else {
            Vec::new()
        };
        let trace_refs = node.trace_refs;

        for block in released_blocks {
            if let Some(block_node) = self.get_mut(block) {
                block_node.trace_refs = block_node.trace_refs.saturating_sub(1);
            }
        }

        let outcome = match (fragment.kind, fragment.sharing) {
            (FragmentKind::Trace, SharingClass::Shared) => {
                tracing::debug!(tag = %fragment.tag, "removing shared trace");
                Removal::Retire { warning: None }
            }
            (FragmentKind::BasicBlock, SharingClass::Private) => {
                let warning = (copies_before > 1).then(|| AuditFault::DuplicateCopyRemoved {
                    tag: fragment.tag,
                    copies: copies_before,
                });
                tracing::debug!(tag = %fragment.tag, "removing private basic block");
                Removal::Retire { warning }
            }
            (FragmentKind::BasicBlock, SharingClass::Shared)
                if trace_refs == 0 && remaining == 0 =>
            {
                tracing::debug!(tag = %fragment.tag, "removing last shared basic block");
                Removal::Retire { warning: None }
            }
            _ => Removal::Keep,
        };

        if matches!(outcome, Removal::Retire { .. }) {
            self.retire(fragment.tag);
        }
        outcome
    }

    /// Mark the node retired and forget its resolved exits
    ///
    /// Returns false when the node was already retired or is unknown.
    pub fn retire(&mut self, tag: Tag) -> bool {
        let Some(node) = self.get_mut(tag) else {
            return false;
        };
        node.exit_targets.fill(None);
        !std::mem::replace(&mut node.retired, true)
    }

    /// Record the target of a direct exit
    ///
    /// Returns `Err(existing)` when the ordinal already names another target;
    /// the existing target is kept.
    pub fn record_exit_target(&mut self, from: Tag, ordinal: u8, target: Tag) -> Result<(), Tag> {
        let Some(node) = self.get_mut(from) else {
            return Ok(());
        };
        let idx = ordinal as usize;
        if idx >= node.exit_targets.len() {
            node.exit_targets.resize(idx + 1, None);
            node.exit_count = node.exit_count.max(idx + 1);
        }
        match node.exit_targets[idx] {
            Some(existing) if existing != target => Err(existing),
            _ => {
                node.exit_targets[idx] = Some(target);
                Ok(())
            }
        }
    }

    /// The whole code cache was flushed: every copy is gone, identities stay
    pub fn reset_cache(&mut self) {
        for node in &mut self.nodes {
            node.copies = CopyCounts::default();
            node.trace_refs = 0;
            node.trace_blocks.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CanonicalFragment> {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bb(tag: u64, sharing: SharingClass) -> FragmentRef {
        FragmentRef::basic_block(Tag(tag), sharing)
    }

    #[test]
    fn test_first_construction_creates_node() {
        let mut table = FragmentTable::new();
        let c = table.construct(&bb(0x1000, SharingClass::Private), false);
        assert!(c.created);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(Tag(0x1000)).unwrap().copies.total(), 1);
    }

    #[test]
    fn test_duplicate_construction_merges() {
        let mut table = FragmentTable::new();
        let first = table.construct(&bb(0x1000, SharingClass::Shared), false);
        let second = table.construct(&bb(0x1000, SharingClass::TempPrivate), false);
        let trace = table.construct(&FragmentRef::trace(Tag(0x1000), SharingClass::Shared), false);

        assert_eq!(first.node, second.node);
        assert_eq!(first.node, trace.node);
        assert!(!second.created);
        assert_eq!(table.len(), 1);

        let node = table.get(Tag(0x1000)).unwrap();
        assert_eq!(node.kind, FragmentKind::Trace);
        assert_eq!(node.first_sharing, SharingClass::Shared);
        assert_eq!(node.copies.total(), 3);
    }

    #[test]
    fn test_private_bb_removal_retires() {
        let mut table = FragmentTable::new();
        table.construct(&bb(0x1000, SharingClass::Private), false);
        assert_eq!(
            table.remove(&bb(0x1000, SharingClass::Private)),
            Removal::Retire { warning: None }
        );
    }

    #[test]
    fn test_private_bb_removal_warns_on_multiple_copies() {
        let mut table = FragmentTable::new();
        table.construct(&bb(0x1000, SharingClass::Private), false);
        table.construct(&bb(0x1000, SharingClass::Shared), false);

        match table.remove(&bb(0x1000, SharingClass::Private)) {
            Removal::Retire { warning: Some(AuditFault::DuplicateCopyRemoved { copies, .. }) } => {
                assert_eq!(copies, 2)
            }
            other => panic!("unexpected removal outcome: {:?}", other),
        }
    }

    #[test]
    fn test_temp_private_removal_keeps_node() {
        let mut table = FragmentTable::new();
        table.construct(&bb(0x1000, SharingClass::Shared), false);
        table.construct(&bb(0x1000, SharingClass::TempPrivate), false);
        assert_eq!(table.remove(&bb(0x1000, SharingClass::TempPrivate)), Removal::Keep);
    }

    #[test]
    fn test_shared_bb_removal_waits_for_last_copy() {
        let mut table = FragmentTable::new();
        table.construct(&bb(0x1000, SharingClass::Shared), false);
        table.construct(&bb(0x1000, SharingClass::Shared), false);

        assert_eq!(table.remove(&bb(0x1000, SharingClass::Shared)), Removal::Keep);
        assert_eq!(
            table.remove(&bb(0x1000, SharingClass::Shared)),
            Removal::Retire { warning: None }
        );
    }

    #[test]
    fn test_shared_bb_in_live_trace_is_kept() {
        let mut table = FragmentTable::new();
        table.construct(&bb(0x1000, SharingClass::Shared), false);
        table.construct(&bb(0x1010, SharingClass::Shared), false);
        table.construct(&FragmentRef::trace(Tag(0x1000), SharingClass::Shared), false);
        table.set_trace_blocks(Tag(0x1000), &[Tag(0x1000), Tag(0x1010)]);

        assert_eq!(table.remove(&bb(0x1010, SharingClass::Shared)), Removal::Keep);
    }

    #[test]
    fn test_shared_trace_removal_always_retires() {
        let mut table = FragmentTable::new();
        table.construct(&bb(0x1000, SharingClass::Shared), false);
        table.construct(&FragmentRef::trace(Tag(0x1000), SharingClass::Shared), false);
        assert_eq!(
            table.remove(&FragmentRef::trace(Tag(0x1000), SharingClass::Shared)),
            Removal::Retire { warning: None }
        );
    }

    #[test]
    fn test_private_trace_removal_keeps() {
        let mut table = FragmentTable::new();
        table.construct(&FragmentRef::trace(Tag(0x1000), SharingClass::Private), false);
        assert_eq!(
            table.remove(&FragmentRef::trace(Tag(0x1000), SharingClass::Private)),
            Removal::Keep
        );
    }

    #[test]
    fn test_last_private_copy_retires_again() {
        let mut table = FragmentTable::new();
        table.construct(&bb(0x1000, SharingClass::Private), false);
        table.construct(&bb(0x1000, SharingClass::Private), false);

        assert!(matches!(
            table.remove(&bb(0x1000, SharingClass::Private)),
            Removal::Retire { warning: Some(_) }
        ));
        assert!(table.get(Tag(0x1000)).unwrap().retired);
        assert!(table.get(Tag(0x1000)).unwrap().is_live());

        // the surviving copy may have linked in between
        assert_eq!(
            table.remove(&bb(0x1000, SharingClass::Private)),
            Removal::Retire { warning: None }
        );
        assert!(!table.get(Tag(0x1000)).unwrap().is_live());
        assert!(!table.retire(Tag(0x1000)));
    }

    #[test]
    fn test_shared_bb_retires_after_trace_retired() {
        let mut table = FragmentTable::new();
        table.construct(&bb(0x1000, SharingClass::Shared), false);
        table.construct(&FragmentRef::trace(Tag(0x1000), SharingClass::Shared), false);

        assert!(matches!(
            table.remove(&FragmentRef::trace(Tag(0x1000), SharingClass::Shared)),
            Removal::Retire { .. }
        ));
        assert_eq!(
            table.remove(&bb(0x1000, SharingClass::Shared)),
            Removal::Retire { warning: None }
        );
    }

    #[test]
    fn test_retire_clears_exit_targets() {
        let mut table = FragmentTable::new();
        table.construct(&bb(0x1000, SharingClass::Private), false);
        table.record_exit_target(Tag(0x1000), 0, Tag(0x2000)).unwrap();
        table.remove(&bb(0x1000, SharingClass::Private));

        let again = table.construct(&bb(0x1000, SharingClass::Private), false);
        assert!(again.rebuilt);
        assert_eq!(table.get(Tag(0x1000)).unwrap().exit_target(0), None);
        assert!(table.record_exit_target(Tag(0x1000), 0, Tag(0x3000)).is_ok());
        assert_eq!(table.get(Tag(0x1000)).unwrap().exit_target(0), Some(Tag(0x3000)));
    }

    #[test]
    fn test_rebuild_reuses_node() {
        let mut table = FragmentTable::new();
        let first = table.construct(&bb(0x1000, SharingClass::Private), false);
        table.remove(&bb(0x1000, SharingClass::Private));

        let again = table.construct(&bb(0x1000, SharingClass::Private), false);
        assert_eq!(first.node, again.node);
        assert!(again.rebuilt);
        assert_eq!(table.get(Tag(0x1000)).unwrap().generation, 1);
    }

    #[test]
    fn test_exit_target_conflict_keeps_old() {
        let mut table = FragmentTable::new();
        let frag = FragmentRef::trace(Tag(0x1000), SharingClass::Shared)
            .with_exits([Tag(0x2000), Tag(0x3000)]);
        table.construct(&frag, false);

        assert!(table.record_exit_target(Tag(0x1000), 1, Tag(0x3000)).is_ok());
        assert!(table.record_exit_target(Tag(0x1000), 1, Tag(0x3000)).is_ok());
        assert_eq!(
            table.record_exit_target(Tag(0x1000), 1, Tag(0x4000)),
            Err(Tag(0x3000))
        );
        assert_eq!(table.get(Tag(0x1000)).unwrap().exit_target(1), Some(Tag(0x3000)));
    }

    #[test]
    fn test_cache_reset_keeps_identity() {
        let mut table = FragmentTable::new();
        table.construct(&bb(0x1000, SharingClass::Shared), false);
        table.reset_cache();
        assert_eq!(table.len(), 1);
        assert_eq!(table.live_count(), 0);
        assert!(!table.get(Tag(0x1000)).unwrap().retired);
    }

    #[test]
    fn test_exit_ordinal_lookup() {
        let frag = bb(0x1000, SharingClass::Private).with_exits([Tag(0x2000), Tag(0x3000)]);
        assert_eq!(frag.exit_ordinal(Tag(0x3000)), Some(1));
        assert_eq!(frag.exit_ordinal(Tag(0x4000)), None);
    }

    #[test]
    fn test_mark_link_complete() {
        let mut table = FragmentTable::new();
        assert!(!table.mark_link_complete(Tag(0x1000)));
        table.construct(&bb(0x1000, SharingClass::Shared), false);
        assert!(table.mark_link_complete(Tag(0x1000)));
        assert!(table.get(Tag(0x1000)).unwrap().link_complete);
    }
}
