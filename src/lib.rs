//! flowaudit - control-flow audit layer for a dynamic binary translation engine
//!
//! The translation engine reports fragment construction, linking, removal,
//! syscall crossings and memory protection changes through the
//! [`events::AuditEvents`] contract. The [`dispatcher::AuditDispatcher`]
//! routes those events to the components below, which together maintain a
//! link graph of the monitored program's control flow and flag anomalous
//! transfers.
//!
//! Components, leaves first:
//!
//! - [`shadow_pages`]: executable regions, shadow (generated) code vs module images
//! - [`syscall_audit`]: watched-syscall filter and suspicion classifier
//! - [`shadow_stack`]: per-thread shadow call stack with callback segments
//! - [`indirect_branch`]: per-thread pending indirect branch state machine
//! - [`fragment`]: canonical fragment identities and copy deduplication
//! - [`link_graph`]: direct, indirect and return edges between fragments
//! - [`dispatcher`]: the event entry point and lifecycle owner

pub mod cli;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod fragment;
pub mod handles;
pub mod hooks;
pub mod indirect_branch;
pub mod link_graph;
pub mod modules;
pub mod records;
pub mod replay;
pub mod shadow_pages;
pub mod shadow_stack;
pub mod stats;
pub mod syscall_audit;
