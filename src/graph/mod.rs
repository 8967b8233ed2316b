//! The render graph.
//!
//! A job is recorded into a [`BuildContext`](build_context::BuildContext) as a stream of abstract
//! [`Command`](command::Command)s that reference resources by name. Building a job runs three passes over that
//! stream:
//! - [`ApplyFlagConditionsPass`](pass::ApplyFlagConditionsPass) drops commands disabled for a flag variant.
//! - [`BarrierInsertionPass`](pass::BarrierInsertionPass) tracks every resource's state and inserts the barriers
//!   needed between uses.
//! - [`GenerateCommandListPass`](pass::GenerateCommandListPass) lowers the stream into a native command list.
//!
//! The [`JobGraph`](job_graph::JobGraph) owns all jobs together with the [`ResourceStorage`](resource_storage::ResourceStorage)
//! and [`PipelineCache`](pipeline_cache::PipelineCache) they share. Dependencies between jobs become semaphores,
//! and jobs execute in dependency order.

pub mod build_context;
pub mod command;
pub mod declaration;
pub mod job;
pub mod job_graph;
pub mod pass;
pub mod pipeline_cache;
pub mod pipeline_state;
pub mod refs;
pub mod resource_storage;
pub mod state;
pub mod surface;
