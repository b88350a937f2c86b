//! Policy-gated container sandbox for agent-generated code.
//!
//! `sandcastle` runs untrusted, model-generated commands inside pooled
//! Docker containers. Every request is checked against a permission policy
//! before any container is touched, executed under a hard resource envelope
//! (memory, CPU, wall clock, no network by default), and recorded in an
//! append-only audit trail.
//!
//! # Architecture
//!
//! Containers are long-lived and reused: commands are exec'd into a warm
//! container rather than paying container creation per call. The pool lends
//! each container to one caller at a time and wipes its workspace between
//! tenants, so executions share nothing. The container engine socket is
//! held by this process alone; nothing inside a sandbox can reach it.
//!
//! # Modules
//!
//! - [`manager`]: The public execution API ([`manager::SandboxManager`])
//! - [`policy`]: Permission rules, blocklists, and the YAML policy loader
//! - [`pool`]: Pre-warmed container pool with overflow and eviction
//! - [`sandbox`]: A single reusable execution container
//! - [`engine`]: Container engine connection and client trait
//! - [`audit`]: Append-only audit trail of execution attempts
//! - [`config`]: Resource envelope types and unit parsing
//! - [`error`]: Semantic error types

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod policy;
pub mod pool;
pub mod sandbox;
