//! Armitage: resilient orchestrator for LLM-driven TDD task pipelines.
//!
//! A batch of interdependent development tasks is driven through a
//! six-stage test-driven pipeline (RED → RED_FIX → GREEN → VERIFY →
//! FIX → RE_VERIFY) by a pool of concurrent workers. The core is the
//! orchestration, not the stages:
//!
//! - the **claim engine** hands out leased, optimistically-locked claims
//!   and reclaims tasks from dead workers;
//! - a **three-level circuit breaker hierarchy** (stage, worker, system)
//!   halts work automatically when failure patterns say a subsystem is
//!   unhealthy;
//! - the **worker pool** supervises N workers, enforces the per-run
//!   invocation budget, and shuts down gracefully;
//! - a **single-writer SQLite store** makes all of it crash-safe, with
//!   append-only attempt, invocation, and circuit-event audit trails.
//!
//! External collaborators (prompt builder, LLM client, code verifier,
//! static reviewer) sit behind traits in [`stage::collaborators`] with
//! no-op implementations for dry runs.

pub mod admin;
pub mod circuit;
pub mod claim;
pub mod config;
pub mod error;
pub mod logging;
pub mod stage;
pub mod store;
pub mod types;
pub mod worker;
