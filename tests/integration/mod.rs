//! Integration test suite for maestro.
//!
//! These tests drive whole workflow definitions through the execution
//! controller and verify that the graph, scheduler and context store work
//! together correctly.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full workflow execution and run status
//! - `retry_and_cancel`: Retry backoff, timeouts and cooperative cancellation
//! - `context_propagation`: Input slices, merge policies and protocol checks
//!
//! # CI Compatibility
//!
//! Agents are replaced by a scripted in-process invoker, so no external
//! processes are spawned.


mod context_propagation;
mod workflow_e2e;
