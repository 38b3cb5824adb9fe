//! kidslearn-sandbox daemon library
//!
//! Runs short untrusted snippets for learners:
//! - Coordinator that filters, dispatches and times out executions
//! - Fixed-size pool of isolated worker processes
//! - Restricted interpreter environment that runs inside each worker
//! - MCP server exposing the coordinator as a tool

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mcp;
pub mod policy;
pub mod pool;
pub mod sandbox;
pub mod transport;
pub mod worker;
