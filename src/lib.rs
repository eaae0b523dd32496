//! Run the Claude CLI through an SSH-tunneled local proxy.
//!
//! The crate manages the proxy stack (ssh dynamic forward + local HTTP
//! proxy), a cross-process registry of running stacks so concurrent
//! invocations can share a tunnel, supervision of the child CLI, and an
//! optional fixed-length binary patcher with backup and rollback.

pub mod build_info;
pub mod config;
pub mod env;
pub mod error;
pub mod health;
pub mod patch;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod run;
pub mod socks;
pub mod ssh;
pub mod stack;
pub mod store;
pub mod supervisor;
