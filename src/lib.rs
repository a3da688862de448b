//! Turns a declarative [`context::ExecContext`] into a fully sandboxed,
//! `execve`d child process.
//!
//! The crate is organised as one module per pipeline stage, in the order
//! the child pipeline (`pipeline::run_sandboxed_child`) actually calls
//! them: fd plumbing, stdio wiring, identity resolution, exec-directory
//! realisation, credential materialisation, cross-invocation runtime state,
//! namespace/mount setup, and finally the 35-step sandbox application
//! itself. `spawn` ties the fork and parent-side bookkeeping around it.

pub mod context;
pub mod credentials;
pub mod error;
pub mod exec_directory;
pub mod exec_runtime;
pub mod fd_plumbing;
pub mod glob;
pub mod identity;
pub mod log_setup;
pub mod namespace;
pub mod pipeline;
pub mod platform;
pub mod sandbox;
pub mod spawn;
pub mod stdio;
