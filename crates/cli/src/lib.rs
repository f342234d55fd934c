// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

//! chainreplay command-line front end
//!
//! Wraps [`chainreplay_cache`] with two subcommands:
//! - `replay` feeds recorded namespaces to the built-in runners
//! - `cleanup` applies age and size retention to a cache root

// Command summaries and error reports go to stdout/stderr
#![allow(clippy::print_stdout, clippy::print_stderr)]

/// CLI argument parsing, exit codes and error rendering.
pub mod cli;
/// Subcommand implementations.
pub mod commands;
/// Built-in replay runners.
pub mod runners;
/// Tracing subscriber setup.
pub mod tracing;
