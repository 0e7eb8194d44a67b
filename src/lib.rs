//! ropforge — automatic ROP chain compilation for x86/x86_64 binaries.
//!
//! The pipeline mines return-terminated gadgets out of a target binary,
//! classifies each one into an abstract semantic effect, and combines the
//! best candidates into a verified chain that invokes
//! `execve("/bin/sh", 0, 0)` with attacker-chosen register state.
//!
//! # Module overview
//!
//! - [`arch`] — Architecture context: register set, pointer width, max
//!   integer, capstone mode.
//! - [`error`] — Error kinds for the whole pipeline.
//! - [`gadget`] — Raw gadget records, memory footprints, the tagged
//!   semantic variants, and the quality ranking.
//! - [`discover`] — Gadget mining over executable segments and the
//!   deterministic semantic classifier.
//! - [`chain`] — GadgetBoxes, register-load kernels, and chains with
//!   symbolic evaluation, simplification, and payload serialization.
//! - [`combiner`] — Orchestration: writable-interval discovery, the
//!   fixpoint load solver, write-primitive synthesis, clobber-aware
//!   ordering, and final verification.
//! - [`cli_args`] — clap argument parsing for the driver binary.

pub mod arch;
pub mod chain;
pub mod cli_args;
pub mod combiner;
pub mod discover;
pub mod error;
pub mod gadget;
