//! Error taxonomy (§7).
//!
//! Grounded on `dspeyrer-net/wireguard/src/tunnel/mod.rs`'s `warn!`-then-`Err(())`
//! idiom via `utils::error`: every fallible engine operation logs the
//! specific reason at the point it's discovered and returns the unit-typed
//! `Result` — callers branch on success/failure, not on error variants,
//! matching how the original treats most protocol violations as silent
//! per-command drops rather than typed exceptions.

pub use utils::error::Result;
