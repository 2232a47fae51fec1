//! Integration test suite for handoff.
//!
//! These tests drive the orchestrator side (coordinator, dispatcher, lock)
//! against reference workers over both the in-memory and the filesystem
//! medium. Lock clients and workers share nothing but the medium, the same
//! way separate processes would.
//!
//! # Test Categories
//!
//! - `handshake`: publish/await cycles, deadlines, cancellation, persistence
//! - `fallback`: primary/secondary rules and ghost-result suppression
//! - `hardware_lock`: serialization, FIFO order, crash recovery
//! - `fs_medium`: atomicity and notifications across handles
//! - `sweep`: cleanup after crashed participants
//!
//! # Timing
//!
//! Deadlines and leases are scaled down to tens or hundreds of milliseconds,
//! so assertions use generous upper bounds.

mod fixtures;

mod fallback;
mod fs_medium;
mod handshake;
mod hardware_lock;
mod sweep;
