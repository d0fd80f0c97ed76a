//! Integration test suite for the OpenSprint core.
//!
//! These tests exercise the full dispatch flow against real temporary git
//! repositories, using executable shell scripts in place of the agent CLI.
//!
//! # Test Categories
//!
//! - `dispatch`: claiming, ordering, nudge coalescing, failure backoff
//! - `recovery`: kill requests, shutdown, periodic orphan sweeps
//! - `wip_safety`: WIP commits and crash recovery of uncommitted work
//!
//! No real agent is ever launched, so the suite is safe to run in CI.

mod fixtures;

mod recovery;
mod wip_safety;
