//! E2E integration tests for watchpost-daemon.
//!
//! These tests drive the detect -> alert -> action chain end to end with
//! real channels between the stages, replacing only the outermost edges
//! (platform HTTP adapters, queue sinks) with scripted fakes.
//!
//! # Test Structure
//!
//! - `helpers/` -- Shared fixtures (strategies, points, platform fakes)
//! - `scenarios/` -- Test files organized by flow
//!
//! # Running
//!
//! ```bash
//! cargo test -p watchpost-daemon --test e2e
//! ```

mod helpers;
mod scenarios;
