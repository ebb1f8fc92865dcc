//! Shared E2E test helpers.
//!
//! Provides scripted platform fakes (shields, CMDB, sinks) and fixture
//! builders for strategies, data points, and wired stage instances.

#![allow(dead_code)]

pub mod fakes;
pub mod fixtures;
