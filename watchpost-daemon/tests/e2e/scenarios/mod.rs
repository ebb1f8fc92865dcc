//! E2E test scenarios.
//!
//! Each module drives one flow through the detect -> alert -> action chain.

mod alert_lifecycle;
mod convergence;
mod shield_flow;
mod sink_delivery;
