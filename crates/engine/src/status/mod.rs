//! Trace and trans status calculation

mod calculator;

pub use calculator::{trans_lease_key, StatusCalculator, StatusReport};
