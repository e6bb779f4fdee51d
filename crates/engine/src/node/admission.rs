//! Per-node admission control
//!
//! A node accepts new contexts until its in-flight count reaches the high
//! watermark, then refuses until the count falls back to the low watermark.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Admission watermarks, as ratios of the node's in-flight limit
///
/// # Example
///
/// ```
/// use flowmesh_engine::node::AdmissionConfig;
///
/// let config = AdmissionConfig::default()
///     .with_high_watermark(1.0)
///     .with_low_watermark(0.5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionConfig {
    /// Stop admitting once in-flight / limit reaches this ratio
    pub high_watermark: f64,

    /// Admit again once in-flight / limit drops to this ratio
    pub low_watermark: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            high_watermark: 1.0,
            low_watermark: 0.8,
        }
    }
}

impl AdmissionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn validate(&self) -> Result<(), AdmissionError> {
        if self.low_watermark > self.high_watermark {
            return Err(AdmissionError::InvalidConfig(
                "low_watermark must not exceed high_watermark".into(),
            ));
        }
        Ok(())
    }
}

/// Admission-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid admission configuration: {0}")]
    InvalidConfig(String),
}

/// In-flight gate of one node in this process
pub struct AdmissionGate {
    config: AdmissionConfig,
    in_flight: AtomicUsize,
    max_in_flight: usize,

    /// In-flight count at which the high watermark is reached
    admit_limit: usize,
    admitting: AtomicBool,
}

impl AdmissionGate {
    pub fn new(config: AdmissionConfig, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        let admit_limit =
            ((config.high_watermark * max_in_flight as f64).ceil() as usize).clamp(1, max_in_flight);
        Self {
            config,
            in_flight: AtomicUsize::new(0),
            max_in_flight,
            admit_limit,
            admitting: AtomicBool::new(true),
        }
    }

    /// Check whether new contexts may enter
    pub fn should_admit(&self) -> bool {
        let ratio = self.load_ratio();

        if self.admitting.load(Ordering::Relaxed) {
            if ratio >= self.config.high_watermark {
                self.admitting.store(false, Ordering::Relaxed);
                return false;
            }
            true
        } else {
            if ratio <= self.config.low_watermark {
                self.admitting.store(true, Ordering::Relaxed);
                return true;
            }
            false
        }
    }

    pub fn is_saturated(&self) -> bool {
        !self.should_admit()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn load_ratio(&self) -> f64 {
        self.in_flight() as f64 / self.max_in_flight as f64
    }

    /// Count one context in; it is counted out when the guard drops
    pub fn enter(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight {
            gate: Arc::clone(self),
        }
    }

    /// Admit up to `wanted` contexts at once
    ///
    /// Returns one guard per admitted context: fewer than `wanted` when the
    /// node has fewer free slots, none while the gate is closed.
    pub fn try_enter(self: &Arc<Self>, wanted: usize) -> Vec<InFlight> {
        if wanted == 0 || !self.should_admit() {
            return vec![];
        }

        let mut granted = 0;
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                granted = self.admit_limit.saturating_sub(current).min(wanted);
                (granted > 0).then_some(current + granted)
            });
        (0..granted)
            .map(|_| InFlight {
                gate: Arc::clone(self),
            })
            .collect()
    }
}

/// One admitted context
pub struct InFlight {
    gate: Arc<AdmissionGate>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(max: usize) -> Arc<AdmissionGate> {
        Arc::new(AdmissionGate::new(
            AdmissionConfig::new()
                .with_high_watermark(0.8)
                .with_low_watermark(0.5),
            max,
        ))
    }

    #[test]
    fn test_default_config() {
        let config = AdmissionConfig::default();
        assert_eq!(config.high_watermark, 1.0);
        assert_eq!(config.low_watermark, 0.8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let invalid = AdmissionConfig::new()
            .with_high_watermark(0.5)
            .with_low_watermark(0.8);
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_saturates_at_high_watermark() {
        let gate = gate(10);
        let guards: Vec<InFlight> = (0..8).map(|_| gate.enter()).collect();

        assert!(gate.is_saturated());
        assert_eq!(guards.len(), 8);
    }

    #[test]
    fn test_hysteresis_until_low_watermark() {
        let gate = gate(10);
        let mut guards: Vec<InFlight> = (0..8).map(|_| gate.enter()).collect();
        assert!(!gate.should_admit());

        guards.pop();
        assert!(!gate.should_admit(), "70% is between the watermarks");

        guards.truncate(5);
        assert!(gate.should_admit());
    }

    #[test]
    fn test_guard_drop_releases_slot() {
        let gate = gate(4);
        {
            let _a = gate.enter();
            let _b = gate.enter();
            assert_eq!(gate.in_flight(), 2);
        }
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_try_enter_grants_free_slots_only() {
        let gate = gate(10);
        let first = gate.try_enter(5);
        assert_eq!(first.len(), 5);

        // the high watermark caps the gate at 8
        let second = gate.try_enter(5);
        assert_eq!(second.len(), 3);
        assert_eq!(gate.in_flight(), 8);

        assert!(gate.try_enter(1).is_empty());
        drop(first);
        drop(second);
        assert_eq!(gate.try_enter(20).len(), 8);
    }

    #[test]
    fn test_try_enter_nothing_wanted() {
        let gate = gate(2);
        assert!(gate.try_enter(0).is_empty());
        assert_eq!(gate.in_flight(), 0);
    }
}
