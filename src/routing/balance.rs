//! Local-first traffic balancer
//!
//! Maintains a rolling window of recent routing decisions and reports which
//! side (local or cloud) is under-represented against the configured target
//! ratio. The router consults it only to break ties between otherwise
//! equally-ranked candidates; it is a soft balancer, never a gate.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::domain_types::LocalFirstRatio;
use crate::routing::endpoint::EndpointClass;

const DEFAULT_WINDOW: usize = 100;

/// Windowed token-bucket balancer over routing decisions
#[derive(Debug)]
pub struct LocalFirstBalancer {
    target: f64,
    capacity: usize,
    window: Mutex<VecDeque<EndpointClass>>,
}

impl LocalFirstBalancer {
    /// Creates a balancer with the default window of 100 decisions
    #[must_use]
    pub fn new(target: LocalFirstRatio) -> Self {
        Self::with_capacity(target, DEFAULT_WINDOW)
    }

    /// Creates a balancer with an explicit window capacity
    #[must_use]
    pub fn with_capacity(target: LocalFirstRatio, capacity: usize) -> Self {
        Self {
            target: target.as_f64(),
            capacity: capacity.max(1),
            window: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Records a routing decision
    pub fn record(&self, class: EndpointClass) {
        let mut window = self.window.lock().expect("balancer mutex poisoned");
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(class);
    }

    /// The side currently under-represented against the target, if any
    #[must_use]
    pub fn preferred(&self) -> Option<EndpointClass> {
        let window = self.window.lock().expect("balancer mutex poisoned");
        if window.is_empty() {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = window.len() as f64;
        let locals = window
            .iter()
            .filter(|class| **class == EndpointClass::Local)
            .count();
        #[allow(clippy::cast_precision_loss)]
        let local_fraction = locals as f64 / n;
        if local_fraction < self.target {
            Some(EndpointClass::Local)
        } else if local_fraction > self.target {
            Some(EndpointClass::Cloud)
        } else {
            None
        }
    }

    /// Observed local fraction over the current window
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn observed_local_ratio(&self) -> Option<f64> {
        let window = self.window.lock().expect("balancer mutex poisoned");
        if window.is_empty() {
            return None;
        }
        let locals = window
            .iter()
            .filter(|class| **class == EndpointClass::Local)
            .count();
        Some(locals as f64 / window.len() as f64)
    }
}
