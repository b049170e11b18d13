//! Routing subsystem
//!
//! Everything between "a request exists" and "an ordered list of endpoints
//! to try": the endpoint registry and health model, the circuit breaker,
//! the local-first balancer, the empirical learner, and the router that
//! composes them.

pub mod balance;
pub mod breaker;
pub mod empirical;
pub mod endpoint;
pub mod health;
pub mod registry;
pub mod router;

pub use balance::LocalFirstBalancer;
pub use breaker::{BreakerPermit, BreakerSettings, BreakerState, CircuitBreaker};
pub use empirical::{EmpiricalEntry, EmpiricalLearner, EmpiricalPattern, FingerprintRecord};
pub use endpoint::{
    AuthPolicy, Capability, Endpoint, EndpointClass, EndpointDescriptor, EndpointRuntime,
    HealthState, ProbeOutcome,
};
pub use health::{HealthMonitorSettings, HealthProbe, HttpHealthProbe, spawn_health_monitor};
pub use registry::{EndpointFilter, EndpointRegistry};
pub use router::{RouteMethod, RoutePlan, RouterSettings, SmartRouter};
