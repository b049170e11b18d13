//! Endpoint registry
//!
//! Descriptors are loaded once at startup and never change; the registry
//! hands out shared handles whose runtime state each endpoint guards itself.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain_types::EndpointName;
use crate::error::RouteError;
use crate::routing::endpoint::{Capability, Endpoint, EndpointClass};

/// Optional constraints for [`EndpointRegistry::list`]
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointFilter {
    /// Restrict to one class
    pub class: Option<EndpointClass>,
    /// Require an advertised capability
    pub capability: Option<Capability>,
    /// Drop endpoints whose breaker is open
    pub selectable_only: bool,
}

/// Immutable set of configured endpoints
#[derive(Debug)]
pub struct EndpointRegistry {
    endpoints: Vec<Arc<Endpoint>>,
    by_name: HashMap<EndpointName, Arc<Endpoint>>,
}

impl EndpointRegistry {
    /// Builds a registry, rejecting duplicate names
    ///
    /// # Errors
    /// Returns `RouteError::Config` when two endpoints share a name or the
    /// list is empty.
    pub fn new(endpoints: Vec<Arc<Endpoint>>) -> Result<Self, RouteError> {
        if endpoints.is_empty() {
            return Err(RouteError::Config {
                reason: "at least one endpoint must be configured".to_string(),
            });
        }
        let mut by_name = HashMap::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            let name = endpoint.descriptor.name.clone();
            if by_name.insert(name.clone(), Arc::clone(endpoint)).is_some() {
                return Err(RouteError::Config {
                    reason: format!("duplicate endpoint name '{name}'"),
                });
            }
        }
        Ok(Self { endpoints, by_name })
    }

    /// Looks up an endpoint by name
    #[must_use]
    pub fn get(&self, name: &EndpointName) -> Option<Arc<Endpoint>> {
        self.by_name.get(name).cloned()
    }

    /// All endpoints in configuration order
    #[must_use]
    pub fn all(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Number of configured endpoints
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether the registry is empty (never true after construction)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Endpoints matching the filter, ordered by priority then latency
    ///
    /// Latency ordering uses the last observed value; endpoints that were
    /// never measured sort after measured ones.
    #[must_use]
    pub fn list(&self, filter: Option<&EndpointFilter>) -> Vec<Arc<Endpoint>> {
        let mut matched: Vec<Arc<Endpoint>> = self
            .endpoints
            .iter()
            .filter(|endpoint| {
                let Some(filter) = filter else { return true };
                if let Some(class) = filter.class
                    && endpoint.descriptor.class != class
                {
                    return false;
                }
                if let Some(capability) = filter.capability
                    && !endpoint.descriptor.has_capability(capability)
                {
                    return false;
                }
                if filter.selectable_only && !endpoint.breaker.is_selectable() {
                    return false;
                }
                true
            })
            .cloned()
            .collect();

        matched.sort_by_key(|endpoint| {
            (
                endpoint.descriptor.priority,
                endpoint.last_latency_ms().unwrap_or(u64::MAX),
            )
        });
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{ContextTokens, ModelId, PriorityRank, ResponseTokens};
    use crate::routing::breaker::BreakerSettings;
    use crate::routing::endpoint::{AuthPolicy, EndpointDescriptor, ProbeOutcome};
    use std::collections::BTreeSet;

    fn endpoint(name: &str, class: EndpointClass, priority: u8) -> Arc<Endpoint> {
        Arc::new(Endpoint::new(
            EndpointDescriptor {
                name: EndpointName::try_new(name.to_string()).unwrap(),
                base_url: format!("http://{name}.test"),
                model: ModelId::try_new("m".to_string()).unwrap(),
                class,
                max_context_tokens: ContextTokens::default(),
                max_response_tokens: ResponseTokens::default(),
                priority: PriorityRank::try_new(priority).unwrap(),
                auth: AuthPolicy::None,
                capabilities: BTreeSet::from([Capability::Code]),
                health_url: None,
            },
            BreakerSettings::default(),
        ))
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = EndpointRegistry::new(vec![
            endpoint("local", EndpointClass::Local, 1),
            endpoint("local", EndpointClass::Cloud, 2),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_registry_rejected() {
        assert!(EndpointRegistry::new(Vec::new()).is_err());
    }

    #[test]
    fn test_list_orders_by_priority_then_latency() {
        let slow = endpoint("slow", EndpointClass::Local, 1);
        let fast = endpoint("fast", EndpointClass::Local, 1);
        let cloud = endpoint("cloud", EndpointClass::Cloud, 2);
        slow.record_probe(ProbeOutcome::Success { latency_ms: 90 }, 3);
        fast.record_probe(ProbeOutcome::Success { latency_ms: 10 }, 3);

        let registry = EndpointRegistry::new(vec![
            Arc::clone(&slow),
            Arc::clone(&fast),
            Arc::clone(&cloud),
        ])
        .unwrap();

        let names: Vec<String> = registry
            .list(None)
            .iter()
            .map(|e| e.descriptor.name.to_string())
            .collect();
        assert_eq!(names, vec!["fast", "slow", "cloud"]);
    }

    #[test]
    fn test_filter_by_class_and_selectability() {
        let local = endpoint("local", EndpointClass::Local, 1);
        let cloud = endpoint("cloud", EndpointClass::Cloud, 2);
        cloud.breaker.trip_open();

        let registry =
            EndpointRegistry::new(vec![Arc::clone(&local), Arc::clone(&cloud)]).unwrap();

        let filter = EndpointFilter {
            selectable_only: true,
            ..Default::default()
        };
        let selectable = registry.list(Some(&filter));
        assert_eq!(selectable.len(), 1);
        assert_eq!(selectable[0].descriptor.name.as_str(), "local");

        let filter = EndpointFilter {
            class: Some(EndpointClass::Cloud),
            ..Default::default()
        };
        assert_eq!(registry.list(Some(&filter)).len(), 1);
    }
}
