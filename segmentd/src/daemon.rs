//! Primary-side daemon services: named plugins that are told when segments
//! come online and receive the DAEMON traffic addressed to their key.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::segment_interface::SegmentLink;

pub trait DaemonService: Send + Sync {
    /// Routing key; unique within a controller.
    fn key(&self) -> &str;

    /// A segment finished its readiness handshake.
    fn online(&self, segment: &SegmentLink);

    /// A segment sent a DAEMON envelope addressed to this service.
    fn message(&self, segment: &SegmentLink, message: &Value);
}

/// Services in registration order.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Vec<Arc<dyn DaemonService>>,
}

impl ServiceRegistry {
    /// Register `service`, replacing any service with the same key in place.
    /// Returns `true` if an existing registration was replaced.
    pub fn register(&mut self, service: Arc<dyn DaemonService>) -> bool {
        match self
            .services
            .iter_mut()
            .find(|existing| existing.key() == service.key())
        {
            Some(slot) => {
                *slot = service;
                true
            }
            None => {
                self.services.push(service);
                false
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn DaemonService>> {
        self.services.iter().find(|service| service.key() == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DaemonService>> {
        self.services.iter()
    }

    pub fn keys(&self) -> Vec<String> {
        self.services.iter().map(|s| s.key().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl DaemonService for Named {
        fn key(&self) -> &str {
            self.0
        }
        fn online(&self, _segment: &SegmentLink) {}
        fn message(&self, _segment: &SegmentLink, _message: &Value) {}
    }

    #[test]
    fn same_key_replaces_in_place() {
        let mut registry = ServiceRegistry::default();
        assert!(!registry.register(Arc::new(Named("metrics"))));
        assert!(!registry.register(Arc::new(Named("sessions"))));
        assert!(registry.register(Arc::new(Named("metrics"))));

        assert_eq!(registry.keys(), vec!["metrics", "sessions"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("metrics").is_some());
        assert!(registry.get("missing").is_none());
    }
}
