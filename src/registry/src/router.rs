//! Task name -> (queue, exchange, routing key) resolution.

use crate::task::QueueDescriptor;
use parking_lot::RwLock;
use regex::Regex;
use std::sync::Arc;

/// A single routing rule: a task-name pattern matched against a regular
/// expression, paired with the route it resolves to. Rules are tried in
/// order; first match wins.
pub struct RoutingRule {
    pattern: Regex,
    route: QueueDescriptor,
}

impl RoutingRule {
    pub fn new(pattern: &str, route: QueueDescriptor) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            route,
        })
    }

    fn matches(&self, task_name: &str) -> bool {
        self.pattern.is_match(task_name)
    }
}

/// Resolves task names to queue descriptors via an ordered rule list and a
/// default route, optionally registering missing queues on demand.
pub struct Router {
    rules: Vec<RoutingRule>,
    default_route: QueueDescriptor,
    active_queues: Arc<RwLock<Vec<QueueDescriptor>>>,
    create_missing_queues: bool,
}

impl Router {
    pub fn new(
        rules: Vec<RoutingRule>,
        default_route: QueueDescriptor,
        active_queues: Vec<QueueDescriptor>,
        create_missing_queues: bool,
    ) -> Self {
        Self {
            rules,
            default_route,
            active_queues: Arc::new(RwLock::new(active_queues)),
            create_missing_queues,
        }
    }

    /// Resolve a task name to its route. When the resolved queue is not
    /// already active and `create_missing_queues` is set, registers it
    /// with a default direct-exchange binding and returns the new
    /// descriptor; the active set then contains it for future calls.
    pub fn resolve(&self, task_name: &str) -> QueueDescriptor {
        let resolved = self
            .rules
            .iter()
            .find(|rule| rule.matches(task_name))
            .map(|rule| rule.route.clone())
            .unwrap_or_else(|| self.default_route.clone());

        self.ensure_active(resolved)
    }

    fn ensure_active(&self, route: QueueDescriptor) -> QueueDescriptor {
        {
            let active = self.active_queues.read();
            if active.iter().any(|q| q.name == route.name) {
                return route;
            }
        }

        if self.create_missing_queues {
            let mut active = self.active_queues.write();
            if !active.iter().any(|q| q.name == route.name) {
                active.push(route.clone());
            }
            route
        } else {
            // create_missing_queues disabled: fall back to the default
            // queue table rather than silently routing to an inactive
            // queue.
            self.default_route.clone()
        }
    }

    pub fn active_queues(&self) -> Vec<QueueDescriptor> {
        self.active_queues.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ExchangeType;

    fn default() -> QueueDescriptor {
        QueueDescriptor {
            name: "default".into(),
            exchange: "default".into(),
            exchange_type: ExchangeType::Direct,
            binding_key: "default".into(),
            routing_key: "default".into(),
        }
    }

    #[test]
    fn first_match_wins() {
        let high = QueueDescriptor {
            name: "high".into(),
            exchange: "high".into(),
            exchange_type: ExchangeType::Direct,
            binding_key: "high".into(),
            routing_key: "high".into(),
        };
        let rules = vec![RoutingRule::new("^urgent\\.", high.clone()).unwrap()];
        let router = Router::new(rules, default(), vec![default()], true);

        assert_eq!(router.resolve("urgent.notify").name, "high");
        assert_eq!(router.resolve("routine.cleanup").name, "default");
    }

    #[test]
    fn unmatched_queue_is_registered_when_create_missing_queues() {
        let fresh = QueueDescriptor {
            name: "fresh".into(),
            exchange: "fresh".into(),
            exchange_type: ExchangeType::Direct,
            binding_key: "fresh".into(),
            routing_key: "fresh".into(),
        };
        let rules = vec![RoutingRule::new("^fresh$", fresh).unwrap()];
        let router = Router::new(rules, default(), vec![default()], true);

        let before = router.active_queues().len();
        router.resolve("fresh");
        assert_eq!(router.active_queues().len(), before + 1);
    }

    #[test]
    fn missing_queue_falls_back_to_default_when_disabled() {
        let fresh = QueueDescriptor {
            name: "fresh".into(),
            exchange: "fresh".into(),
            exchange_type: ExchangeType::Direct,
            binding_key: "fresh".into(),
            routing_key: "fresh".into(),
        };
        let rules = vec![RoutingRule::new("^fresh$", fresh).unwrap()];
        let router = Router::new(rules, default(), vec![default()], false);

        assert_eq!(router.resolve("fresh").name, "default");
    }
}
