//! Handler registry: one handler per queue name.
//!
//! Built once at startup, then shared read-only with the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::handler::Handler;

/// Registry of handlers, indexed by queue name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry with no handlers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register the handler for `queue_name`. A second registration for the
    /// same queue is a configuration error.
    pub fn register(
        &mut self,
        queue_name: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<()> {
        let queue_name = queue_name.into();
        if self.handlers.contains_key(&queue_name) {
            return Err(Error::HandlerConflict(queue_name));
        }
        self.handlers.insert(queue_name, handler);
        Ok(())
    }

    /// Look up the handler for a queue.
    pub fn resolve(&self, queue_name: &str) -> Result<Arc<dyn Handler>> {
        self.handlers
            .get(queue_name)
            .cloned()
            .ok_or_else(|| Error::HandlerNotFound(queue_name.to_string()))
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::handler::{HandlerContext, HandlerResult};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Handler for Noop {
        async fn handle(&self, _envelope: &Envelope, _ctx: &HandlerContext) -> HandlerResult {
            Ok(())
        }
    }

    #[test]
    fn register_then_resolve() {
        let mut registry = HandlerRegistry::empty();
        registry.register("ship_order", Arc::new(Noop)).unwrap();
        assert!(registry.resolve("ship_order").is_ok());
        assert_eq!(registry.queue_names(), vec!["ship_order".to_string()]);
    }

    #[test]
    fn second_registration_conflicts() {
        let mut registry = HandlerRegistry::empty();
        registry.register("ship_order", Arc::new(Noop)).unwrap();
        let err = registry.register("ship_order", Arc::new(Noop)).unwrap_err();
        assert!(matches!(err, Error::HandlerConflict(q) if q == "ship_order"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_queue_is_not_found() {
        let registry = HandlerRegistry::empty();
        assert!(matches!(
            registry.resolve("missing"),
            Err(Error::HandlerNotFound(q)) if q == "missing"
        ));
    }
}
