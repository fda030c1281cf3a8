//! Bundled handler resolver.
//!
//! Handlers are registered as factories keyed by type. Each scope builds a
//! handler at most once, on first resolution, and drops every instance it
//! built when the scope is dropped.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{short_type_name, HandlerResolver, HandlerScope};

type Factory = Arc<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>;

/// Type-keyed handler factories.
#[derive(Clone, Default)]
pub struct ServiceProvider {
    factories: HashMap<TypeId, (&'static str, Factory)>,
}

impl ServiceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for handler type `H`.
    ///
    /// Registering the same type again replaces the earlier factory.
    pub fn add_scoped<H, F>(mut self, factory: F) -> Self
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move || Arc::new(factory()) as Arc<dyn Any + Send + Sync>);
        self.factories
            .insert(TypeId::of::<H>(), (short_type_name::<H>(), factory));
        self
    }

    /// Whether a factory is registered for handler type `H`.
    pub fn contains<H: 'static>(&self) -> bool {
        self.factories.contains_key(&TypeId::of::<H>())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl HandlerResolver for ServiceProvider {
    fn create_scope(&self) -> Box<dyn HandlerScope> {
        Box::new(ProviderScope {
            factories: self.factories.clone(),
            instances: Mutex::new(HashMap::new()),
        })
    }
}

struct ProviderScope {
    factories: HashMap<TypeId, (&'static str, Factory)>,
    instances: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl HandlerScope for ProviderScope {
    fn resolve_any(&self, handler_type: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        let (name, factory) = self.factories.get(&handler_type)?;

        let mut instances = match self.instances.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let instance = instances
            .entry(handler_type)
            .or_insert_with(|| {
                debug!(handler = %name, "Creating scoped handler instance");
                factory()
            })
            .clone();
        Some(instance)
    }
}
