//! Integration event handlers and their resolution surface.
//!
//! Handlers are plain types implementing [`IntegrationEventHandler`] for one
//! payload type. The consumer never builds handlers itself: it asks a
//! [`HandlerResolver`] for a fresh [`HandlerScope`] per message and resolves
//! each subscribed handler type from that scope.

use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;

mod provider;

pub use provider::ServiceProvider;

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one kind of integration event payload.
#[async_trait]
pub trait IntegrationEventHandler<E>: Send + Sync + 'static
where
    E: Send + 'static,
{
    /// Handle a single decoded event.
    async fn handle(&self, event: E) -> Result<(), HandlerError>;
}

/// Request-scoped view over registered handlers.
///
/// Instances resolved from one scope are never shared with another scope.
pub trait HandlerScope: Send + Sync {
    /// Resolve an instance of the handler type, or `None` if not registered.
    fn resolve_any(&self, handler_type: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;
}

impl<'a> dyn HandlerScope + 'a {
    /// Typed wrapper around [`HandlerScope::resolve_any`].
    pub fn resolve<H: Send + Sync + 'static>(&self) -> Option<Arc<H>> {
        self.resolve_any(TypeId::of::<H>())
            .and_then(|instance| instance.downcast::<H>().ok())
    }
}

/// Composition root that hands out one scope per processed message.
pub trait HandlerResolver: Send + Sync {
    fn create_scope(&self) -> Box<dyn HandlerScope>;
}

/// Short, human-readable type name used in logs and errors.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    // Strip module path but keep generic arguments intact.
    let base_end = full.find('<').unwrap_or(full.len());
    match full[..base_end].rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
