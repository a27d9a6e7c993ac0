use std::sync::Arc;
use std::time::Duration;

use tollgate_core::{DataStore, Excluder, ReadinessTracker, Reader, WatchRegistrar};
use tracing::Span;

use crate::replay::BackoffPolicy;

/// Timing knobs for the reconciliation loop and replay worker.
#[derive(Debug, Clone)]
pub struct Settings {
    pub interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for Settings {
    fn default() -> Self { Self { interval: Duration::from_secs(3), backoff: BackoffPolicy::default() } }
}

/// Collaborators and settings for [`crate::CacheManager::new`]. Every collaborator is required.
#[derive(Default)]
pub struct CacheManagerConfig {
    pub store: Option<Arc<dyn DataStore>>,
    pub registrar: Option<Arc<dyn WatchRegistrar>>,
    pub reader: Option<Arc<dyn Reader>>,
    pub tracker: Option<Arc<dyn ReadinessTracker>>,
    pub excluder: Option<Excluder>,
    pub settings: Settings,
    /// Parent span for all manager logging; defaults to a `cache_manager` span.
    pub span: Option<Span>,
}

impl CacheManagerConfig {
    pub fn new() -> Self { Self::default() }

    pub fn store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registrar(mut self, registrar: Arc<dyn WatchRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn reader(mut self, reader: Arc<dyn Reader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn tracker(mut self, tracker: Arc<dyn ReadinessTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn excluder(mut self, excluder: Excluder) -> Self {
        self.excluder = Some(excluder);
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }
}
