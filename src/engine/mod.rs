pub mod notifier;
pub mod scheduler;
pub mod scoring;
pub mod selector;

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::DispatchSettings;
use crate::observability::Metrics;
use crate::runtime::{DriverRuntimeIndex, IndexSettings};
use crate::store::{DispatchStore, InMemoryDispatchStore};

use self::notifier::OfferNotifier;

/// Handles the dispatch core runs against. Cheap to clone; every shard
/// worker holds its own copy.
#[derive(Clone)]
pub struct Engine {
    pub settings: Arc<DispatchSettings>,
    pub runtime: Arc<DriverRuntimeIndex>,
    pub store: Arc<dyn DispatchStore>,
    pub notifier: Arc<dyn OfferNotifier>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Metrics,
}

impl Engine {
    /// Engine over the in-process driver index and dispatch store.
    pub fn in_memory(
        settings: DispatchSettings,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn OfferNotifier>,
    ) -> Self {
        let runtime = Arc::new(DriverRuntimeIndex::new(
            clock.clone(),
            IndexSettings::from(&settings.runtime),
        ));
        let store = Arc::new(InMemoryDispatchStore::new(settings.lock_ttl()));

        Self {
            settings: Arc::new(settings),
            runtime,
            store,
            notifier,
            clock,
            metrics: Metrics::new(),
        }
    }
}
