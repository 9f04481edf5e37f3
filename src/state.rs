use std::sync::Arc;

use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::config::DispatchSettings;
use crate::engine::Engine;
use crate::engine::notifier::{BroadcastNotifier, DispatchEvent};
use crate::engine::scheduler::Dispatcher;

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub events_tx: broadcast::Sender<DispatchEvent>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, events_tx: broadcast::Sender<DispatchEvent>) -> Self {
        Self {
            dispatcher,
            events_tx,
        }
    }

    /// In-memory engine publishing to the websocket feed, with its shard
    /// workers spawned on the current runtime.
    pub fn start(
        settings: DispatchSettings,
        clock: Arc<dyn Clock>,
        shard_count: usize,
        command_queue_size: usize,
        event_buffer_size: usize,
    ) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(event_buffer_size.max(1));
        let notifier = Arc::new(BroadcastNotifier::new(events_tx.clone()));
        let engine = Engine::in_memory(settings, clock, notifier);
        let dispatcher = Dispatcher::start(engine, shard_count, command_queue_size);
        Self::new(dispatcher, events_tx)
    }

    pub fn engine(&self) -> &Engine {
        self.dispatcher.engine()
    }
}
