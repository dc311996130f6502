use std::time::{Duration, SystemTime, UNIX_EPOCH};

use delve_core::{DeepSearchService, EventBus};
use delve_providers::ProviderRegistry;

mod http;

pub use http::*;

/// How often finished streams past retention are swept from the registry.
pub const STREAM_REAP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub service: DeepSearchService,
    pub event_bus: EventBus,
    pub providers: ProviderRegistry,
    pub started_at_ms: u64,
}

impl AppState {
    pub fn new(service: DeepSearchService, event_bus: EventBus, providers: ProviderRegistry) -> Self {
        Self {
            service,
            event_bus,
            providers,
            started_at_ms: now_ms(),
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) async fn run_stream_reaper(state: AppState) {
    let registry = state.service.registry();
    loop {
        tokio::time::sleep(STREAM_REAP_INTERVAL).await;
        let reaped = registry.reap_expired().await;
        if reaped > 0 {
            tracing::debug!("reaped {} expired streams", reaped);
        }
    }
}
