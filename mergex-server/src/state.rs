use std::sync::Arc;

use mergex_core::EngineContext;
use mergex_core::metrics;

/// Server application state: a shared handle to the engine.
#[derive(Clone, Debug)]
pub struct AppState {
    pub ctx: Arc<EngineContext>,
}

impl AppState {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        metrics::SERVICE_INFO
            .with_label_values(&[&ctx.settings.service_version])
            .set(1.0);
        Self { ctx }
    }
}
