use std::sync::Arc;

use crate::{sd::SdSupervisor, supervisor::Supervisor, telemetry::TelemetrySampler};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub sd: SdSupervisor,
    pub telemetry: Arc<TelemetrySampler>,
}

impl AppState {
    pub fn new(supervisor: Supervisor, sd: SdSupervisor) -> Self {
        Self {
            supervisor,
            sd,
            telemetry: Arc::new(TelemetrySampler::default()),
        }
    }
}
