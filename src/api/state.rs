use std::sync::Arc;

use crate::alert::AlertManager;
use crate::detect::Detector;
use crate::orchestrator::Orchestrator;
use crate::storage::ReportStore;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Absent when only the receiver runs in this process.
    pub detector: Option<Arc<Detector>>,
    pub reports: ReportStore,
    pub alerts: AlertManager,
}
