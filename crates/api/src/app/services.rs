use jobforge_infra::bootstrap::Infrastructure;
use jobforge_infra::coordinator::JobCoordinator;

/// State shared by every handler.
///
/// Handlers only ever talk to the coordinator; they never execute jobs.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub coordinator: JobCoordinator,
}

impl AppServices {
    pub fn new(coordinator: JobCoordinator) -> Self {
        Self { coordinator }
    }
}

impl From<&Infrastructure> for AppServices {
    fn from(infra: &Infrastructure) -> Self {
        Self::new(infra.coordinator.clone())
    }
}
