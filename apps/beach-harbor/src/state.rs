use std::sync::Arc;

use harbor_signing::Verifier;

use crate::orchestrator::SessionOrchestrator;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<SessionOrchestrator>,
    verifier: Arc<Verifier>,
}

impl AppState {
    pub fn new(orchestrator: SessionOrchestrator, verifier: Verifier) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            verifier: Arc::new(verifier),
        }
    }

    pub fn orchestrator(&self) -> &SessionOrchestrator {
        &self.orchestrator
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }
}
