use engine::EngineContext;

use crate::hub::LocalHub;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) engine: EngineContext,
    pub(crate) hub: LocalHub,
}
