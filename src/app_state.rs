use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::store::SharedStore;

/// Everything the connection and management handlers share.
pub struct AppState {
    pub store: SharedStore,
    pub hub: Hub,
    pub config: ServerConfig,
}
