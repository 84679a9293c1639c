// WebSocket surface: connection gateway, session registry, room channel.

pub mod handler;
pub mod protocol;
pub mod registry;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::auth::jwt::AccessTokenService;
use crate::store::Stores;

pub use registry::SessionRegistry;

#[derive(Clone)]
pub(crate) struct SyncRouterState {
    pub(crate) jwt_service: Arc<AccessTokenService>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) stores: Stores,
}

pub fn router(
    jwt_service: Arc<AccessTokenService>,
    registry: Arc<SessionRegistry>,
    stores: Stores,
) -> Router {
    let state = SyncRouterState { jwt_service, registry, stores };

    Router::new().route("/v1/ws", get(handler::ws_upgrade)).with_state(state)
}
