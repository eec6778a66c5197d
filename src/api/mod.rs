pub mod health;
pub mod progress;
pub mod trigger;

use crate::AppState;
use axum::Router;

/// Create the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(progress::router())
        .merge(trigger::router())
}
