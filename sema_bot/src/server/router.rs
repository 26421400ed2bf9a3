use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::dependencies::BotDeps;
use crate::server::handler::{health, payment_webhook, whatsapp_webhook};

pub fn router(bot_deps: BotDeps) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/whatsapp", post(whatsapp_webhook))
        .route("/webhook/payments/{gateway}", post(payment_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(bot_deps)
}
