mod ai;
mod bot;
mod dependencies;
mod jobs;
mod ledger;
mod orchestrator;
mod payments;
mod requests;
mod server;
mod streaks;
mod transport;

use std::env;
use std::sync::Arc;

use teloxide::{dptree, prelude::*};

use crate::ai::handler::AI;
use crate::bot::handler_tree::handler_tree;
use crate::dependencies::BotDeps;
use crate::jobs::job_scheduler::schedule_jobs;
use crate::ledger::handler::UserLedger;
use crate::orchestrator::handler::Orchestrator;
use crate::payments::gateway::{FlutterwaveGateway, PaymentGateway, PaystackGateway};
use crate::payments::handler::PaymentReconciler;
use crate::requests::handler::RequestTracker;
use crate::server::router::router;
use crate::streaks::handler::StreakTracker;
use crate::transport::{TelegramSender, Transports, WhatsAppSender};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();
    log::info!("Starting sema_bot...");

    let bot = Bot::from_env();
    let telegram_token = env::var("TELOXIDE_TOKEN").expect("TELOXIDE_TOKEN not set");
    let openai_api_key = env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY not set");
    let callback_url =
        env::var("PAYMENT_CALLBACK_URL").expect("PAYMENT_CALLBACK_URL not set");

    let db_path = env::var("SEMA_DB_PATH").unwrap_or("sema_db".to_string());
    let db = sled::open(db_path).expect("Failed to open sled DB");

    let ledger = UserLedger::new(&db).expect("Failed to open users tree");
    let tracker =
        RequestTracker::new(&db, ledger.clone()).expect("Failed to open requests tree");
    let streaks = StreakTracker::new(ledger.clone());

    let provider = Arc::new(AI::new(openai_api_key));
    let orchestrator = Orchestrator::new(
        ledger.clone(),
        tracker.clone(),
        streaks.clone(),
        provider,
    );

    let mut gateways: Vec<Arc<dyn PaymentGateway>> = Vec::new();
    if let Ok(secret) = env::var("PAYSTACK_SECRET_KEY") {
        gateways.push(Arc::new(PaystackGateway::new(secret)));
    }
    if let Ok(secret) = env::var("FLUTTERWAVE_SECRET_KEY") {
        gateways.push(Arc::new(FlutterwaveGateway::new(secret)));
    }
    if gateways.is_empty() {
        log::warn!("no payment gateway configured, /buy and /verify will fail");
    }
    let reconciler = PaymentReconciler::new(&db, ledger.clone(), gateways, callback_url)
        .expect("Failed to open payment trees");

    let whatsapp_api_url =
        env::var("WHATSAPP_API_URL").expect("WHATSAPP_API_URL not set");
    let whatsapp_api_token =
        env::var("WHATSAPP_API_TOKEN").expect("WHATSAPP_API_TOKEN not set");
    let transports = Transports::new(
        Arc::new(TelegramSender::new(bot.clone())),
        Arc::new(WhatsAppSender::new(whatsapp_api_url, whatsapp_api_token)),
    );

    let bot_deps = BotDeps {
        ledger,
        tracker,
        orchestrator,
        reconciler,
        streaks,
        transports,
        telegram_file_base: format!("https://api.telegram.org/file/bot{}", telegram_token),
    };

    schedule_jobs(bot_deps.clone())
        .await
        .expect("Failed to schedule jobs");

    let server_domain = env::var("SERVER_DOMAIN").unwrap_or("0.0.0.0:8080".to_string());
    let app = router(bot_deps.clone());
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&server_domain)
            .await
            .expect("Failed to bind webhook listener");
        log::info!("Webhook server listening on {}", server_domain);
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("webhook server exited: {}", e);
        }
    });

    Dispatcher::builder(bot, handler_tree())
        .dependencies(dptree::deps![bot_deps])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}
