use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use cdr_common::cel::CelService;
use cdr_common::direction::DirectionClassifier;
use cdr_common::event::ChannelExclusions;
use cdr_common::metrics::{serve, setup_metrics_routes};
use cdr_common::reconcile::CallReconciler;
use cdr_common::store::PgEventStore;
use handlers::command::{ApiCredentials, AppState};
use originate::AmiOriginator;

mod config;
mod handlers;
mod originate;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;

    let store = PgEventStore::new(&config.database_url, config.max_pg_connections)
        .await
        .wrap_err("failed to connect to the CEL database")?;
    let reconciler = CallReconciler::new(
        DirectionClassifier::new(
            &config.additional_outgoing_contexts,
            &config.additional_incoming_contexts,
        ),
        ChannelExclusions::parse(&config.excluded_channel_prefixes),
    );
    let originator = AmiOriginator::new(
        &config.ami_address(),
        &config.ami_username,
        &config.ami_secret,
        &config.originate_context,
        config.call_timeout(),
    );

    let state = AppState::new(
        ApiCredentials::new(&config.api_username, &config.api_password),
        CelService::new(Arc::new(store), reconciler),
        Arc::new(originator),
    );

    let app = handlers::add_routes(Router::new(), Arc::new(state), config.concurrency_limit);
    let app = setup_metrics_routes(app).wrap_err("failed to install metrics recorder")?;

    info!(bind = %config.bind(), "starting cdr-api");
    serve(app, &config.bind())
        .await
        .wrap_err("failed to start cdr-api http server")
}
