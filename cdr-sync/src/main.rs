use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use futures::future::{select, Either};
use tokio::sync::Semaphore;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use cdr_common::cel::CelService;
use cdr_common::direction::DirectionClassifier;
use cdr_common::event::ChannelExclusions;
use cdr_common::metrics::{serve, setup_metrics_routes};
use cdr_common::reconcile::CallReconciler;
use cdr_common::store::PgEventStore;
use cdr_sync::client::PbxClient;
use cdr_sync::config::{Config, SourceModeName};
use cdr_sync::directory::{PersonDirectory, PgPersonDirectory};
use cdr_sync::driver::{SyncDriver, SyncSettings};
use cdr_sync::handlers::add_routes;
use cdr_sync::interactions::PgInteractionStore;
use cdr_sync::numbers::NumberRule;
use cdr_sync::origination::{OriginationSettings, PersonOriginator};
use cdr_sync::source::{CallSource, LocalCelSource};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn sync_loop(driver: SyncDriver, interval_secs: u64) {
    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        let _permit = semaphore.acquire().await;
        interval.tick().await;
        match driver.run().await {
            Ok(summary) => info!("{}", summary),
            Err(failure) => error!("{}", failure),
        }
        drop(_permit);
    }
}

/// The call source, and the PBX client when there is one to place calls through.
async fn build_source(config: &Config) -> Result<(Arc<dyn CallSource>, Option<Arc<PbxClient>>)> {
    let mode = SourceModeName::from_str(&config.source_mode)?;

    let built = match mode {
        SourceModeName::Remote => {
            let origination = OriginationSettings::new(
                NumberRule::from_str(&config.origination_rule)?,
                &config.caller_id_template,
                &config.origination_url,
            );
            let client = Arc::new(PbxClient::new(
                &config.server_url,
                &config.api_path,
                &config.pbx_username,
                &config.pbx_password,
                config.request_timeout(),
                origination,
            )?);
            let source: Arc<dyn CallSource> = client.clone();
            (source, Some(client))
        }
        SourceModeName::Local => {
            let store = PgEventStore::new(&config.cel_database_url, config.max_pg_connections)
                .await
                .wrap_err("failed to connect to the CEL database")?;
            let reconciler = CallReconciler::new(
                DirectionClassifier::new(
                    &config.additional_outgoing_contexts,
                    &config.additional_incoming_contexts,
                ),
                ChannelExclusions::parse(&config.excluded_channel_prefixes),
            );
            let source: Arc<dyn CallSource> = Arc::new(LocalCelSource::new(CelService::new(
                Arc::new(store),
                reconciler,
            )));
            (source, None)
        }
    };

    Ok(built)
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;

    let settings = SyncSettings {
        page_size: config.page_size,
        minimum_duration_secs: config.minimum_duration_secs,
        skip_internal_calls: config.skip_internal_calls,
        internal_phone_type: config.internal_phone_type.clone(),
        phone_number_rule: NumberRule::from_str(&config.phone_number_rule)?,
        extension_rule: NumberRule::from_str(&config.extension_rule)?,
        interaction_component: config.interaction_component.clone(),
        cursor_name: config.cursor_name.clone(),
    };

    let interactions = PgInteractionStore::new(&config.database_url, config.max_pg_connections)
        .await
        .wrap_err("failed to connect to the interactions database")?;
    let directory: Arc<dyn PersonDirectory> =
        Arc::new(PgPersonDirectory::new(interactions.pool().clone()));

    let (source, pbx) = build_source(&config).await?;
    let originator = pbx.map(|client| {
        Arc::new(PersonOriginator::new(
            client,
            directory.clone(),
            config.internal_phone_type.clone(),
        ))
    });
    let driver = SyncDriver::new(source, directory, Arc::new(interactions), settings);

    let router = add_routes(Router::new(), originator);
    let router = setup_metrics_routes(router).wrap_err("failed to install metrics recorder")?;
    let bind = config.bind();
    let http_server = Box::pin(serve(router, &bind));

    info!(mode = %config.source_mode, "starting cdr-sync");
    let sync_loop = Box::pin(sync_loop(driver, config.sync_interval_secs));

    match select(http_server, sync_loop).await {
        Either::Left((listen_result, _)) => {
            listen_result.wrap_err("failed to start cdr-sync http server")?
        }
        Either::Right((_, _)) => error!("cdr-sync loop exited"),
    };

    Ok(())
}
