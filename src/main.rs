use axum::Router;
use candlekeeper::config::Config;
use candlekeeper::services::{HistoricalDataService, RedisTimeSeriesStore, SchedulerService};
use candlekeeper::sources::ExchangeProviders;
use candlekeeper::{api, AppState};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("candlekeeper={},tower_http=info", config.service.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;
    let config = Arc::new(config);

    info!(
        "Starting {} v{} on {}:{}",
        config.service.name,
        env!("CARGO_PKG_VERSION"),
        config.service.host,
        config.service.port
    );
    info!(
        "Exchange: {}, timeframe: {}, start date: {}",
        config.exchange.name, config.historical.timeframe, config.historical.start_date
    );
    info!(
        "Spot: {}, futures: {}",
        if config.market.spot.enabled { "enabled" } else { "disabled" },
        if config.market.futures.enabled { "enabled" } else { "disabled" }
    );

    let store = Arc::new(RedisTimeSeriesStore::connect(&config.redis_url).await?);
    let providers = ExchangeProviders::from_config(&config)?;
    let historical = Arc::new(HistoricalDataService::new(config.clone(), providers, store)?);
    let scheduler = Arc::new(SchedulerService::new(historical.clone()));

    let state = AppState::new(historical, scheduler.clone());

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(api::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.service.host, config.service.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    // The HTTP server answers health checks while the scheduler converges.
    if config.scheduler.enabled {
        scheduler.start();
    } else {
        info!("Scheduler disabled");
    }

    axum::serve(listener, app).await?;

    scheduler.stop();
    Ok(())
}
