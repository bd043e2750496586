use clap::{Parser, Subcommand};
use makerbot::api;
use makerbot::auth::Credentials;
use makerbot::config::{Settings, SharedConfig, Tunables};
use makerbot::engine::Engine;
use makerbot::exchange::ExchangeClient;
use makerbot::feed::spawn_depth_feed;
use makerbot::orderbook::BookMirror;
use makerbot::risk::RiskManager;
use makerbot::state::AppState;
use makerbot::uptime::UptimeTracker;
use makerbot::utils::shutdown_token;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "makerbot")]
#[command(
    version = "0.1",
    about = "Two-sided quoting bot for perp markets, tuned for maker uptime"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot with its dashboard API on the given port
    Server { port: u16 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env next to the binary, if present
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("makerbot=info,tower_http=warn")),
        )
        .init();

    let cli = Cli::parse();
    let Commands::Server { port } = cli.command;

    let settings = Settings::from_env();
    let tunables = Tunables::from_env()?;
    let creds = Arc::new(Credentials::from_env()?);
    if !creds.is_authenticated() {
        tracing::warn!("no STANDX_JWT_TOKEN configured, engine start will be rejected");
    }

    let config = SharedConfig::new(tunables);
    let book = Arc::new(BookMirror::new(config.symbol()));
    let uptime = Arc::new(UptimeTracker::new(
        config.snapshot().uptime_target_seconds(),
    ));
    let risk = Arc::new(RiskManager::new());
    let exchange = Arc::new(ExchangeClient::new(
        settings.api_base.clone(),
        Arc::clone(&creds),
    ));

    let token = shutdown_token();
    let (feed, feed_task) = spawn_depth_feed(
        Arc::clone(&book),
        config.clone(),
        Arc::clone(&creds),
        settings.ws_url.clone(),
        token.clone(),
    );

    let engine = Arc::new(Engine::new(
        Arc::clone(&book),
        config.clone(),
        exchange,
        Arc::clone(&uptime),
        Arc::clone(&risk),
    ));

    let state = AppState::new(
        Arc::clone(&engine),
        book,
        config.clone(),
        uptime,
        feed,
        creds,
    );

    let app = api::router(state);
    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(
        symbol = %config.symbol(),
        api = %settings.api_base,
        "dashboard listening on 0.0.0.0:{port}, engine idle until /api/start"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(token.clone().cancelled_owned())
        .await?;

    // ctrl-c: take every resting order down with us
    tracing::info!("shutting down, cancelling resting orders");
    engine.stop().await;
    token.cancel();
    let _ = feed_task.await;
    Ok(())
}
