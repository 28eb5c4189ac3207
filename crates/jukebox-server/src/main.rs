mod api;
mod config;
mod models;
mod openapi;
mod process_sink;
mod state;
mod ytdlp;

use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{App, HttpServer, middleware::Logger, web};
use anyhow::Result;
use clap::Parser;
use jukebox_core::{EventBus, PlaybackManager, PlaybackSettings, Resolver, SessionEvent};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::process_sink::ProcessSink;
use crate::state::AppState;
use crate::ytdlp::YtDlpBackend;

#[derive(Parser, Debug)]
#[command(name = "jukebox-server")]
struct Args {
    /// HTTP bind address, e.g. 0.0.0.0:8080
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,

    /// Optional server config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Log session failures and lifecycle changes from the event bus.
fn spawn_event_logger(mut rx: broadcast::Receiver<SessionEvent>) {
    actix_web::rt::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::TrackFailed {
                    session,
                    title,
                    error,
                }) => {
                    tracing::warn!(session = %session, title = %title, error = %error, "track failed");
                }
                Ok(SessionEvent::FailureCapReached { session, failures }) => {
                    tracing::error!(session = %session, failures, "session abandoned after repeated failures");
                }
                Ok(event) => tracing::debug!(session = %event.session(), event = ?event, "session event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[actix_web::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,actix_web=info,jukebox_server=info,jukebox_core=info")
        }))
        .init();

    let cfg = config::ServerConfig::discover(args.config.as_deref())?;
    let bind = match args.bind {
        Some(addr) => addr,
        None => config::bind_from_config(&cfg)?,
    };
    tracing::info!(
        bind = %bind,
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("GIT_SHA"),
        build_date = env!("BUILD_DATE"),
        "starting jukebox-server"
    );
    tracing::info!(
        program = %cfg.resolver.program,
        decoder = ?cfg.sink.decoder.first(),
        output = ?cfg.sink.output.first(),
        max_consecutive_failures = cfg.playback.max_consecutive_failures,
        "playback configured"
    );

    let resolver = Resolver::new(Arc::new(YtDlpBackend::new(cfg.resolver.clone())))
        .with_entry_concurrency(cfg.resolver.entry_concurrency);
    let sink = Arc::new(ProcessSink::new(cfg.sink.clone()));
    let events = EventBus::new();
    spawn_event_logger(events.subscribe());
    let playback = PlaybackManager::with_settings(
        resolver,
        sink,
        events,
        PlaybackSettings {
            max_consecutive_failures: cfg.playback.max_consecutive_failures,
        },
    );
    let state = web::Data::new(AppState::new(playback));

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Logger::default().exclude("/sessions").exclude("/health"))
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-doc/openapi.json", openapi::ApiDoc::openapi()),
            )
            .service(api::health)
            .service(api::sessions_list)
            .service(api::enqueue)
            .service(api::queue_list)
            .service(api::queue_remove)
            .service(api::shuffle)
            .service(api::set_loop_mode)
            .service(api::skip)
            .service(api::pause)
            .service(api::resume)
            .service(api::stop)
            .service(api::now_playing)
    })
    .bind(bind)?
    .run()
    .await?;

    Ok(())
}
