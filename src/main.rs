//! # Voice Session Backend - Main Application Entry Point
//!
//! Backend of a simulated phone app. It holds live voice calls with remote
//! conversational agents and plays synthesized voicemail messages.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: capture, transport and playback all run as tokio tasks
//! - **traits**: microphone, speaker, transport and synthesizer are swappable
//! - **Result<T, E>**: pipeline errors are values, never panics
//! - **Arc**: the call registry and voicemail player are shared by handlers
//!
//! ## Application Architecture:
//! - **audio**: codec, capture, output, downlink scheduler, call sessions
//! - **transport**: the live bidirectional channel to the remote agent
//! - **synthesis**: one-shot text-to-speech for voicemail
//! - **playback**: the voicemail player
//! - **persona**: caller personas and voicemail items
//! - **config / state / health / middleware / handlers / websocket**: the
//!   HTTP and WebSocket control surface

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod persona;
mod playback;
mod state;
mod synthesis;
mod transport;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::state::AppState;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Start the server and run until a shutdown signal.
///
/// ## What this function does:
/// 1. Loads `.env`, sets up logging, loads and validates configuration
/// 2. Wires the voice pipeline into the shared `AppState`
/// 3. Serves the control API until SIGINT/SIGTERM
/// 4. Hangs up every call and releases the voicemail player on the way out
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-session-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.transport.api_key().is_none() {
        error!("No transport API key configured, calls will fail to connect");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::from_config(config)?;
    let shutdown_state = app_state.clone();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // middleware runs in reverse order of registration for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/personas", web::get().to(handlers::list_personas))
                    .route("/calls", web::post().to(handlers::start_call))
                    .route("/calls", web::get().to(handlers::list_calls))
                    .route("/calls/{id}", web::get().to(handlers::get_call))
                    .route("/calls/{id}", web::delete().to(handlers::hang_up))
                    .route("/calls/{id}/directive", web::post().to(handlers::send_directive))
                    .route("/voicemail", web::get().to(handlers::list_voicemail))
                    .route("/voicemail/stop", web::post().to(handlers::stop_voicemail))
                    .route("/voicemail/playback", web::get().to(handlers::playback_state))
                    .route("/voicemail/{id}/play", web::post().to(handlers::play_voicemail))
                    .route("/voicemail/{id}/toggle", web::post().to(handlers::toggle_voicemail)),
            )
            .route("/ws/calls/{id}", web::get().to(websocket::call_events))
            .route("/health", web::get().to(health::health_check))
    })
    // signals are handled below so calls can be hung up before exit
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    shutdown_state.shutdown().await;
    info!("Server stopped gracefully");
    Ok(())
}

/// Set up structured logging.
///
/// `RUST_LOG` controls what gets logged; without it the default is
/// `voice_session_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_session_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
