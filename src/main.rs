//! # duplex-chess: two-player chess over a duplex channel
//!
//! A server that hosts two-player chess games. Clients talk to it over one
//! WebSocket each; the server enforces the full rules, keeps optional game
//! clocks, relays undo and draw negotiation, lets players reconnect with a
//! secret and lets anyone holding a game id watch as a spectator.
//!
//! ## Usage
//!
//! ```bash
//! # Start the server (default: http://0.0.0.0:3000)
//! duplex-chess serve
//!
//! # Custom port, games dropped one minute after both players leave
//! duplex-chess serve --port 8080 --idle-expiry-secs 60
//!
//! # Notate a line of coordinate moves offline
//! duplex-chess replay e2e4 e7e5 g1f3
//! ```
//!
//! ## Endpoints
//!
//! | Method | Path                  | Description                  |
//! |--------|-----------------------|------------------------------|
//! | GET    | `/ws`                 | Game channel (WebSocket)     |
//! | GET    | `/api/games/{gameid}` | Inspect a game               |
//! | GET    | `/api/stats`          | Number of live games         |
//! | GET    | `/swagger-ui/`        | Swagger UI documentation     |

pub mod api;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod game;
pub mod movegen;
pub mod notation;
pub mod position;
pub mod protocol;
pub mod registry;
pub mod types;
pub mod ws;

use actix::Actor;
use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::{Duration, Instant};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{ApiDoc, AppState};
use crate::config::*;
use crate::dispatcher::Dispatcher;
use crate::registry::{InMemoryRegistry, SessionRegistry};
use crate::ws::{ConnectionHub, HubDelivery};

/// Two-player chess server with clocks, reconnection and spectators.
#[derive(Parser, Debug)]
#[command(name = "duplex-chess")]
#[command(about = "Two-player chess over WebSocket")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the game server.
    Serve {
        /// Host address to bind to.
        #[arg(long, env = "DUPLEX_CHESS_HOST", default_value = DEFAULT_HOST)]
        host: String,

        /// Port to listen on.
        #[arg(short, long, env = "DUPLEX_CHESS_PORT", default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Seconds a game is kept after both players have left.
        #[arg(long, env = "DUPLEX_CHESS_IDLE_EXPIRY_SECS", default_value_t = DEFAULT_IDLE_EXPIRY_SECS)]
        idle_expiry_secs: u64,

        /// Seconds between sweeps for idle games.
        #[arg(long, env = "DUPLEX_CHESS_SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
        sweep_interval_secs: u64,
    },

    /// Play coordinate moves from the initial position and print their
    /// algebraic notation and the final FEN.
    Replay {
        /// Moves such as `e2e4` or `e7e8=Q`.
        moves: Vec<String>,
    },
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            idle_expiry_secs,
            sweep_interval_secs,
        } => {
            let config = ServerConfig {
                host,
                port,
                session: SessionConfig {
                    idle_expiry: Duration::from_secs(idle_expiry_secs),
                },
                sweep_interval: Duration::from_secs(sweep_interval_secs.max(1)),
            };
            run_server(config).await
        }
        Commands::Replay { moves } => {
            let (notation, position) = notation::replay(moves.as_slice()).map_err(std::io::Error::other)?;
            for (ply, san) in notation.iter().enumerate() {
                if ply % 2 == 0 {
                    print!("{}. {}", ply / 2 + 1, san);
                } else {
                    println!(" {}", san);
                }
            }
            if notation.len() % 2 == 1 {
                println!();
            }
            println!("{}", position.to_fen());
            Ok(())
        }
    }
}

/// Starts the HTTP + WebSocket server and the idle-game sweeper.
async fn run_server(config: ServerConfig) -> std::io::Result<()> {
    let openapi = ApiDoc::openapi();

    let registry: Arc<dyn SessionRegistry> = Arc::new(InMemoryRegistry::new());
    let hub = ConnectionHub::new().start();
    let dispatcher = Dispatcher::new(
        registry.clone(),
        Arc::new(HubDelivery::new(hub.clone())),
        config.session,
    );

    let sweeper = dispatcher.clone();
    let sweep_interval = config.sweep_interval;
    actix_web::rt::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            sweeper.expire_idle(Instant::now());
        }
    });

    let app_state = web::Data::new(AppState { registry });
    let dispatcher_data = web::Data::new(dispatcher);
    let hub_data = web::Data::new(hub);

    let (host, port) = config.bind_addr();
    log::info!("Starting duplex-chess server on {}:{}", host, port);
    log::info!("Games expire {:?} after both players leave", config.session.idle_expiry);
    log::info!("WebSocket endpoint: ws://{}:{}/ws", host, port);
    log::info!("Swagger UI available at http://{}:{}/swagger-ui/", host, port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(app_state.clone())
            .app_data(dispatcher_data.clone())
            .app_data(hub_data.clone())
            .configure(api::configure_routes)
            .route("/ws", web::get().to(ws::ws_connect))
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone()),
            )
    })
    .bind((host, port))?
    .run()
    .await
}
