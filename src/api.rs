//! Read-only REST inspection API.
//!
//! Lets tooling look at a game it already knows the id of, and at overall
//! server load. Nothing here mutates a session, and no endpoint lists game
//! ids: an id is the only capability needed to watch a game, so it stays
//! unguessable. Secrets are never exposed.
//!
//! Documented with OpenAPI via `utoipa`; Swagger UI is at `/swagger-ui/`.

use actix_web::{HttpResponse, Responder, web};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use utoipa::{OpenApi, ToSchema};

use crate::clock::ClockSnapshot;
use crate::game::{GameSession, SessionState};
use crate::protocol::{GameId, Movement};
use crate::registry::{SessionRegistry, lock_session};
use crate::types::{Color, GameEndReason};

/// Shared state for the HTTP handlers.
pub struct AppState {
    pub registry: Arc<dyn SessionRegistry>,
}

// ---------------------------------------------------------------------------
// OpenAPI definition
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    info(
        title = "duplex-chess inspection API",
        version = "0.1.0",
        description = "Read-only views of live two-player chess games. \
            Play happens over the WebSocket channel at /ws.",
        license(name = "MIT")
    ),
    paths(get_game, get_stats),
    components(schemas(
        GameInfoResponse,
        StatsResponse,
        ErrorResponse,
        Movement,
        ClockSnapshot,
        Color,
        GameEndReason,
    )),
    tags(
        (name = "games", description = "Game inspection"),
        (name = "server", description = "Server statistics"),
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

/// Public state of one game.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameInfoResponse {
    pub gameid: GameId,
    /// Both seats have been filled at least once.
    pub started: bool,
    pub fen: String,
    pub curr_player: Color,
    pub movements: Vec<Movement>,
    pub notation: Vec<String>,
    pub clocks: ClockSnapshot,
    pub result: Option<String>,
    pub reason: Option<GameEndReason>,
    /// Captured pieces as FEN letters, in capture order.
    pub captured: Vec<String>,
    pub spectators: usize,
    pub players_connected: usize,
}

impl GameInfoResponse {
    pub fn from_session(session: &GameSession, now: Instant) -> Self {
        let view = session.view(None, now);
        Self {
            gameid: session.id().clone(),
            started: session.state() != SessionState::AwaitingPlayers,
            fen: view.fen,
            curr_player: view.curr_player,
            movements: view.movements,
            notation: view.notation,
            clocks: view.clocks,
            result: view.result.map(str::to_string),
            reason: view.reason,
            captured: session
                .captured_pieces()
                .into_iter()
                .map(|p| p.to_fen_char().to_string())
                .collect(),
            spectators: session.spectator_count(),
            players_connected: session.players_connected(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub active_games: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Get the public state of a game.
#[utoipa::path(
    get,
    path = "/api/games/{gameid}",
    tag = "games",
    params(
        ("gameid" = String, Path, description = "Game identifier")
    ),
    responses(
        (status = 200, description = "Game state", body = GameInfoResponse),
        (status = 404, description = "Game not found", body = ErrorResponse),
    )
)]
pub async fn get_game(path: web::Path<String>, data: web::Data<AppState>) -> impl Responder {
    let gameid = path.into_inner();
    let Some(handle) = data.registry.get(&gameid) else {
        return HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Game {} not found", gameid),
        });
    };

    let session = lock_session(&handle);
    if session.is_retired() {
        return HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Game {} not found", gameid),
        });
    }
    HttpResponse::Ok().json(GameInfoResponse::from_session(&session, Instant::now()))
}

/// Number of games currently held by the server.
#[utoipa::path(
    get,
    path = "/api/stats",
    tag = "server",
    responses(
        (status = 200, description = "Server statistics", body = StatsResponse),
    )
)]
pub async fn get_stats(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(StatsResponse {
        active_games: data.registry.len(),
    })
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/games/{gameid}", web::get().to(get_game))
            .route("/stats", web::get().to(get_stats)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimeControl;
    use crate::config::SessionConfig;
    use crate::registry::InMemoryRegistry;
    use actix_web::App;
    use actix_web::test as actix_test;
    use serde_json::Value;
    use uuid::Uuid;

    fn registry_with_game() -> (Arc<InMemoryRegistry>, GameId) {
        let registry = Arc::new(InMemoryRegistry::new());
        let (session, _) = GameSession::create(
            registry.new_game_id(),
            Uuid::new_v4(),
            Some("Ann".into()),
            TimeControl::from_secs(60, 1),
            SessionConfig::default(),
        );
        let id = session.id().clone();
        registry.insert(session);
        (registry, id)
    }

    #[test]
    fn test_game_info_from_fresh_session() {
        let (registry, id) = registry_with_game();
        let handle = registry.get(&id).unwrap();
        let info = GameInfoResponse::from_session(&lock_session(&handle), Instant::now());

        assert_eq!(info.gameid, id);
        assert!(!info.started);
        assert_eq!(info.fen, crate::position::START_FEN);
        assert_eq!(info.curr_player, Color::White);
        assert!(info.movements.is_empty());
        assert!(info.captured.is_empty());
        assert_eq!(info.clocks.limit, Some(60));
        assert_eq!(info.result, None);
        assert_eq!(info.players_connected, 1);
        assert_eq!(info.spectators, 0);
    }

    #[actix_web::test]
    async fn test_get_game_endpoint() {
        let (registry, id) = registry_with_game();
        let data = web::Data::new(AppState { registry });
        let app = actix_test::init_service(App::new().app_data(data).configure(configure_routes)).await;

        let req = actix_test::TestRequest::get()
            .uri(&format!("/api/games/{}", id))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["gameid"], Value::String(id));
        assert_eq!(body["currPlayer"], "white");
        assert_eq!(body["playersConnected"], 1);
        assert!(body.get("secret").is_none());

        let req = actix_test::TestRequest::get().uri("/api/games/unknown").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_stats_endpoint() {
        let (registry, _) = registry_with_game();
        let data = web::Data::new(AppState { registry });
        let app = actix_test::init_service(App::new().app_data(data).configure(configure_routes)).await;

        let req = actix_test::TestRequest::get().uri("/api/stats").to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, serde_json::json!({"activeGames": 1}));
    }
}
