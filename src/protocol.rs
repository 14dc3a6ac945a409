//! Wire protocol for the duplex game channel.
//!
//! Every frame is a JSON object whose `command` field names the message;
//! the remaining fields are camelCase.
//!
//! ## Client → Server
//!
//! | Command          | Fields                                      |
//! |------------------|---------------------------------------------|
//! | `createGame`     | `timePlayer?`, `timeInc?`, `playerName?`    |
//! | `joinGame`       | `gameid`, `playerName?`, `secret?`          |
//! | `spectate`       | `gameid`                                    |
//! | `commitMovement` | `i`, `j`, `newI`, `newJ`, `promoteTo?`      |
//! | `requestUndo`    | none                                        |
//! | `approveUndo`    | none                                        |
//! | `requestDraw`    | none                                        |
//! | `approveDraw`    | none                                        |
//! | `rejectDraw`     | none                                        |
//! | `forfeit`        | none                                        |
//!
//! Squares are `(i, j)` = (row, column) with row 0 on rank 8 and column 0
//! on file a. Times are whole seconds; a `timePlayer` of 0 means unlimited.
//!
//! ## Server → Client
//!
//! See [`ServerMessage`]. Replies such as `gameNotFound` go to the sender
//! only; move, start, undo and outcome messages are broadcast to both
//! players and every spectator.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::clock::ClockSnapshot;
use crate::error::ActionError;
use crate::types::{ChessMove, Color, GameEndReason};

/// Opaque, unguessable game identifier.
pub type GameId = String;

/// Handle of one live duplex connection.
pub type ConnectionId = Uuid;

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    CreateGame {
        #[serde(default)]
        time_player: Option<u64>,
        #[serde(default)]
        time_inc: Option<u64>,
        #[serde(default)]
        player_name: Option<String>,
    },
    JoinGame {
        gameid: GameId,
        #[serde(default)]
        player_name: Option<String>,
        #[serde(default)]
        secret: Option<String>,
    },
    Spectate {
        gameid: GameId,
    },
    CommitMovement {
        i: u8,
        j: u8,
        new_i: u8,
        new_j: u8,
        #[serde(default)]
        promote_to: Option<String>,
    },
    RequestUndo,
    ApproveUndo,
    RequestDraw,
    ApproveDraw,
    RejectDraw,
    Forfeit,
}

impl Command {
    /// Decodes one text frame. Unknown commands and malformed payloads are
    /// protocol errors.
    pub fn decode(text: &str) -> Result<Command, ActionError> {
        serde_json::from_str(text).map_err(|e| ActionError::Protocol(e.to_string()))
    }

    /// Command name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateGame { .. } => "createGame",
            Command::JoinGame { .. } => "joinGame",
            Command::Spectate { .. } => "spectate",
            Command::CommitMovement { .. } => "commitMovement",
            Command::RequestUndo => "requestUndo",
            Command::ApproveUndo => "approveUndo",
            Command::RequestDraw => "requestDraw",
            Command::ApproveDraw => "approveDraw",
            Command::RejectDraw => "rejectDraw",
            Command::Forfeit => "forfeit",
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client payloads
// ---------------------------------------------------------------------------

/// A committed move in wire coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Movement {
    pub i: u8,
    pub j: u8,
    pub new_i: u8,
    pub new_j: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promote_to: Option<String>,
}

impl From<&ChessMove> for Movement {
    fn from(mv: &ChessMove) -> Self {
        let (i, j) = mv.from.to_coords();
        let (new_i, new_j) = mv.to.to_coords();
        Self {
            i,
            j,
            new_i,
            new_j,
            promote_to: mv.promotion.map(|k| k.letter().to_string()),
        }
    }
}

/// `game` payload of a `createGame` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedGame {
    pub player_color: Color,
    pub curr_player: Color,
}

/// Full game state sent on (re)join and spectate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_color: Option<Color>,
    pub spectator: bool,
    pub curr_player: Color,
    pub movements: Vec<Movement>,
    pub notation: Vec<String>,
    pub fen: String,
    pub clocks: ClockSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<GameEndReason>,
}

/// `game` payload of a `commitMovement` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveUpdate {
    pub curr_player: Color,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promote_to: Option<String>,
    pub notation: String,
    pub check: bool,
    pub check_mate: bool,
    pub clocks: ClockSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<GameEndReason>,
}

/// `game` payload of an `undo` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoUpdate {
    pub curr_player: Color,
    pub fen: String,
    pub clocks: ClockSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    CreateGame {
        gameid: GameId,
        secret: String,
        game: CreatedGame,
    },
    JoinGame {
        gameid: GameId,
        #[serde(skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
        game: GameView,
    },
    GameNotFound {
        gameid: GameId,
    },
    GameFull {
        gameid: GameId,
    },
    AlreadyConnected {
        gameid: GameId,
    },
    Start {
        player1_name: String,
        player2_name: String,
    },
    CommitMovement {
        i: u8,
        j: u8,
        new_i: u8,
        new_j: u8,
        game: MoveUpdate,
    },
    PlayerDisconnected {
        color: Color,
    },
    PlayerReconnected {
        color: Color,
    },
    RequestUndo,
    Undo {
        i: u8,
        j: u8,
        new_i: u8,
        new_j: u8,
        game: UndoUpdate,
    },
    RequestDraw,
    RejectDraw,
    Draw {
        reason: GameEndReason,
        result: &'static str,
    },
    Forfeit {
        won: Color,
        result: &'static str,
    },
    Timeout {
        won: Color,
        result: &'static str,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A message addressed to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: ConnectionId,
    pub message: ServerMessage,
}

impl Outbound {
    pub fn new(to: ConnectionId, message: ServerMessage) -> Self {
        Self { to, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Square;
    use serde_json::json;

    #[test]
    fn test_decode_commit_movement() {
        let cmd = Command::decode(r#"{"command":"commitMovement","i":6,"j":4,"newI":4,"newJ":4}"#)
            .unwrap();
        assert_eq!(
            cmd,
            Command::CommitMovement {
                i: 6,
                j: 4,
                new_i: 4,
                new_j: 4,
                promote_to: None
            }
        );
    }

    #[test]
    fn test_decode_create_game_with_defaults_and_extra_fields() {
        let cmd = Command::decode(r#"{"command":"createGame","timePlayer":300,"color":"white"}"#)
            .unwrap();
        assert_eq!(
            cmd,
            Command::CreateGame {
                time_player: Some(300),
                time_inc: None,
                player_name: None
            }
        );
        assert_eq!(
            Command::decode(r#"{"command":"forfeit","gameid":"x"}"#).unwrap(),
            Command::Forfeit
        );
    }

    #[test]
    fn test_decode_rejects_unknown_and_malformed() {
        assert!(matches!(
            Command::decode(r#"{"command":"teleport"}"#),
            Err(ActionError::Protocol(_))
        ));
        assert!(matches!(
            Command::decode(r#"{"command":"joinGame"}"#),
            Err(ActionError::Protocol(_))
        ));
        assert!(matches!(
            Command::decode(r#"{"command":"commitMovement","i":-1,"j":0,"newI":0,"newJ":0}"#),
            Err(ActionError::Protocol(_))
        ));
        assert!(Command::decode("not json").is_err());
    }

    #[test]
    fn test_encode_commit_movement_shape() {
        let e2 = Square::from_algebraic("e2").unwrap();
        let e4 = Square::from_algebraic("e4").unwrap();
        let m = Movement::from(&ChessMove::simple(e2, e4));
        let msg = ServerMessage::CommitMovement {
            i: m.i,
            j: m.j,
            new_i: m.new_i,
            new_j: m.new_j,
            game: MoveUpdate {
                curr_player: Color::Black,
                promote_to: None,
                notation: "e4".into(),
                check: false,
                check_mate: false,
                clocks: ClockSnapshot {
                    white: 0,
                    black: 0,
                    limit: None,
                    increment: 0,
                },
                result: None,
                reason: None,
            },
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "command": "commitMovement",
                "i": 6, "j": 4, "newI": 4, "newJ": 4,
                "game": {
                    "currPlayer": "black",
                    "notation": "e4",
                    "check": false,
                    "checkMate": false,
                    "clocks": {"white": 0, "black": 0, "increment": 0}
                }
            })
        );
    }

    #[test]
    fn test_encode_replies() {
        let value: serde_json::Value =
            serde_json::from_str(&ServerMessage::RequestUndo.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"command": "requestUndo"}));

        let draw = ServerMessage::Draw {
            reason: GameEndReason::FiftyMove,
            result: "1/2-1/2",
        };
        let value: serde_json::Value = serde_json::from_str(&draw.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"command": "draw", "reason": "fifty-move", "result": "1/2-1/2"})
        );

        let start = ServerMessage::Start {
            player1_name: "Ann".into(),
            player2_name: "Bo".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&start.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"command": "start", "player1Name": "Ann", "player2Name": "Bo"})
        );
    }
}
