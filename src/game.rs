//! Game session state machine.
//!
//! A [`GameSession`] owns everything about one game: the two player slots,
//! the spectators, the current [`Position`], the committed move history with
//! one FEN snapshot per ply, the clocks and the outcome. It consults the
//! rules engine for every move and decides when the game is over.
//!
//! Operations never talk to sockets. Each returns the [`Outbound`] messages
//! it produced, addressed by connection, and the caller delivers them. A
//! rejected operation returns an error and leaves the session untouched.

use log::{debug, info};
use std::time::Instant;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::clock::{Deadline, GameClock, TimeControl};
use crate::config::SessionConfig;
use crate::error::{ActionError, JoinError};
use crate::movegen;
use crate::notation;
use crate::position::Position;
use crate::protocol::*;
use crate::types::*;

/// Half-moves without capture or pawn move after which a draw request is
/// granted on the spot.
pub const FIFTY_MOVE_PLIES: u32 = 100;

/// Half-moves without capture or pawn move after which the game is drawn
/// automatically.
pub const SEVENTY_FIVE_MOVE_PLIES: u32 = 150;

// ---------------------------------------------------------------------------
// Session data
// ---------------------------------------------------------------------------

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created; the second player slot has never been filled.
    AwaitingPlayers,
    InProgress,
    Concluded,
}

/// One of the two seats at the board.
#[derive(Debug, Clone)]
pub struct PlayerSlot {
    pub color: Color,
    pub name: String,
    /// Live connection, `None` while disconnected.
    pub connection: Option<ConnectionId>,
    /// Reconnection secret. `None` until someone has sat here.
    pub secret: Option<String>,
}

impl PlayerSlot {
    fn empty(color: Color) -> Self {
        Self {
            color,
            name: match color {
                Color::White => "White".to_string(),
                Color::Black => "Black".to_string(),
            },
            connection: None,
            secret: None,
        }
    }
}

/// A move that passed validation and was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedMove {
    pub mv: ChessMove,
    pub mover: Color,
    pub captured: Option<Piece>,
    pub check: bool,
    pub checkmate: bool,
    /// Algebraic notation (`Nf3`, `exd6 e.p.`, `0-0+`).
    pub notation: String,
    /// Coordinate form (`g1f3`).
    pub coordinate: String,
}

/// Terminal result of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub result: GameResult,
    pub reason: GameEndReason,
}

#[derive(Debug)]
pub struct GameSession {
    id: GameId,
    config: SessionConfig,
    /// White first, then Black.
    players: [PlayerSlot; 2],
    spectators: Vec<ConnectionId>,
    position: Position,
    moves: Vec<CommittedMove>,
    /// FEN after every ply, starting with the initial position.
    snapshots: Vec<String>,
    outcome: Option<Outcome>,
    started: bool,
    clock: GameClock,
    pending_undo: Option<Color>,
    pending_draw: Option<Color>,
    /// Set while both players are away.
    expires_at: Option<Instant>,
    /// Removed from the registry; every operation is a no-op from here on.
    retired: bool,
    clock_timer: Option<AbortHandle>,
}

fn new_secret() -> String {
    Uuid::new_v4().simple().to_string()
}

fn slot_index(color: Color) -> usize {
    match color {
        Color::White => 0,
        Color::Black => 1,
    }
}

impl GameSession {
    /// Creates a session with the creator seated as White and replies with
    /// the game id and the creator's secret.
    pub fn create(
        id: GameId,
        creator: ConnectionId,
        player_name: Option<String>,
        control: TimeControl,
        config: SessionConfig,
    ) -> (Self, Vec<Outbound>) {
        let secret = new_secret();
        let mut white = PlayerSlot::empty(Color::White);
        white.connection = Some(creator);
        white.secret = Some(secret.clone());
        if let Some(name) = player_name.filter(|n| !n.trim().is_empty()) {
            white.name = name;
        }

        let position = Position::starting();
        let session = Self {
            id: id.clone(),
            config,
            players: [white, PlayerSlot::empty(Color::Black)],
            spectators: Vec::new(),
            snapshots: vec![position.to_fen()],
            position,
            moves: Vec::new(),
            outcome: None,
            started: false,
            clock: GameClock::new(control),
            pending_undo: None,
            pending_draw: None,
            expires_at: None,
            retired: false,
            clock_timer: None,
        };

        info!("Created game {}", id);
        let reply = ServerMessage::CreateGame {
            gameid: id,
            secret,
            game: CreatedGame {
                player_color: Color::White,
                curr_player: Color::White,
            },
        };
        (session, vec![Outbound::new(creator, reply)])
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> &GameId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        if self.outcome.is_some() {
            SessionState::Concluded
        } else if self.started {
            SessionState::InProgress
        } else {
            SessionState::AwaitingPlayers
        }
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn moves(&self) -> &[CommittedMove] {
        &self.moves
    }

    pub fn snapshots(&self) -> &[String] {
        &self.snapshots
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Pieces captured so far, in capture order.
    pub fn captured_pieces(&self) -> Vec<Piece> {
        self.moves.iter().filter_map(|m| m.captured).collect()
    }

    pub fn spectator_count(&self) -> usize {
        self.spectators.len()
    }

    pub fn players_connected(&self) -> usize {
        self.players.iter().filter(|p| p.connection.is_some()).count()
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// `true` once both players have been away for the idle window.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Next flag-fall to watch for, if the game is live and timed.
    pub fn clock_deadline(&self, now: Instant) -> Option<Deadline> {
        if self.retired || self.outcome.is_some() {
            return None;
        }
        self.clock.deadline(now)
    }

    /// Replaces the pending clock timer, cancelling the previous one.
    pub fn set_clock_timer(&mut self, handle: Option<AbortHandle>) {
        if let Some(old) = std::mem::replace(&mut self.clock_timer, handle) {
            old.abort();
        }
    }

    /// Marks the session as removed. Stale handles see it and back off.
    pub fn retire(&mut self, now: Instant) {
        self.retired = true;
        self.clock.stop(now);
        self.set_clock_timer(None);
    }

    fn slot(&self, color: Color) -> &PlayerSlot {
        &self.players[slot_index(color)]
    }

    fn slot_mut(&mut self, color: Color) -> &mut PlayerSlot {
        &mut self.players[slot_index(color)]
    }

    /// Color played by `conn`, if it holds a player slot.
    pub fn player_color_of(&self, conn: ConnectionId) -> Option<Color> {
        self.players
            .iter()
            .find(|p| p.connection == Some(conn))
            .map(|p| p.color)
    }

    /// Every live connection: players first, then spectators.
    pub fn participants(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.players
            .iter()
            .filter_map(|p| p.connection)
            .chain(self.spectators.iter().copied())
    }

    fn broadcast(&self, message: ServerMessage) -> Vec<Outbound> {
        self.participants()
            .map(|to| Outbound::new(to, message.clone()))
            .collect()
    }

    fn broadcast_except(&self, skip: ConnectionId, message: ServerMessage) -> Vec<Outbound> {
        self.participants()
            .filter(|to| *to != skip)
            .map(|to| Outbound::new(to, message.clone()))
            .collect()
    }

    fn send_to(&self, color: Color, message: ServerMessage) -> Vec<Outbound> {
        self.slot(color)
            .connection
            .map(|to| Outbound::new(to, message))
            .into_iter()
            .collect()
    }

    /// Full state as seen by a player of `player_color`, or by a spectator.
    pub fn view(&self, player_color: Option<Color>, now: Instant) -> GameView {
        GameView {
            player_color,
            spectator: player_color.is_none(),
            curr_player: self.position.turn,
            movements: self.moves.iter().map(|m| Movement::from(&m.mv)).collect(),
            notation: self.moves.iter().map(|m| m.notation.clone()).collect(),
            fen: self.position.to_fen(),
            clocks: self.clock.snapshot(now),
            result: self.outcome.map(|o| o.result.code()),
            reason: self.outcome.map(|o| o.reason),
        }
    }

    // -----------------------------------------------------------------------
    // Guards
    // -----------------------------------------------------------------------

    fn ensure_live(&self) -> Result<(), ActionError> {
        if self.retired {
            return Err(ActionError::NotFound(self.id.clone()));
        }
        Ok(())
    }

    /// The game is live, not concluded, and `conn` is one of its players.
    fn acting_player(&self, conn: ConnectionId) -> Result<Color, ActionError> {
        self.ensure_live()?;
        if self.outcome.is_some() {
            return Err(ActionError::illegal("game is over"));
        }
        self.player_color_of(conn)
            .ok_or_else(|| ActionError::illegal("connection is not a player of this game"))
    }

    // -----------------------------------------------------------------------
    // Joining
    // -----------------------------------------------------------------------

    /// Seats `conn` in a player slot.
    ///
    /// A secret matching a disconnected slot reclaims it; otherwise the
    /// first never-used slot is taken. Each successful join issues a fresh
    /// secret, returned only to the joiner.
    pub fn join(
        &mut self,
        conn: ConnectionId,
        player_name: Option<String>,
        secret: Option<&str>,
        now: Instant,
    ) -> Result<Vec<Outbound>, JoinError> {
        if self.retired {
            return Err(JoinError::NotFound);
        }
        if self.player_color_of(conn).is_some() {
            return Err(JoinError::AlreadyConnected);
        }
        let color = self.select_slot(secret)?;
        let reconnecting = self.slot(color).secret.is_some();

        let fresh = loop {
            let candidate = new_secret();
            if self.slot(color.opponent()).secret.as_deref() != Some(candidate.as_str()) {
                break candidate;
            }
        };

        self.spectators.retain(|c| *c != conn);
        let slot = self.slot_mut(color);
        slot.connection = Some(conn);
        slot.secret = Some(fresh.clone());
        if let Some(name) = player_name.filter(|n| !n.trim().is_empty()) {
            slot.name = name;
        }
        self.expires_at = None;

        info!("Connection {} joined game {} as {}", conn, self.id, color);

        let mut out = vec![Outbound::new(
            conn,
            ServerMessage::JoinGame {
                gameid: self.id.clone(),
                secret: Some(fresh),
                game: self.view(Some(color), now),
            },
        )];

        if !self.started && self.players.iter().all(|p| p.secret.is_some()) {
            self.started = true;
            info!("Game {} started", self.id);
            out.extend(self.broadcast(ServerMessage::Start {
                player1_name: self.slot(Color::White).name.clone(),
                player2_name: self.slot(Color::Black).name.clone(),
            }));
        } else if reconnecting {
            out.extend(self.broadcast_except(conn, ServerMessage::PlayerReconnected { color }));
        }

        Ok(out)
    }

    fn select_slot(&self, secret: Option<&str>) -> Result<Color, JoinError> {
        if let Some(secret) = secret
            && let Some(slot) = self
                .players
                .iter()
                .find(|p| p.secret.as_deref() == Some(secret))
        {
            return match slot.connection {
                None => Ok(slot.color),
                Some(_) => Err(JoinError::AlreadyConnected),
            };
        }

        if let Some(slot) = self
            .players
            .iter()
            .find(|p| p.connection.is_none() && p.secret.is_none())
        {
            return Ok(slot.color);
        }

        if self.players.iter().all(|p| p.connection.is_some()) {
            Err(JoinError::GameFull)
        } else {
            Err(JoinError::AlreadyConnected)
        }
    }

    /// Adds `conn` as a read-only spectator and sends it the full state.
    pub fn spectate(&mut self, conn: ConnectionId, now: Instant) -> Result<Vec<Outbound>, ActionError> {
        self.ensure_live()?;
        if self.player_color_of(conn).is_some() {
            return Err(ActionError::illegal("players cannot spectate their own game"));
        }
        if !self.spectators.contains(&conn) {
            self.spectators.push(conn);
        }
        info!("Connection {} is spectating game {}", conn, self.id);
        Ok(vec![Outbound::new(
            conn,
            ServerMessage::JoinGame {
                gameid: self.id.clone(),
                secret: None,
                game: self.view(None, now),
            },
        )])
    }

    /// Handles a dropped connection. Players keep their slot (and secret);
    /// the others are told. Spectators simply leave.
    pub fn disconnect(&mut self, conn: ConnectionId, now: Instant) -> Vec<Outbound> {
        if self.retired {
            return Vec::new();
        }
        if let Some(pos) = self.spectators.iter().position(|c| *c == conn) {
            self.spectators.remove(pos);
            return Vec::new();
        }
        let Some(color) = self.player_color_of(conn) else {
            return Vec::new();
        };

        self.slot_mut(color).connection = None;
        info!("{} left game {}", color, self.id);

        if self.players_connected() == 0 {
            // An expiry past what `Instant` can hold never fires.
            self.expires_at = now.checked_add(self.config.idle_expiry);
            debug!("Game {} idle, expires in {:?}", self.id, self.config.idle_expiry);
        }

        self.broadcast(ServerMessage::PlayerDisconnected { color })
    }

    // -----------------------------------------------------------------------
    // Moves
    // -----------------------------------------------------------------------

    /// Commits a move requested by `conn` in wire coordinates.
    ///
    /// On success the move is broadcast to every participant. A move that
    /// arrives after the mover's clock ran out ends the game on time instead.
    pub fn commit_move(
        &mut self,
        conn: ConnectionId,
        from: (u8, u8),
        to: (u8, u8),
        promote_to: Option<&str>,
        now: Instant,
    ) -> Result<Vec<Outbound>, ActionError> {
        let mover = self.acting_player(conn)?;
        if !self.started {
            return Err(ActionError::illegal("waiting for the second player"));
        }
        if mover != self.position.turn {
            return Err(ActionError::illegal(format!("not {}'s turn", mover)));
        }
        if self.clock.is_flagged(mover, now) {
            return Ok(self.conclude_on_time(mover, now));
        }

        let from = Square::from_coords(from.0, from.1)
            .ok_or_else(|| ActionError::illegal("origin off the board"))?;
        let to = Square::from_coords(to.0, to.1)
            .ok_or_else(|| ActionError::illegal("destination off the board"))?;
        let promotion = self.promotion_choice(from, to, promote_to)?;

        let mv = movegen::validate_move(&self.position, from, to, promotion)?;
        let next = movegen::apply_move(&self.position, &mv);

        // Authoritative self-check gate; nothing has been touched yet.
        if movegen::is_in_check(&next.board, mover) {
            return Err(ActionError::illegal("move leaves own king in check"));
        }

        let committed = CommittedMove {
            mv,
            mover,
            captured: movegen::captured_piece(&self.position, &mv),
            check: next.in_check(),
            checkmate: movegen::is_checkmate(&next, next.turn),
            notation: notation::to_algebraic(&self.position, &mv),
            coordinate: notation::coordinate_form(&mv),
        };
        debug!("Game {}: {} played {}", self.id, mover, committed.notation);

        self.snapshots.push(next.to_fen());
        self.position = next;
        self.moves.push(committed.clone());
        self.pending_undo = None;
        self.pending_draw = None;
        self.clock.on_move(mover, self.moves.len(), now);

        if let Some(outcome) = self.evaluate_terminal(mover) {
            self.conclude(outcome, now);
        }

        let movement = Movement::from(&committed.mv);
        let update = MoveUpdate {
            curr_player: self.position.turn,
            promote_to: movement.promote_to,
            notation: committed.notation,
            check: committed.check,
            check_mate: committed.checkmate,
            clocks: self.clock.snapshot(now),
            result: self.outcome.map(|o| o.result.code()),
            reason: self.outcome.map(|o| o.reason),
        };
        Ok(self.broadcast(ServerMessage::CommitMovement {
            i: movement.i,
            j: movement.j,
            new_i: movement.new_i,
            new_j: movement.new_j,
            game: update,
        }))
    }

    /// Resolves the client's promotion letter. An unknown letter only
    /// matters when the move actually promotes.
    fn promotion_choice(
        &self,
        from: Square,
        to: Square,
        promote_to: Option<&str>,
    ) -> Result<Option<PieceKind>, ActionError> {
        let Some(letter) = promote_to.filter(|l| !l.trim().is_empty()) else {
            return Ok(None);
        };
        let promoting = matches!(
            self.position.board.get(from),
            Some(p) if p.kind == PieceKind::Pawn && to.rank == p.color.promotion_rank()
        );
        match PieceKind::from_promotion_letter(letter) {
            Some(kind) => Ok(Some(kind)),
            None if promoting => Err(ActionError::illegal(format!(
                "cannot promote to '{}'",
                letter
            ))),
            None => Ok(None),
        }
    }

    /// Terminal conditions after `mover`'s move, first match wins.
    fn evaluate_terminal(&self, mover: Color) -> Option<Outcome> {
        let pos = &self.position;
        let side = pos.turn;

        let (result, reason) = if movegen::is_checkmate(pos, side) {
            (GameResult::win_for(mover), GameEndReason::Checkmate)
        } else if movegen::is_stalemate(pos, side) {
            // Only the side to move can be stalemated.
            (GameResult::Draw, GameEndReason::Stalemate)
        } else if movegen::is_insufficient_material(&pos.board) {
            (GameResult::Draw, GameEndReason::InsufficientMaterial)
        } else if pos.halfmove_clock >= SEVENTY_FIVE_MOVE_PLIES {
            (GameResult::Draw, GameEndReason::SeventyFiveMove)
        } else if movegen::is_fivefold_repetition(&self.snapshots) {
            (GameResult::Draw, GameEndReason::Fivefold)
        } else {
            return None;
        };

        Some(Outcome { result, reason })
    }

    fn conclude(&mut self, outcome: Outcome, now: Instant) {
        self.outcome = Some(outcome);
        self.pending_undo = None;
        self.pending_draw = None;
        self.clock.stop(now);
        self.set_clock_timer(None);
        info!(
            "Game {} over: {} ({})",
            self.id,
            outcome.result,
            outcome.reason
        );
    }

    fn conclude_on_time(&mut self, loser: Color, now: Instant) -> Vec<Outbound> {
        let winner = loser.opponent();
        let result = GameResult::win_for(winner);
        self.conclude(
            Outcome {
                result,
                reason: GameEndReason::Timeout,
            },
            now,
        );
        self.broadcast(ServerMessage::Timeout {
            won: winner,
            result: result.code(),
        })
    }

    /// Fires when a scheduled clock deadline passes. A deadline armed under
    /// an older clock generation, or for a finished game, does nothing.
    pub fn on_clock_deadline(&mut self, generation: u64, now: Instant) -> Vec<Outbound> {
        if self.retired || self.outcome.is_some() || generation != self.clock.generation() {
            return Vec::new();
        }
        match self.clock.running_side() {
            Some(side) if self.clock.is_flagged(side, now) => self.conclude_on_time(side, now),
            _ => Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Negotiated actions
    // -----------------------------------------------------------------------

    /// Asks the opponent to take back the last move.
    pub fn request_undo(&mut self, conn: ConnectionId) -> Result<Vec<Outbound>, ActionError> {
        let color = self.acting_player(conn)?;
        if self.moves.is_empty() {
            return Err(ActionError::illegal("nothing to undo"));
        }
        self.pending_undo = Some(color);
        Ok(self.send_to(color.opponent(), ServerMessage::RequestUndo))
    }

    /// Opponent accepts the pending undo: the last ply is popped and the
    /// previous snapshot becomes the position again.
    pub fn approve_undo(&mut self, conn: ConnectionId, now: Instant) -> Result<Vec<Outbound>, ActionError> {
        let color = self.acting_player(conn)?;
        match self.pending_undo {
            Some(requester) if requester == color.opponent() => {}
            _ => return Err(ActionError::illegal("no undo request from the opponent")),
        }

        let last = self
            .moves
            .last()
            .cloned()
            .ok_or_else(|| ActionError::illegal("nothing to undo"))?;
        let previous = self
            .snapshots
            .iter()
            .rev()
            .nth(1)
            .ok_or_else(|| ActionError::illegal("missing snapshot"))?;
        let restored = Position::from_fen(previous)?;
        let replayed = notation::pgn_to_coord(&last.notation, &restored)?;
        if replayed != last.mv {
            return Err(ActionError::illegal(format!(
                "history mismatch: {} decodes to {}",
                last.notation, replayed
            )));
        }

        self.moves.pop();
        self.snapshots.pop();
        self.position = restored;
        self.pending_undo = None;
        self.pending_draw = None;
        self.clock.resume(self.position.turn, self.moves.len(), now);
        info!("Game {}: {} taken back", self.id, last.notation);

        let movement = Movement::from(&last.mv);
        Ok(self.broadcast(ServerMessage::Undo {
            i: movement.i,
            j: movement.j,
            new_i: movement.new_i,
            new_j: movement.new_j,
            game: UndoUpdate {
                curr_player: self.position.turn,
                fen: self.position.to_fen(),
                clocks: self.clock.snapshot(now),
            },
        }))
    }

    /// Offers a draw. Granted at once when the position already qualifies
    /// for a claim, otherwise relayed to the opponent.
    pub fn request_draw(&mut self, conn: ConnectionId, now: Instant) -> Result<Vec<Outbound>, ActionError> {
        let color = self.acting_player(conn)?;

        let claim = if self.position.halfmove_clock >= FIFTY_MOVE_PLIES {
            Some(GameEndReason::FiftyMove)
        } else if movegen::is_threefold_repetition(&self.snapshots) {
            Some(GameEndReason::Threefold)
        } else {
            None
        };

        match claim {
            Some(reason) => Ok(self.conclude_drawn(reason, now)),
            None => {
                self.pending_draw = Some(color);
                Ok(self.send_to(color.opponent(), ServerMessage::RequestDraw))
            }
        }
    }

    fn pending_draw_from_opponent(&self, color: Color) -> Result<(), ActionError> {
        match self.pending_draw {
            Some(requester) if requester == color.opponent() => Ok(()),
            _ => Err(ActionError::illegal("no draw offer from the opponent")),
        }
    }

    pub fn approve_draw(&mut self, conn: ConnectionId, now: Instant) -> Result<Vec<Outbound>, ActionError> {
        let color = self.acting_player(conn)?;
        self.pending_draw_from_opponent(color)?;
        Ok(self.conclude_drawn(GameEndReason::Agreement, now))
    }

    pub fn reject_draw(&mut self, conn: ConnectionId) -> Result<Vec<Outbound>, ActionError> {
        let color = self.acting_player(conn)?;
        self.pending_draw_from_opponent(color)?;
        self.pending_draw = None;
        Ok(self.send_to(color.opponent(), ServerMessage::RejectDraw))
    }

    fn conclude_drawn(&mut self, reason: GameEndReason, now: Instant) -> Vec<Outbound> {
        self.conclude(
            Outcome {
                result: GameResult::Draw,
                reason,
            },
            now,
        );
        self.broadcast(ServerMessage::Draw {
            reason,
            result: GameResult::Draw.code(),
        })
    }

    /// Resigns on behalf of `conn`.
    pub fn forfeit(&mut self, conn: ConnectionId, now: Instant) -> Result<Vec<Outbound>, ActionError> {
        let color = self.acting_player(conn)?;
        let winner = color.opponent();
        let result = GameResult::win_for(winner);
        self.conclude(
            Outcome {
                result,
                reason: GameEndReason::Resignation,
            },
            now,
        );
        Ok(self.broadcast(ServerMessage::Forfeit {
            won: winner,
            result: result.code(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Table {
        session: GameSession,
        white: ConnectionId,
        black: ConnectionId,
        white_secret: String,
        black_secret: String,
        t0: Instant,
    }

    fn secret_in(out: &[Outbound]) -> String {
        out.iter()
            .find_map(|o| match &o.message {
                ServerMessage::CreateGame { secret, .. } => Some(secret.clone()),
                ServerMessage::JoinGame { secret: Some(s), .. } => Some(s.clone()),
                _ => None,
            })
            .unwrap()
    }

    fn table(control: TimeControl) -> Table {
        let t0 = Instant::now();
        let white = Uuid::new_v4();
        let black = Uuid::new_v4();
        let (mut session, out) = GameSession::create(
            "game-1".into(),
            white,
            Some("Ann".into()),
            control,
            SessionConfig::default(),
        );
        let white_secret = secret_in(&out);
        let out = session.join(black, Some("Bo".into()), None, t0).unwrap();
        let black_secret = secret_in(&out);
        Table {
            session,
            white,
            black,
            white_secret,
            black_secret,
            t0,
        }
    }

    fn coords(s: &str) -> (u8, u8) {
        Square::from_algebraic(s).unwrap().to_coords()
    }

    impl Table {
        fn mover(&self) -> ConnectionId {
            match self.session.position().turn {
                Color::White => self.white,
                Color::Black => self.black,
            }
        }

        fn commit(&mut self, mv: &str, now: Instant) -> Result<Vec<Outbound>, ActionError> {
            let conn = self.mover();
            let promo = mv.get(4..);
            self.session
                .commit_move(conn, coords(&mv[0..2]), coords(&mv[2..4]), promo, now)
        }

        fn play(&mut self, moves: &[&str]) -> Vec<Outbound> {
            let mut last = Vec::new();
            for mv in moves {
                last = self.commit(mv, self.t0).unwrap();
            }
            last
        }

        fn set_position(&mut self, fen: &str) {
            let pos = Position::from_fen(fen).unwrap();
            self.session.snapshots = vec![pos.to_fen()];
            self.session.position = pos;
        }
    }

    #[test]
    fn test_create_seats_creator_as_white() {
        let creator = Uuid::new_v4();
        let (session, out) = GameSession::create(
            "g".into(),
            creator,
            None,
            TimeControl::unlimited(),
            SessionConfig::default(),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, creator);
        match &out[0].message {
            ServerMessage::CreateGame { gameid, secret, game } => {
                assert_eq!(gameid, "g");
                assert!(!secret.is_empty());
                assert_eq!(game.player_color, Color::White);
                assert_eq!(game.curr_player, Color::White);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.state(), SessionState::AwaitingPlayers);
        assert_eq!(session.snapshots().len(), 1);
    }

    #[test]
    fn test_second_join_starts_game() {
        let t0 = Instant::now();
        let white = Uuid::new_v4();
        let black = Uuid::new_v4();
        let (mut session, _) = GameSession::create(
            "g".into(),
            white,
            Some("Ann".into()),
            TimeControl::unlimited(),
            SessionConfig::default(),
        );
        let out = session.join(black, Some("Bo".into()), None, t0).unwrap();

        assert_eq!(out[0].to, black);
        assert!(matches!(
            &out[0].message,
            ServerMessage::JoinGame { secret: Some(_), game, .. } if game.player_color == Some(Color::Black)
        ));
        let starts: Vec<_> = out
            .iter()
            .filter(|o| {
                o.message
                    == ServerMessage::Start {
                        player1_name: "Ann".into(),
                        player2_name: "Bo".into(),
                    }
            })
            .map(|o| o.to)
            .collect();
        assert_eq!(starts, vec![white, black]);
        assert_eq!(session.state(), SessionState::InProgress);
    }

    #[test]
    fn test_e2e4_broadcast_to_both_players() {
        let mut t = table(TimeControl::unlimited());
        let out = t
            .session
            .commit_move(t.white, (6, 4), (4, 4), None, t.t0)
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].to, t.white);
        assert_eq!(out[1].to, t.black);
        assert_eq!(out[0].message, out[1].message);
        match &out[0].message {
            ServerMessage::CommitMovement { i, j, new_i, new_j, game } => {
                assert_eq!((*i, *j, *new_i, *new_j), (6, 4, 4, 4));
                assert_eq!(game.curr_player, Color::Black);
                assert_eq!(game.notation, "e4");
                assert!(!game.check);
                assert_eq!(game.result, None);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(t.session.position().turn, Color::Black);
        assert_eq!(t.session.moves()[0].coordinate, "e2e4");
        assert_eq!(t.session.snapshots().len(), t.session.moves().len() + 1);
    }

    #[test]
    fn test_fools_mate_concludes_with_mate_suffix() {
        let mut t = table(TimeControl::unlimited());
        let out = t.play(&["f2f3", "e7e5", "g2g4", "d8h4"]);

        match &out[0].message {
            ServerMessage::CommitMovement { game, .. } => {
                assert_eq!(game.notation, "Qh4#");
                assert!(game.check_mate);
                assert_eq!(game.result, Some("0-1"));
                assert_eq!(game.reason, Some(GameEndReason::Checkmate));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            t.session.outcome(),
            Some(Outcome {
                result: GameResult::BlackWins,
                reason: GameEndReason::Checkmate
            })
        );
        assert_eq!(t.session.state(), SessionState::Concluded);
        assert!(t.commit("a2a3", t.t0).is_err());
        assert!(t.session.forfeit(t.white, t.t0).is_err());
    }

    #[test]
    fn test_out_of_turn_move_changes_nothing() {
        let mut t = table(TimeControl::unlimited());
        t.play(&["e2e4"]);
        let fen = t.session.position().to_fen();
        let snapshots = t.session.snapshots().to_vec();
        let moves = t.session.moves().to_vec();

        let err = t
            .session
            .commit_move(t.white, coords("d2"), coords("d4"), None, t.t0)
            .unwrap_err();
        assert!(matches!(err, ActionError::IllegalAction(_)));

        assert_eq!(t.session.position().to_fen(), fen);
        assert_eq!(t.session.snapshots(), snapshots.as_slice());
        assert_eq!(t.session.moves(), moves.as_slice());
    }

    #[test]
    fn test_illegal_and_malformed_moves_rejected() {
        let mut t = table(TimeControl::unlimited());
        assert!(t.commit("e2e5", t.t0).is_err());
        assert!(t.commit("e3e4", t.t0).is_err());
        assert!(t.commit("e2e2", t.t0).is_err());
        assert!(t
            .session
            .commit_move(t.white, (9, 4), (4, 4), None, t.t0)
            .is_err());
        assert!(t.session.moves().is_empty());
    }

    #[test]
    fn test_commit_waits_for_second_player() {
        let white = Uuid::new_v4();
        let (mut session, _) = GameSession::create(
            "g".into(),
            white,
            None,
            TimeControl::unlimited(),
            SessionConfig::default(),
        );
        assert!(session
            .commit_move(white, (6, 4), (4, 4), None, Instant::now())
            .is_err());
    }

    #[test]
    fn test_seventy_five_move_rule_draws_automatically() {
        let mut t = table(TimeControl::unlimited());
        t.set_position("4k3/8/8/8/8/8/8/R3K3 w - - 149 80");
        let out = t.commit("a1a2", t.t0).unwrap();

        assert_eq!(
            t.session.outcome(),
            Some(Outcome {
                result: GameResult::Draw,
                reason: GameEndReason::SeventyFiveMove
            })
        );
        match &out[0].message {
            ServerMessage::CommitMovement { game, .. } => {
                assert_eq!(game.result, Some("1/2-1/2"));
                assert_eq!(game.reason, Some(GameEndReason::SeventyFiveMove));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fivefold_repetition_draws_automatically() {
        let mut t = table(TimeControl::unlimited());
        let shuffle = ["g1f3", "g8f6", "f3g1", "f6g8"];
        for _ in 0..3 {
            t.play(&shuffle);
        }
        // Initial position seen four times.
        assert_eq!(t.session.outcome(), None);

        let out = t.play(&shuffle);
        assert_eq!(
            t.session.outcome(),
            Some(Outcome {
                result: GameResult::Draw,
                reason: GameEndReason::Fivefold
            })
        );
        match &out[0].message {
            ServerMessage::CommitMovement { game, .. } => {
                assert_eq!(game.result, Some("1/2-1/2"));
                assert_eq!(game.reason, Some(GameEndReason::Fivefold));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_insufficient_material_after_capture() {
        let mut t = table(TimeControl::unlimited());
        t.set_position("4k3/8/8/8/8/8/4r3/4K3 w - - 0 1");
        t.commit("e1e2", t.t0).unwrap();
        assert_eq!(
            t.session.outcome().map(|o| o.reason),
            Some(GameEndReason::InsufficientMaterial)
        );
        assert_eq!(t.session.captured_pieces().len(), 1);
    }

    #[test]
    fn test_stalemate_of_side_to_move() {
        let mut t = table(TimeControl::unlimited());
        t.set_position("7k/8/6K1/5Q2/8/8/8/8 w - - 0 1");
        t.commit("f5f7", t.t0).unwrap();
        assert_eq!(
            t.session.outcome().map(|o| o.reason),
            Some(GameEndReason::Stalemate)
        );
    }

    #[test]
    fn test_promotion_choice() {
        let mut t = table(TimeControl::unlimited());
        t.set_position("7k/P7/8/8/8/8/8/4K3 w - - 0 1");
        assert!(t.commit("a7a8K", t.t0).is_err());
        assert!(t.commit("a7a8x", t.t0).is_err());
        let out = t.commit("a7a8n", t.t0).unwrap();
        match &out[0].message {
            ServerMessage::CommitMovement { game, .. } => {
                assert_eq!(game.promote_to.as_deref(), Some("N"));
                assert_eq!(game.notation, "a8=N");
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut t = table(TimeControl::unlimited());
        t.set_position("7k/P7/8/8/8/8/8/4K3 w - - 0 1");
        t.commit("a7a8", t.t0).unwrap();
        assert_eq!(t.session.moves()[0].mv.promotion, Some(PieceKind::Queen));
    }

    #[test]
    fn test_promotion_letter_ignored_on_normal_move() {
        let mut t = table(TimeControl::unlimited());
        t.commit("e2e4Z", t.t0).unwrap();
        assert_eq!(t.session.moves()[0].notation, "e4");
    }

    #[test]
    fn test_reconnect_with_secret_restores_slot_and_history() {
        let mut t = table(TimeControl::unlimited());
        t.play(&["e2e4", "e7e5"]);

        let out = t.session.disconnect(t.black, t.t0);
        assert_eq!(
            out,
            vec![Outbound::new(
                t.white,
                ServerMessage::PlayerDisconnected {
                    color: Color::Black
                }
            )]
        );

        let newcomer = Uuid::new_v4();
        assert_eq!(
            t.session.join(newcomer, None, Some("wrong"), t.t0).unwrap_err(),
            JoinError::AlreadyConnected
        );
        assert_eq!(
            t.session
                .join(newcomer, None, Some(&t.white_secret), t.t0)
                .unwrap_err(),
            JoinError::AlreadyConnected
        );

        let back = Uuid::new_v4();
        let out = t
            .session
            .join(back, None, Some(&t.black_secret), t.t0)
            .unwrap();
        match &out[0].message {
            ServerMessage::JoinGame { secret, game, .. } => {
                assert_eq!(game.player_color, Some(Color::Black));
                assert_eq!(game.movements.len(), 2);
                assert_eq!(game.notation, vec!["e4", "e5"]);
                assert_ne!(secret.as_deref(), Some(t.black_secret.as_str()));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(out.contains(&Outbound::new(
            t.white,
            ServerMessage::PlayerReconnected {
                color: Color::Black
            }
        )));
        assert_eq!(t.session.player_color_of(back), Some(Color::Black));

        // The old secret was replaced on rejoin.
        t.session.disconnect(back, t.t0);
        assert_eq!(
            t.session
                .join(Uuid::new_v4(), None, Some(&t.black_secret), t.t0)
                .unwrap_err(),
            JoinError::AlreadyConnected
        );
    }

    #[test]
    fn test_third_player_is_turned_away() {
        let mut t = table(TimeControl::unlimited());
        assert_eq!(
            t.session.join(Uuid::new_v4(), None, None, t.t0).unwrap_err(),
            JoinError::GameFull
        );
        assert_eq!(
            t.session.join(t.white, None, None, t.t0).unwrap_err(),
            JoinError::AlreadyConnected
        );
    }

    #[test]
    fn test_spectator_sees_moves_but_cannot_act() {
        let mut t = table(TimeControl::unlimited());
        let watcher = Uuid::new_v4();
        let out = t.session.spectate(watcher, t.t0).unwrap();
        assert!(matches!(
            &out[0].message,
            ServerMessage::JoinGame { secret: None, game, .. } if game.spectator
        ));

        let out = t.play(&["d2d4"]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].to, watcher);

        assert!(t
            .session
            .commit_move(watcher, coords("d7"), coords("d5"), None, t.t0)
            .is_err());
        assert!(t.session.request_draw(watcher, t.t0).is_err());
        assert!(t.session.forfeit(watcher, t.t0).is_err());

        assert!(t.session.disconnect(watcher, t.t0).is_empty());
        assert_eq!(t.session.spectator_count(), 0);
    }

    #[test]
    fn test_undo_needs_opponent_approval() {
        let mut t = table(TimeControl::unlimited());
        t.play(&["e2e4", "c7c5", "e4e5", "d7d5", "e5d6"]);

        let out = t.session.request_undo(t.white).unwrap();
        assert_eq!(out, vec![Outbound::new(t.black, ServerMessage::RequestUndo)]);
        assert!(t.session.approve_undo(t.white, t.t0).is_err());

        let out = t.session.approve_undo(t.black, t.t0).unwrap();
        assert_eq!(out.len(), 2);
        match &out[0].message {
            ServerMessage::Undo { i, j, new_i, new_j, game } => {
                assert_eq!((*i, *j), coords("e5"));
                assert_eq!((*new_i, *new_j), coords("d6"));
                assert_eq!(game.curr_player, Color::White);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(t.session.moves().len(), 4);
        assert_eq!(t.session.snapshots().len(), 5);
        // The en passant target survives the rewind.
        assert_eq!(
            t.session.position().en_passant,
            Square::from_algebraic("d6")
        );
        // A second approval has nothing pending.
        assert!(t.session.approve_undo(t.black, t.t0).is_err());
    }

    #[test]
    fn test_undo_request_cleared_by_next_move() {
        let mut t = table(TimeControl::unlimited());
        t.play(&["e2e4"]);
        t.session.request_undo(t.white).unwrap();
        t.play(&["e7e5"]);
        assert!(t.session.approve_undo(t.black, t.t0).is_err());
        assert_eq!(t.session.moves().len(), 2);
    }

    #[test]
    fn test_draw_offer_relay_reject_and_accept() {
        let mut t = table(TimeControl::unlimited());
        t.play(&["e2e4"]);

        let out = t.session.request_draw(t.black, t.t0).unwrap();
        assert_eq!(out, vec![Outbound::new(t.white, ServerMessage::RequestDraw)]);
        assert!(t.session.approve_draw(t.black, t.t0).is_err());

        let out = t.session.reject_draw(t.white).unwrap();
        assert_eq!(out, vec![Outbound::new(t.black, ServerMessage::RejectDraw)]);
        assert!(t.session.approve_draw(t.white, t.t0).is_err());

        t.session.request_draw(t.white, t.t0).unwrap();
        let out = t.session.approve_draw(t.black, t.t0).unwrap();
        assert_eq!(
            out[0].message,
            ServerMessage::Draw {
                reason: GameEndReason::Agreement,
                result: "1/2-1/2"
            }
        );
        assert_eq!(t.session.state(), SessionState::Concluded);
    }

    #[test]
    fn test_draw_request_granted_on_threefold() {
        let mut t = table(TimeControl::unlimited());
        t.play(&[
            "g1f3", "g8f6", "f3g1", "f6g8", "g1f3", "g8f6", "f3g1", "f6g8",
        ]);
        let out = t.session.request_draw(t.white, t.t0).unwrap();
        assert_eq!(
            out[0].message,
            ServerMessage::Draw {
                reason: GameEndReason::Threefold,
                result: "1/2-1/2"
            }
        );
    }

    #[test]
    fn test_draw_request_granted_on_fifty_moves() {
        let mut t = table(TimeControl::unlimited());
        t.set_position("4k3/8/8/8/8/8/8/R3K3 w - - 100 60");
        let out = t.session.request_draw(t.white, t.t0).unwrap();
        assert_eq!(
            out[0].message,
            ServerMessage::Draw {
                reason: GameEndReason::FiftyMove,
                result: "1/2-1/2"
            }
        );
    }

    #[test]
    fn test_forfeit_awards_opponent() {
        let mut t = table(TimeControl::unlimited());
        let out = t.session.forfeit(t.white, t.t0).unwrap();
        assert_eq!(
            out[0].message,
            ServerMessage::Forfeit {
                won: Color::Black,
                result: "0-1"
            }
        );
        assert_eq!(
            t.session.outcome().map(|o| o.reason),
            Some(GameEndReason::Resignation)
        );
    }

    #[test]
    fn test_late_commit_loses_on_time() {
        let mut t = table(TimeControl::from_secs(60, 0));
        t.play(&["e2e4", "e7e5"]);
        let late = t.t0 + Duration::from_secs(61);
        let out = t.commit("g1f3", late).unwrap();
        assert_eq!(
            out[0].message,
            ServerMessage::Timeout {
                won: Color::Black,
                result: "0-1"
            }
        );
        assert_eq!(t.session.moves().len(), 2);
        assert_eq!(
            t.session.outcome().map(|o| o.reason),
            Some(GameEndReason::Timeout)
        );
    }

    #[test]
    fn test_clock_deadline_fires_once_and_ignores_stale_generations() {
        let mut t = table(TimeControl::from_secs(60, 0));
        assert_eq!(t.session.clock_deadline(t.t0), None);
        t.play(&["e2e4", "e7e5"]);

        let deadline = t.session.clock_deadline(t.t0).unwrap();
        assert_eq!(deadline.side, Color::White);
        assert_eq!(deadline.at, t.t0 + Duration::from_secs(60));

        let past = t.t0 + Duration::from_secs(61);
        assert!(t
            .session
            .on_clock_deadline(deadline.generation + 1, past)
            .is_empty());
        assert!(t
            .session
            .on_clock_deadline(deadline.generation, t.t0 + Duration::from_secs(30))
            .is_empty());

        let out = t.session.on_clock_deadline(deadline.generation, past);
        assert_eq!(out.len(), 2);
        assert!(t.session.on_clock_deadline(deadline.generation, past).is_empty());
        assert_eq!(t.session.clock_deadline(past), None);
    }

    #[test]
    fn test_idle_expiry_armed_only_while_both_players_away() {
        let mut t = table(TimeControl::unlimited());
        let window = SessionConfig::default().idle_expiry;

        t.session.disconnect(t.white, t.t0);
        assert!(!t.session.is_expired(t.t0 + window * 2));

        t.session.disconnect(t.black, t.t0);
        assert!(!t.session.is_expired(t.t0 + window - Duration::from_secs(1)));
        assert!(t.session.is_expired(t.t0 + window));

        t.session
            .join(Uuid::new_v4(), None, Some(&t.white_secret), t.t0)
            .unwrap();
        assert!(!t.session.is_expired(t.t0 + window * 2));
    }

    #[test]
    fn test_unbounded_idle_expiry_never_fires() {
        let mut t = table(TimeControl::unlimited());
        t.session.config = SessionConfig {
            idle_expiry: Duration::MAX,
        };
        t.session.disconnect(t.white, t.t0);
        t.session.disconnect(t.black, t.t0);
        assert!(!t.session.is_expired(t.t0 + Duration::from_secs(365 * 24 * 3600)));
    }

    #[test]
    fn test_retired_session_refuses_everything() {
        let mut t = table(TimeControl::unlimited());
        t.session.retire(t.t0);
        assert!(matches!(
            t.commit("e2e4", t.t0),
            Err(ActionError::NotFound(_))
        ));
        assert_eq!(
            t.session.join(Uuid::new_v4(), None, None, t.t0).unwrap_err(),
            JoinError::NotFound
        );
        assert!(t.session.disconnect(t.white, t.t0).is_empty());
    }
}
