//! Routes decoded commands to game sessions and delivers what they emit.
//!
//! The dispatcher is transport-agnostic: the WebSocket layer hands it a
//! connection id, that connection's current game and a text frame, and
//! outbound messages leave through a [`Delivery`]. Clock deadlines are
//! scheduled here as one tokio task per session.

use log::{debug, info};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::clock::TimeControl;
use crate::config::SessionConfig;
use crate::error::{ActionError, JoinError};
use crate::game::GameSession;
use crate::protocol::*;
use crate::registry::{SessionHandle, SessionRegistry, lock_session};

/// Outbound side of the transport.
pub trait Delivery: Send + Sync {
    fn deliver(&self, to: ConnectionId, message: &ServerMessage);
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<dyn SessionRegistry>,
    delivery: Arc<dyn Delivery>,
    config: SessionConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        delivery: Arc<dyn Delivery>,
        config: SessionConfig,
    ) -> Self {
        Self {
            registry,
            delivery,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<dyn SessionRegistry> {
        &self.registry
    }

    fn send(&self, outbound: &[Outbound]) {
        for out in outbound {
            self.delivery.deliver(out.to, &out.message);
        }
    }

    /// Handles one text frame from `conn`. Frames that fail to decode are
    /// dropped without a reply.
    pub fn handle_text(&self, conn: ConnectionId, current: &mut Option<GameId>, text: &str) {
        match Command::decode(text) {
            Ok(command) => self.dispatch(conn, current, command, Instant::now()),
            Err(e) => debug!("Dropped frame from {}: {}", conn, e),
        }
    }

    /// Executes one command. Illegal actions are dropped silently; an
    /// unknown game gets a `gameNotFound` reply to the sender only.
    pub fn dispatch(
        &self,
        conn: ConnectionId,
        current: &mut Option<GameId>,
        command: Command,
        now: Instant,
    ) {
        let name = command.name();
        let result = match command {
            Command::CreateGame {
                time_player,
                time_inc,
                player_name,
            } => {
                let control = TimeControl::from_secs(time_player.unwrap_or(0), time_inc.unwrap_or(0));
                self.create_game(conn, current, control, player_name, now);
                Ok(())
            }
            Command::JoinGame {
                gameid,
                player_name,
                secret,
            } => self.join_game(conn, current, gameid, player_name, secret, now),
            Command::Spectate { gameid } => self.spectate(conn, current, gameid, now),
            Command::CommitMovement {
                i,
                j,
                new_i,
                new_j,
                promote_to,
            } => self.with_current(current, |s| {
                s.commit_move(conn, (i, j), (new_i, new_j), promote_to.as_deref(), now)
            }),
            Command::RequestUndo => self.with_current(current, |s| s.request_undo(conn)),
            Command::ApproveUndo => self.with_current(current, |s| s.approve_undo(conn, now)),
            Command::RequestDraw => self.with_current(current, |s| s.request_draw(conn, now)),
            Command::ApproveDraw => self.with_current(current, |s| s.approve_draw(conn, now)),
            Command::RejectDraw => self.with_current(current, |s| s.reject_draw(conn)),
            Command::Forfeit => self.with_current(current, |s| s.forfeit(conn, now)),
        };

        match result {
            Ok(()) => {}
            Err(ActionError::NotFound(gameid)) => {
                debug!("{} from {}: game {} not found", name, conn, gameid);
                if current.as_deref() == Some(gameid.as_str()) {
                    *current = None;
                }
                self.delivery
                    .deliver(conn, &ServerMessage::GameNotFound { gameid });
            }
            Err(e) => debug!("Dropped {} from {}: {}", name, conn, e),
        }
    }

    /// Runs `op` on the connection's current game, delivering its output
    /// while the session is still locked so broadcasts keep their order.
    fn with_current<F>(&self, current: &Option<GameId>, op: F) -> Result<(), ActionError>
    where
        F: FnOnce(&mut GameSession) -> Result<Vec<Outbound>, ActionError>,
    {
        let gameid = current
            .as_ref()
            .ok_or_else(|| ActionError::illegal("connection is not in a game"))?;
        let handle = self
            .registry
            .get(gameid)
            .ok_or_else(|| ActionError::NotFound(gameid.clone()))?;

        let mut session = lock_session(&handle);
        let outbound = op(&mut session)?;
        self.schedule_clock(&handle, &mut session, Instant::now());
        self.send(&outbound);
        Ok(())
    }

    /// Detaches `conn` from the game it is in, if any.
    fn leave_current(&self, conn: ConnectionId, current: &mut Option<GameId>, now: Instant) {
        if let Some(gameid) = current.take()
            && let Some(handle) = self.registry.get(&gameid)
        {
            let mut session = lock_session(&handle);
            let outbound = session.disconnect(conn, now);
            self.send(&outbound);
        }
    }

    fn create_game(
        &self,
        conn: ConnectionId,
        current: &mut Option<GameId>,
        control: TimeControl,
        player_name: Option<String>,
        now: Instant,
    ) {
        self.leave_current(conn, current, now);

        let gameid = self.registry.new_game_id();
        let (session, outbound) =
            GameSession::create(gameid.clone(), conn, player_name, control, self.config);
        let handle = self.registry.insert(session);
        let _session = lock_session(&handle);
        self.send(&outbound);
        *current = Some(gameid);
    }

    /// Points `conn` at `gameid` once that game has accepted it, leaving the
    /// game it was in before. The new session must already be unlocked.
    fn switch_to(&self, conn: ConnectionId, current: &mut Option<GameId>, gameid: GameId, now: Instant) {
        if current.as_deref() == Some(gameid.as_str()) {
            return;
        }
        self.leave_current(conn, current, now);
        *current = Some(gameid);
    }

    fn join_game(
        &self,
        conn: ConnectionId,
        current: &mut Option<GameId>,
        gameid: GameId,
        player_name: Option<String>,
        secret: Option<String>,
        now: Instant,
    ) -> Result<(), ActionError> {
        let handle = self
            .registry
            .get(&gameid)
            .ok_or_else(|| ActionError::NotFound(gameid.clone()))?;

        let joined = {
            let mut session = lock_session(&handle);
            match session.join(conn, player_name, secret.as_deref(), now) {
                Ok(outbound) => {
                    self.schedule_clock(&handle, &mut session, now);
                    self.send(&outbound);
                    true
                }
                Err(JoinError::NotFound) => return Err(ActionError::NotFound(gameid)),
                Err(JoinError::GameFull) => {
                    let reply = ServerMessage::GameFull {
                        gameid: gameid.clone(),
                    };
                    self.delivery.deliver(conn, &reply);
                    false
                }
                Err(JoinError::AlreadyConnected) => {
                    let reply = ServerMessage::AlreadyConnected {
                        gameid: gameid.clone(),
                    };
                    self.delivery.deliver(conn, &reply);
                    false
                }
            }
        };

        if joined {
            self.switch_to(conn, current, gameid, now);
        }
        Ok(())
    }

    fn spectate(
        &self,
        conn: ConnectionId,
        current: &mut Option<GameId>,
        gameid: GameId,
        now: Instant,
    ) -> Result<(), ActionError> {
        let handle = self
            .registry
            .get(&gameid)
            .ok_or_else(|| ActionError::NotFound(gameid.clone()))?;

        {
            let mut session = lock_session(&handle);
            let outbound = session.spectate(conn, now)?;
            self.send(&outbound);
        }

        self.switch_to(conn, current, gameid, now);
        Ok(())
    }

    /// Implicit disconnect when a connection goes away.
    pub fn disconnect(&self, conn: ConnectionId, current: &mut Option<GameId>) {
        self.leave_current(conn, current, Instant::now());
    }

    /// Drops games whose players have both been gone for the idle window.
    pub fn expire_idle(&self, now: Instant) -> Vec<GameId> {
        self.registry.expire_idle(now)
    }

    /// (Re)arms the session's flag-fall timer from its current clock.
    /// Without a tokio runtime (unit tests) nothing is scheduled; late moves
    /// are still caught at commit time.
    fn schedule_clock(&self, handle: &SessionHandle, session: &mut GameSession, now: Instant) {
        let Some(deadline) = session.clock_deadline(now) else {
            session.set_clock_timer(None);
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let dispatcher = self.clone();
        let weak = Arc::downgrade(handle);
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline.at)).await;
            dispatcher.clock_expired(&weak, deadline.generation);
        });
        session.set_clock_timer(Some(task.abort_handle()));
    }

    fn clock_expired(&self, weak: &Weak<Mutex<GameSession>>, generation: u64) {
        let Some(handle) = weak.upgrade() else {
            return;
        };
        let now = Instant::now();
        let mut session = lock_session(&handle);
        let outbound = session.on_clock_deadline(generation, now);
        if !outbound.is_empty() {
            info!("Game {}: flag fell", session.id());
        }
        self.schedule_clock(&handle, &mut session, now);
        self.send(&outbound);
    }
}
