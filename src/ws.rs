//! WebSocket transport for the game channel at `/ws`.
//!
//! ## Architecture
//!
//! - **`ConnectionHub`**: a singleton actor holding the address of every
//!   live connection. Sessions never see sockets; the [`Dispatcher`] hands
//!   their outbound messages to [`HubDelivery`], which forwards them to the
//!   hub, which writes them to the right connection.
//!
//! - **`WsConnection`**: one actor per socket. It owns the connection id and
//!   the id of the game the connection is currently in, feeds text frames
//!   to the dispatcher and keeps the heartbeat.
//!
//! Messages for one connection pass through a single mailbox, so they
//! arrive in the order the sessions emitted them.

use actix::prelude::*;
use actix_web::{HttpRequest, HttpResponse, web};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::dispatcher::{Delivery, Dispatcher};
use crate::protocol::{ConnectionId, GameId, ServerMessage};

/// How often the server pings each client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// A client silent for this long is disconnected.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Hub messages
// ---------------------------------------------------------------------------

/// Registers a connection with the hub.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect {
    pub addr: Addr<WsConnection>,
    pub connection_id: ConnectionId,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub connection_id: ConnectionId,
}

/// An encoded frame for one connection.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Deliver {
    pub to: ConnectionId,
    pub text: String,
}

/// Internal message: write a text frame to this connection's socket.
#[derive(Message)]
#[rtype(result = "()")]
pub struct WsText(pub String);

// ---------------------------------------------------------------------------
// ConnectionHub
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ConnectionHub {
    connections: HashMap<ConnectionId, Addr<WsConnection>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Actor for ConnectionHub {
    type Context = Context<Self>;
}

impl Handler<Connect> for ConnectionHub {
    type Result = ();

    fn handle(&mut self, msg: Connect, _ctx: &mut Context<Self>) {
        log::debug!("Connection {} registered with hub", msg.connection_id);
        self.connections.insert(msg.connection_id, msg.addr);
    }
}

impl Handler<Disconnect> for ConnectionHub {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _ctx: &mut Context<Self>) {
        log::debug!("Connection {} left hub", msg.connection_id);
        self.connections.remove(&msg.connection_id);
    }
}

impl Handler<Deliver> for ConnectionHub {
    type Result = ();

    fn handle(&mut self, msg: Deliver, _ctx: &mut Context<Self>) {
        match self.connections.get(&msg.to) {
            Some(addr) => addr.do_send(WsText(msg.text)),
            // Gone between emit and delivery; nothing to do.
            None => log::debug!("Dropped message for closed connection {}", msg.to),
        }
    }
}

/// [`Delivery`] that routes through the hub actor.
#[derive(Clone)]
pub struct HubDelivery {
    hub: Addr<ConnectionHub>,
}

impl HubDelivery {
    pub fn new(hub: Addr<ConnectionHub>) -> Self {
        Self { hub }
    }
}

impl Delivery for HubDelivery {
    fn deliver(&self, to: ConnectionId, message: &ServerMessage) {
        match message.encode() {
            Ok(text) => self.hub.do_send(Deliver { to, text }),
            Err(e) => log::error!("Failed to encode message for {}: {}", to, e),
        }
    }
}

// ---------------------------------------------------------------------------
// WsConnection
// ---------------------------------------------------------------------------

/// Actor for one WebSocket client.
pub struct WsConnection {
    id: ConnectionId,
    /// Game this connection created, joined or is watching.
    current: Option<GameId>,
    last_heartbeat: Instant,
    dispatcher: Dispatcher,
    hub: Addr<ConnectionHub>,
}

impl WsConnection {
    pub fn new(dispatcher: Dispatcher, hub: Addr<ConnectionHub>) -> Self {
        Self {
            id: Uuid::new_v4(),
            current: None,
            last_heartbeat: Instant::now(),
            dispatcher,
            hub,
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                log::warn!("Connection {} heartbeat timeout, disconnecting", act.id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for WsConnection {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::debug!("Connection {} opened", self.id);
        self.start_heartbeat(ctx);
        self.hub.do_send(Connect {
            addr: ctx.address(),
            connection_id: self.id,
        });
    }

    /// Leaving the socket counts as leaving the game.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        log::debug!("Connection {} closed", self.id);
        self.dispatcher.disconnect(self.id, &mut self.current);
        self.hub.do_send(Disconnect {
            connection_id: self.id,
        });
    }
}

impl actix::StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsConnection {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.dispatcher.handle_text(self.id, &mut self.current, &text);
            }
            Ok(ws::Message::Binary(_)) => {
                log::warn!("Connection {}: binary frames are not supported", self.id);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                log::debug!("Connection {} closed by client: {:?}", self.id, reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                log::error!("Connection {} protocol error: {}", self.id, e);
                ctx.stop();
            }
        }
    }
}

impl Handler<WsText> for WsConnection {
    type Result = ();

    fn handle(&mut self, msg: WsText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// Upgrades `GET /ws` to a game channel.
pub async fn ws_connect(
    req: HttpRequest,
    stream: web::Payload,
    dispatcher: web::Data<Dispatcher>,
    hub: web::Data<Addr<ConnectionHub>>,
) -> Result<HttpResponse, actix_web::Error> {
    let connection = WsConnection::new(dispatcher.get_ref().clone(), hub.get_ref().clone());
    log::debug!("WebSocket upgrade from {:?}", req.peer_addr());
    ws::start(connection, &req, stream)
}
