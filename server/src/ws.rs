//! actix-web WebSocket binding.
//!
//! One actor per socket. The first text frame is the raw join token; the
//! session hands it to [`RoomServer::admit`] together with the write half of
//! the connection and refuses any other frame until admission settles.
//! After that, text frames flow into the room as application messages and
//! outbound [`SocketCommand`]s are pumped back into real frames.

use std::sync::Arc;

use actix::{Actor, ActorContext, AsyncContext, Handler, Message, StreamHandler};
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use actix_web_actors::ws;
use roomcast_protocol::ErrorEnvelope;
use tokio::sync::mpsc;

use crate::socket::{SocketCommand, SocketHandle};
use crate::{AdmitError, AdmittedClient, RoomServer};

/// WebSocket actor for one client connection.
pub struct ClientSession {
    server: Arc<RoomServer>,
    state: SessionState,
    /// Receiver for outbound commands, held until admission succeeds.
    outbound: Option<mpsc::Receiver<SocketCommand>>,
}

enum SessionState {
    AwaitingToken,
    Authenticating,
    Joined(Arc<AdmittedClient>),
    Rejected,
}

#[derive(Message)]
#[rtype(result = "()")]
struct AdmitOutcome(Result<AdmittedClient, AdmitError>);

#[derive(Message)]
#[rtype(result = "()")]
struct Outbound(SocketCommand);

impl ClientSession {
    pub fn new(server: Arc<RoomServer>) -> Self {
        Self {
            server,
            state: SessionState::AwaitingToken,
            outbound: None,
        }
    }

    fn reject(&mut self, envelope: ErrorEnvelope, ctx: &mut ws::WebsocketContext<Self>) {
        if let Ok(text) = serde_json::to_string(&envelope) {
            ctx.text(text);
        }
        self.state = SessionState::Rejected;
        ctx.close(None);
        ctx.stop();
    }

    fn begin_admission(&mut self, token: String, ctx: &mut ws::WebsocketContext<Self>) {
        let (socket, outbound) = SocketHandle::channel();
        self.outbound = Some(outbound);
        self.state = SessionState::Authenticating;

        let server = Arc::clone(&self.server);
        let addr = ctx.address();
        actix::spawn(async move {
            let outcome = server.admit(&token, socket).await;
            let _ = addr.try_send(AdmitOutcome(outcome));
        });
    }

    fn start_outbound_pump(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(mut outbound) = self.outbound.take() {
            let addr = ctx.address();
            actix::spawn(async move {
                while let Some(command) = outbound.recv().await {
                    if addr.try_send(Outbound(command)).is_err() {
                        break;
                    }
                }
            });
        }
    }
}

impl Actor for ClientSession {
    type Context = ws::WebsocketContext<Self>;

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let SessionState::Joined(admitted) = &self.state {
            let server = Arc::clone(&self.server);
            let room_id = admitted.room_id().to_string();
            let client_id = admitted.client_id().to_string();
            actix::spawn(async move {
                server.connection_closed(&room_id, &client_id).await;
            });
        }
    }
}

impl Handler<AdmitOutcome> for ClientSession {
    type Result = ();

    fn handle(&mut self, msg: AdmitOutcome, ctx: &mut Self::Context) {
        match msg.0 {
            Ok(admitted) => {
                self.state = SessionState::Joined(Arc::new(admitted));
                self.start_outbound_pump(ctx);
            }
            Err(err) => {
                tracing::debug!(%err, "admission refused");
                self.reject(err.envelope(), ctx);
            }
        }
    }
}

impl Handler<Outbound> for ClientSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg.0 {
            SocketCommand::Text(text) => ctx.text(text),
            SocketCommand::Ping => ctx.ping(b""),
            SocketCommand::Close => {
                ctx.close(None);
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match &self.state {
                SessionState::AwaitingToken => self.begin_admission(text.to_string(), ctx),
                SessionState::Authenticating => {
                    // nothing else is processed before authentication settles
                    self.reject(
                        ErrorEnvelope::authentication_failed(
                            "The authentication token must be accepted before further messages.",
                        ),
                        ctx,
                    );
                }
                SessionState::Joined(admitted) => {
                    let admitted = Arc::clone(admitted);
                    actix::spawn(async move {
                        admitted.receive(text.to_string()).await;
                    });
                }
                SessionState::Rejected => {}
            },
            Ok(ws::Message::Ping(payload)) => ctx.pong(&payload),
            Ok(ws::Message::Pong(_)) => {
                if let SessionState::Joined(admitted) = &self.state {
                    admitted.record_pong();
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::debug!("ignoring binary frame");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!(?reason, "socket closed by peer");
                ctx.stop();
            }
            _ => (),
        }
    }
}

/// HTTP handler upgrading a request into a [`ClientSession`].
pub async fn room_ws(
    req: HttpRequest,
    stream: web::Payload,
    server: web::Data<Arc<RoomServer>>,
) -> Result<HttpResponse, actix_web::Error> {
    ws::start(ClientSession::new(Arc::clone(server.get_ref())), &req, stream)
}

/// Bind the WebSocket endpoint for `server` and run until the process exits.
pub async fn serve(server: Arc<RoomServer>, addr: &str) -> std::io::Result<()> {
    tracing::info!(%addr, public_url = %server.public_url(), "websocket endpoint listening");
    let data = web::Data::new(server);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/", web::get().to(room_ws))
    })
    .bind(addr)?
    .run()
    .await
}
