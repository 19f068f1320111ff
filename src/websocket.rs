//! # Call Event Stream
//!
//! The phone UI follows a call over a WebSocket at `/ws/calls/{id}`.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the UI connects for an existing call id
//! 2. **Events**: every `CallNotification` of the call is pushed as JSON
//!    (`state_changed`, `transcript`, `audio_scheduled`, `turn_complete`,
//!    `interrupted`, `ended`)
//! 3. **Commands**: the UI sends `{"type": "directive", "text": ...}` to steer
//!    the agent, or `{"type": "hang_up"}`
//! 4. **End**: after `ended` the server closes the socket
//!
//! ## Actor Model:
//! Each connection is one actor. Notifications arrive as a second stream on
//! the same actor, so socket frames and call events are handled one at a time
//! without locks.

use crate::audio::session::{CallNotification, SessionHandle};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages the UI sends.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Directive { text: String },
    HangUp,
}

/// Messages the server sends besides the call's own notifications.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected { call_id: String, state: crate::audio::session::SessionState },
    DirectiveSent,
    /// The socket fell behind and some notifications were dropped
    Lagged { missed: u64 },
    Error { code: String, message: String },
}

/// WebSocket actor following one call.
pub struct CallEventSocket {
    handle: SessionHandle,
    last_heartbeat: Instant,
}

impl CallEventSocket {
    pub fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &impl Serialize) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => warn!(error = %e, "Failed to serialize socket message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let handle = self.handle.clone();
        match message {
            ClientMessage::Directive { text } => {
                ctx.spawn(async move { handle.inject(text).await }.into_actor(self).map(
                    |result, act, ctx| match result {
                        Ok(()) => act.send(ctx, &ServerMessage::DirectiveSent),
                        Err(e) => act.send_error(ctx, e.kind(), &e.to_string()),
                    },
                ));
            }
            ClientMessage::HangUp => {
                // the `ended` notification closes the socket
                ctx.spawn(async move { handle.close().await }.into_actor(self).map(|report, _act, _ctx| {
                    debug!(call_id = %report.call_id, "Hang up requested over socket");
                }));
            }
        }
    }
}

impl Actor for CallEventSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(call_id = %self.handle.id(), "Call event socket opened");

        ctx.add_stream(BroadcastStream::new(self.handle.subscribe()));
        self.send(
            ctx,
            &ServerMessage::Connected {
                call_id: self.handle.id().to_string(),
                state: self.handle.state(),
            },
        );

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(call_id = %act.handle.id(), "Call event socket heartbeat timeout");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // the call outlives its observers; only hang_up ends it
        info!(call_id = %self.handle.id(), "Call event socket closed");
    }
}

impl StreamHandler<Result<CallNotification, BroadcastStreamRecvError>> for CallEventSocket {
    fn handle(&mut self, item: Result<CallNotification, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match item {
            Ok(notification) => {
                let ended = matches!(notification, CallNotification::Ended { .. });
                self.send(ctx, &notification);
                if ended {
                    ctx.close(Some(ws::CloseCode::Normal.into()));
                    ctx.stop();
                }
            }
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                self.send(ctx, &ServerMessage::Lagged { missed });
            }
        }
    }

    // keep the socket open when the notification stream ends; the heartbeat
    // or the client decides
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallEventSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_client_message(message, ctx),
                Err(err) => self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err)),
            },
            Ok(ws::Message::Binary(_)) => {
                self.send_error(ctx, "unsupported", "binary frames are not accepted");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(?reason, "Client closed call event socket");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(error = %err, "Call event socket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Upgrade to a WebSocket following call `{id}`.
pub async fn call_events(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let call_id = path.into_inner();
    let Some(handle) = state.sessions.get(&call_id) else {
        return Ok(HttpResponse::NotFound().json(json!({
            "error": {
                "type": "not_found",
                "message": format!("call '{}'", call_id),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        })));
    };

    debug!(call_id = %call_id, peer = ?req.connection_info().peer_addr(), "Call event socket requested");
    ws::start(CallEventSocket::new(handle), &req, stream)
}
