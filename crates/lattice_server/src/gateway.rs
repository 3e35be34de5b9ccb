//! NATS gateway.
//!
//! Exposes the session API as request/reply subjects under `world.api.*`
//! with JSON envelopes, and pumps each session's bounded streams out on
//! `world.session.{id}.vision` / `.chat`.
//!
//! Subjects:
//!
//!   world.api.join           {name}                    → {session_id, player_id, tick_ms}
//!   world.api.set-velocity   {session_id, tick, x, y}  → {}
//!   world.api.say            {session_id, text}        → {}
//!   world.api.read           {session_id, x, y}        → {}
//!   world.api.subscribe      {session_id}              → {} (starts the stream pumps)
//!   world.api.leave          {session_id}              → {}
//!
//! Every response envelope carries the server's current tick, which
//! clients use for prediction resync. Session ids are fresh UUIDs issued
//! by `join`.

use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lattice_net::subjects;

use crate::api::{Api, ApiError};
use crate::updater::{ChatFrame, VisionFrame};

#[derive(Deserialize)]
struct JoinRequest {
    name: String,
}

#[derive(Deserialize)]
struct SetVelocityRequest {
    session_id: String,
    tick: i64,
    x: i64,
    y: i64,
}

#[derive(Deserialize)]
struct SayRequest {
    session_id: String,
    text: String,
}

#[derive(Deserialize)]
struct ReadRequest {
    session_id: String,
    x: i64,
    y: i64,
}

#[derive(Deserialize)]
struct SessionRequest {
    session_id: String,
}

/// The NATS boundary of the server.
pub struct Gateway {
    api: Arc<Api>,
    client: async_nats::Client,
}

fn envelope_ok(tick: i64, body: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({ "tick": tick, "ok": body })).unwrap_or_else(|_| b"{}".to_vec())
}

fn envelope_err(tick: i64, code: &str, message: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "tick": tick,
        "error": { "code": code, "message": message }
    }))
    .unwrap_or_else(|_| b"{}".to_vec())
}

fn vision_frame_json(frame: &VisionFrame) -> Value {
    match frame {
        VisionFrame::Add { tick, item } => json!({
            "action": "add",
            "tick": tick,
            "renderable": {
                "id": item.id.id(),
                "ch": item.ch,
                "color": item.color,
                "position": { "x": item.x, "y": item.y },
                "velocity": { "x": item.vel_x, "y": item.vel_y },
            },
        }),
        VisionFrame::Remove { tick, id } => json!({
            "action": "remove",
            "tick": tick,
            "renderable": { "id": id.id() },
        }),
    }
}

fn chat_frame_json(frame: &ChatFrame) -> Value {
    json!({ "from": frame.from, "text": frame.text })
}

impl Gateway {
    pub fn new(api: Arc<Api>, client: async_nats::Client) -> Self {
        Self { api, client }
    }

    /// Serve API requests until the subscription closes.
    ///
    /// # Errors
    ///
    /// Returns an error when the wildcard subscription cannot be
    /// established.
    pub async fn run(&self) -> Result<(), async_nats::SubscribeError> {
        let subject = format!("{}.>", subjects::API_PREFIX);
        info!(subject, "gateway subscribing");
        let mut sub = self.client.subscribe(subject).await?;
        info!("gateway ready");

        while let Some(message) = sub.next().await {
            let subject = message.subject.as_str().to_string();
            let Some(op) = subject.strip_prefix("world.api.") else {
                continue;
            };
            debug!(op, "api request");
            let response = self.handle(op, &message.payload).await;
            if let Some(reply_to) = message.reply {
                if let Err(error) = self.client.publish(reply_to, response.into()).await {
                    warn!(%error, op, "failed to publish api reply");
                }
            }
        }
        Ok(())
    }

    async fn handle(&self, op: &str, payload: &[u8]) -> Vec<u8> {
        match op {
            "join" => self.handle_join(payload).await,
            "set-velocity" => self.handle_set_velocity(payload).await,
            "say" => self.handle_say(payload).await,
            "read" => self.handle_read(payload).await,
            "subscribe" => self.handle_subscribe(payload).await,
            "leave" => self.handle_leave(payload).await,
            other => self.bad_request(&format!("unknown op `{other}`")),
        }
    }

    /// Errors are stamped with the current tick here; the api stamps
    /// successful replies itself.
    fn current_tick(&self) -> i64 {
        self.api.current_tick()
    }

    fn error_reply(&self, error: &ApiError, message: &str) -> Vec<u8> {
        envelope_err(self.current_tick(), error.code(), message)
    }

    fn bad_request(&self, message: &str) -> Vec<u8> {
        envelope_err(self.current_tick(), "invalid_argument", message)
    }

    async fn handle_join(&self, payload: &[u8]) -> Vec<u8> {
        let request: JoinRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(error) => return self.bad_request(&error.to_string()),
        };
        let session_id = Uuid::new_v4().to_string();
        match self.api.join(&session_id, &request.name).await {
            Ok(reply) => envelope_ok(
                reply.tick,
                json!({
                    "session_id": session_id,
                    "player_id": reply.body.player_id,
                    "tick_ms": reply.body.tick_ms,
                }),
            ),
            Err(error) => self.error_reply(&error, &error.to_string()),
        }
    }

    async fn handle_set_velocity(&self, payload: &[u8]) -> Vec<u8> {
        let request: SetVelocityRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(error) => return self.bad_request(&error.to_string()),
        };
        match self
            .api
            .set_velocity(&request.session_id, request.tick, request.x, request.y)
            .await
        {
            Ok(reply) => envelope_ok(reply.tick, json!({})),
            Err(error) => self.error_reply(&error, &error.to_string()),
        }
    }

    async fn handle_say(&self, payload: &[u8]) -> Vec<u8> {
        let request: SayRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(error) => return self.bad_request(&error.to_string()),
        };
        match self.api.say(&request.session_id, &request.text).await {
            Ok(reply) => envelope_ok(reply.tick, json!({})),
            Err(error) => self.error_reply(&error, &error.to_string()),
        }
    }

    async fn handle_read(&self, payload: &[u8]) -> Vec<u8> {
        let request: ReadRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(error) => return self.bad_request(&error.to_string()),
        };
        match self
            .api
            .read(&request.session_id, request.x, request.y)
            .await
        {
            Ok(reply) => envelope_ok(reply.tick, json!({})),
            Err(error) => self.error_reply(&error, &error.to_string()),
        }
    }

    /// Start the session's stream pumps: the visibility snapshot followed
    /// by deltas on the vision subject, chat lines on the chat subject.
    async fn handle_subscribe(&self, payload: &[u8]) -> Vec<u8> {
        let request: SessionRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(error) => return self.bad_request(&error.to_string()),
        };

        let (snapshot, vision_stream) =
            match self.api.subscribe_visibility(&request.session_id).await {
                Ok(reply) => reply.body,
                Err(error) => return self.error_reply(&error, &error.to_string()),
            };
        let chat_stream = match self.api.subscribe_chat(&request.session_id) {
            Ok(reply) => reply.body,
            Err(error) => return self.error_reply(&error, &error.to_string()),
        };

        let tick = self.current_tick();
        self.pump_vision(&request.session_id, tick, snapshot, vision_stream);
        self.pump_chat(&request.session_id, chat_stream);
        envelope_ok(tick, json!({}))
    }

    fn pump_vision(
        &self,
        session_id: &str,
        tick: i64,
        snapshot: Vec<lattice_systems::LookItem>,
        mut stream: mpsc::Receiver<VisionFrame>,
    ) {
        let client = self.client.clone();
        let subject = subjects::session_vision(session_id);
        let session = session_id.to_string();
        tokio::spawn(async move {
            for item in snapshot {
                let frame = VisionFrame::Add { tick, item };
                let payload = serde_json::to_vec(&vision_frame_json(&frame)).unwrap_or_default();
                if let Err(error) = client.publish(subject.clone(), payload.into()).await {
                    warn!(%error, session, "vision pump failed; stopping");
                    return;
                }
            }
            while let Some(frame) = stream.recv().await {
                let payload = serde_json::to_vec(&vision_frame_json(&frame)).unwrap_or_default();
                if let Err(error) = client.publish(subject.clone(), payload.into()).await {
                    warn!(%error, session, "vision pump failed; stopping");
                    return;
                }
            }
            debug!(session, "vision pump drained");
        });
    }

    fn pump_chat(&self, session_id: &str, mut stream: mpsc::Receiver<ChatFrame>) {
        let client = self.client.clone();
        let subject = subjects::session_chat(session_id);
        let session = session_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = stream.recv().await {
                let payload = serde_json::to_vec(&chat_frame_json(&frame)).unwrap_or_default();
                if let Err(error) = client.publish(subject.clone(), payload.into()).await {
                    warn!(%error, session, "chat pump failed; stopping");
                    return;
                }
            }
            debug!(session, "chat pump drained");
        });
    }

    async fn handle_leave(&self, payload: &[u8]) -> Vec<u8> {
        let request: SessionRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(error) => return self.bad_request(&error.to_string()),
        };
        match self.api.leave(&request.session_id).await {
            Ok(reply) => envelope_ok(reply.tick, json!({})),
            Err(error) => self.error_reply(&error, &error.to_string()),
        }
    }
}
