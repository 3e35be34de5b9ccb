//! Session API.
//!
//! Maps sessions to entities, enforces the tick-header contract, and
//! stamps every reply with the server's current tick so clients can
//! resync their prediction. The API is transport-agnostic: the NATS
//! gateway and the tests call these methods directly.
//!
//! Each session owns exactly one entity; leaving deletes it.

use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::info;

use lattice_component::{
    Entity, Looker, Moveable, Named, Position, Readable, Render, Speaker, StoreError, distance,
};
use lattice_systems::{ChatListener, ChatMessage, LookItem, VisionUpdater};

use crate::updater::{ChatFrame, SessionUpdater, VisionFrame};
use crate::world::World;

/// Notes are readable up to this many tiles away.
const READ_RANGE: f32 = 5.0;

/// Avatar glyph colour.
const PLAYER_COLOR: u32 = 0x5bd54dff;

/// API-surface errors and their transport codes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Another live session already uses this name.
    #[error("name `{0}` is already taken")]
    NameTaken(String),

    /// The request's tick header is not after the server's current tick.
    #[error("tick {requested} is not after the current tick {current}")]
    StaleTick { requested: i64, current: i64 },

    /// No session with this id.
    #[error("unknown session")]
    UnknownSession,

    /// The session already took this stream.
    #[error("stream already subscribed")]
    AlreadySubscribed,

    /// A backend failure surfaced.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    /// The transport code the boundary reports for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NameTaken(_) => "already_exists",
            Self::StaleTick { .. } => "failed_precondition",
            Self::UnknownSession => "not_found",
            Self::AlreadySubscribed => "failed_precondition",
            Self::Store(err) if err.is_not_found() => "not_found",
            Self::Store(_) => "internal",
        }
    }
}

/// A reply body together with the server tick it was produced at.
#[derive(Debug)]
pub struct Reply<T> {
    pub tick: i64,
    pub body: T,
}

/// Successful join result.
#[derive(Debug, Clone, Copy)]
pub struct JoinBody {
    pub player_id: u64,
    pub tick_ms: u64,
}

struct Session {
    entity: Entity,
    name: String,
    updater: Arc<SessionUpdater>,
}

/// The session-facing operations of the world.
pub struct Api {
    world: Arc<World>,
    sessions: DashMap<String, Session>,
}

fn spawn_position() -> (i64, i64) {
    let mut rng = rand::thread_rng();
    (rng.gen_range(-5..5), rng.gen_range(-5..5))
}

impl Api {
    pub fn new(world: Arc<World>) -> Self {
        Self {
            world,
            sessions: DashMap::new(),
        }
    }

    /// The server's current tick.
    #[must_use]
    pub fn current_tick(&self) -> i64 {
        self.world.clock.current()
    }

    fn reply<T>(&self, body: T) -> Reply<T> {
        Reply {
            tick: self.current_tick(),
            body,
        }
    }

    fn session(&self, session_id: &str) -> Result<(Entity, Arc<SessionUpdater>), ApiError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or(ApiError::UnknownSession)?;
        Ok((session.entity, Arc::clone(&session.updater)))
    }

    /// Create the session's avatar and register its delivery endpoint.
    ///
    /// # Errors
    ///
    /// Fails with [`ApiError::NameTaken`] when another live session
    /// already uses the name.
    pub async fn join(&self, session_id: &str, name: &str) -> Result<Reply<JoinBody>, ApiError> {
        if self.sessions.iter().any(|session| session.name == name) {
            return Err(ApiError::NameTaken(name.to_string()));
        }

        let radius = self.world.config.radius as f32;
        let entity = self.world.registry.new_entity().await?;
        let (x, y) = spawn_position();
        self.world
            .registry
            .create_components(
                entity,
                (
                    Named {
                        name: name.to_string(),
                    },
                    Position { x, y },
                    Moveable::default(),
                    Speaker { range: radius },
                    Render {
                        ch: "@".to_string(),
                        color: PLAYER_COLOR,
                    },
                    Looker { range: radius },
                ),
            )
            .await?;

        let updater = Arc::new(SessionUpdater::new(self.world.config.updater_buffer));
        self.world
            .vision
            .add_updater(entity, Arc::clone(&updater) as Arc<dyn VisionUpdater>);
        self.world
            .chat
            .add_listener(entity, Arc::clone(&updater) as Arc<dyn ChatListener>);

        self.sessions.insert(
            session_id.to_string(),
            Session {
                entity,
                name: name.to_string(),
                updater,
            },
        );
        info!(session = session_id, entity_id = entity.id(), name, "session joined");

        Ok(self.reply(JoinBody {
            player_id: entity.id(),
            tick_ms: self.world.config.tick.as_millis() as u64,
        }))
    }

    /// Queue a velocity change to land at the requested effect tick.
    ///
    /// # Errors
    ///
    /// Fails with [`ApiError::StaleTick`] unless the header tick is
    /// strictly after the current tick.
    pub async fn set_velocity(
        &self,
        session_id: &str,
        header_tick: i64,
        x: i64,
        y: i64,
    ) -> Result<Reply<()>, ApiError> {
        let current = self.world.clock.current();
        if header_tick <= current {
            return Err(ApiError::StaleTick {
                requested: header_tick,
                current,
            });
        }
        let (entity, _) = self.session(session_id)?;

        let movement = Arc::clone(&self.world.movement);
        self.world.actions.queue_at(header_tick, move || async move {
            if let Err(error) = movement.set_velocity(header_tick, entity, x, y).await {
                tracing::warn!(%error, entity_id = entity.id(), "set velocity failed");
            }
        });
        Ok(self.reply(()))
    }

    /// Speak as the session's entity.
    pub async fn say(&self, session_id: &str, text: &str) -> Result<Reply<()>, ApiError> {
        let (entity, _) = self.session(session_id)?;
        self.world
            .chat
            .say(self.world.clock.current(), entity, text)
            .await?;
        Ok(self.reply(()))
    }

    /// Deliver the note texts at `(x, y)` to the session's chat stream,
    /// or a get-closer reply when the spot is out of reading range.
    pub async fn read(&self, session_id: &str, x: i64, y: i64) -> Result<Reply<()>, ApiError> {
        let (entity, updater) = self.session(session_id)?;
        let (pos,): (Position,) = self.world.registry.load(entity).await?;

        if distance(x, y, pos.x, pos.y) > READ_RANGE {
            updater.chat_message(&ChatMessage::system(
                "You can read only up to 5 tiles from you. Get closer and try again.".to_string(),
            ));
            return Ok(self.reply(()));
        }

        let hits = self.world.geo.find_in_range::<(Readable,)>(x, y, 0.0).await?;
        for (_, _, (readable,)) in hits {
            if readable.text.is_empty() {
                continue;
            }
            updater.chat_message(&ChatMessage::system(readable.text));
        }
        Ok(self.reply(()))
    }

    /// Subscribe to visibility updates: the one-time snapshot plus the
    /// delta stream.
    ///
    /// # Errors
    ///
    /// Fails with [`ApiError::AlreadySubscribed`] when the stream was
    /// taken before.
    pub async fn subscribe_visibility(
        &self,
        session_id: &str,
    ) -> Result<Reply<(Vec<LookItem>, mpsc::Receiver<VisionFrame>)>, ApiError> {
        let (entity, updater) = self.session(session_id)?;
        let stream = updater
            .take_vision_stream()
            .ok_or(ApiError::AlreadySubscribed)?;
        let snapshot = self.world.vision.look_all(entity).await?;
        Ok(self.reply((snapshot, stream)))
    }

    /// Subscribe to chat updates.
    ///
    /// # Errors
    ///
    /// Fails with [`ApiError::AlreadySubscribed`] when the stream was
    /// taken before.
    pub fn subscribe_chat(
        &self,
        session_id: &str,
    ) -> Result<Reply<mpsc::Receiver<ChatFrame>>, ApiError> {
        let (_, updater) = self.session(session_id)?;
        let stream = updater
            .take_chat_stream()
            .ok_or(ApiError::AlreadySubscribed)?;
        Ok(self.reply(stream))
    }

    /// Tear a session down. Its entity and every component are deleted,
    /// so observers see the disappearance.
    pub async fn leave(&self, session_id: &str) -> Result<Reply<()>, ApiError> {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return Err(ApiError::UnknownSession);
        };
        self.world.vision.remove_updater(session.entity);
        self.world.chat.remove_listener(session.entity);
        self.world.registry.delete_entity(session.entity).await?;
        info!(
            session = session_id,
            entity_id = session.entity.id(),
            name = session.name,
            "session left"
        );
        Ok(self.reply(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::WorldConfig;
    use lattice_component::MemoryBackend;
    use lattice_net::{LocalBus, WorkBus};
    use std::time::Duration;

    struct Harness {
        world: Arc<World>,
        api: Api,
    }

    async fn setup() -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let bus: Arc<dyn WorkBus> = Arc::new(LocalBus::new());
        let world = World::build(
            WorldConfig {
                radius: 15,
                tick: Duration::from_millis(100),
                updater_buffer: 64,
            },
            backend,
            bus,
        )
        .await
        .unwrap();
        let api = Api::new(Arc::clone(&world));
        Harness { world, api }
    }

    impl Harness {
        /// Advance the simulation deterministically: one clock tick, one
        /// full pipeline pass.
        async fn advance(&self, ticks: u32) {
            for _ in 0..ticks {
                let tick = self.world.clock.tick_once();
                self.world.pipeline.run_tick(tick).await;
            }
        }

        /// Join a session and pin its avatar to a known cell.
        async fn join_at(&self, name: &str, x: i64, y: i64) -> (String, Entity) {
            let session_id = format!("session-{name}");
            let reply = self.api.join(&session_id, name).await.unwrap();
            let entity = Entity::from_raw(reply.body.player_id);
            self.world.movement.teleport(0, entity, x, y).await.unwrap();
            (session_id, entity)
        }

        async fn seed_static(&self, x: i64, y: i64) -> Entity {
            let entity = self.world.registry.new_entity().await.unwrap();
            self.world
                .registry
                .create_components(
                    entity,
                    (
                        Position { x, y },
                        Render {
                            ch: "#".to_string(),
                            color: 0xff7f00,
                        },
                    ),
                )
                .await
                .unwrap();
            entity
        }

        async fn position(&self, entity: Entity) -> Position {
            let (pos,): (Position,) = self.world.registry.load(entity).await.unwrap();
            pos
        }

        async fn velocity(&self, entity: Entity) -> Moveable {
            let (mov,): (Moveable,) = self.world.registry.load(entity).await.unwrap();
            mov
        }
    }

    fn drain_vision(stream: &mut mpsc::Receiver<VisionFrame>) -> Vec<VisionFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = stream.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn drain_chat(stream: &mut mpsc::Receiver<ChatFrame>) -> Vec<ChatFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = stream.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_join_issues_player_and_tick_cadence() {
        let harness = setup().await;
        let reply = harness.api.join("s-1", "alice").await.unwrap();
        assert_ne!(reply.body.player_id, 0);
        assert_eq!(reply.body.tick_ms, 100);
    }

    #[tokio::test]
    async fn test_join_rejects_taken_name() {
        let harness = setup().await;
        harness.api.join("s-1", "alice").await.unwrap();
        let err = harness.api.join("s-2", "alice").await.unwrap_err();
        assert_eq!(err.code(), "already_exists");
    }

    #[tokio::test]
    async fn test_visibility_snapshot_covers_the_window() {
        let harness = setup().await;
        let (session, alice) = harness.join_at("alice", 0, 0).await;
        let near = harness.seed_static(5, 0).await;
        let _far = harness.seed_static(40, 0).await;

        let reply = harness.api.subscribe_visibility(&session).await.unwrap();
        let (snapshot, _stream) = reply.body;

        let mut ids: Vec<Entity> = snapshot.iter().map(|item| item.id).collect();
        ids.sort();
        assert_eq!(ids, vec![alice, near]);
    }

    #[tokio::test]
    async fn test_visibility_can_only_be_subscribed_once() {
        let harness = setup().await;
        let (session, _) = harness.join_at("alice", 0, 0).await;

        let first = harness.api.subscribe_visibility(&session).await;
        assert!(first.is_ok());
        let second = harness.api.subscribe_visibility(&session).await;
        assert_eq!(second.unwrap_err().code(), "failed_precondition");
    }

    #[tokio::test]
    async fn test_stale_tick_header_is_rejected() {
        let harness = setup().await;
        let (session, _) = harness.join_at("alice", 0, 0).await;
        harness.advance(2).await;

        let err = harness
            .api
            .set_velocity(&session, 2, 1, 0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "failed_precondition");
        assert!(harness.api.set_velocity(&session, 3, 1, 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_velocity_walk_stops_at_a_static_entity() {
        let harness = setup().await;
        harness.seed_static(5, 0).await;
        let (session, alice) = harness.join_at("alice", 0, 0).await;

        harness.api.set_velocity(&session, 1, 1, 0).await.unwrap();
        harness.advance(3).await;
        assert_eq!(harness.position(alice).await, Position { x: 3, y: 0 });

        harness.advance(2).await;
        // The cell ahead is occupied: the walk ends one short of it with
        // velocity zeroed.
        assert_eq!(harness.position(alice).await, Position { x: 4, y: 0 });
        assert!(harness.velocity(alice).await.is_zero());
    }

    #[tokio::test]
    async fn test_contested_cell_has_exactly_one_occupant() {
        let harness = setup().await;
        let (alice_session, alice) = harness.join_at("alice", 0, 0).await;
        let (bob_session, bob) = harness.join_at("bob", 2, 0).await;

        harness
            .api
            .set_velocity(&alice_session, 1, 1, 0)
            .await
            .unwrap();
        harness
            .api
            .set_velocity(&bob_session, 1, -1, 0)
            .await
            .unwrap();
        harness.advance(1).await;

        let alice_pos = harness.position(alice).await;
        let bob_pos = harness.position(bob).await;
        assert_ne!(alice_pos, bob_pos);
        let winners = [&alice_pos, &bob_pos]
            .iter()
            .filter(|p| ***p == Position { x: 1, y: 0 })
            .count();
        assert_eq!(winners, 1);
        let losers = [&alice_pos, &bob_pos]
            .iter()
            .filter(|p| ***p == Position { x: 0, y: 0 } || ***p == Position { x: 2, y: 0 })
            .count();
        assert_eq!(losers, 1);
    }

    #[tokio::test]
    async fn test_chat_reaches_peers_in_speaker_range_only() {
        let harness = setup().await;
        let (alice_session, _) = harness.join_at("alice", 0, 0).await;
        let (bob_session, _) = harness.join_at("bob", 5, 0).await;
        let (eve_session, _) = harness.join_at("eve", 20, 0).await;

        let mut bob_chat = harness.api.subscribe_chat(&bob_session).unwrap().body;
        let mut eve_chat = harness.api.subscribe_chat(&eve_session).unwrap().body;

        harness.api.say(&alice_session, "hello").await.unwrap();

        let bob_frames = drain_chat(&mut bob_chat);
        assert_eq!(bob_frames.len(), 1);
        assert_eq!(bob_frames[0].from, "alice");
        assert_eq!(bob_frames[0].text, "hello");
        assert!(drain_chat(&mut eve_chat).is_empty());
    }

    #[tokio::test]
    async fn test_teleport_command_lands_next_tick_and_observers_see_remove() {
        let harness = setup().await;
        let (alice_session, alice) = harness.join_at("alice", 0, 0).await;
        let (bob_session, _) = harness.join_at("bob", 1, 0).await;

        let mut bob_vision = harness
            .api
            .subscribe_visibility(&bob_session)
            .await
            .unwrap()
            .body
            .1;

        harness.api.say(&alice_session, "/tp 100 100").await.unwrap();
        // Not applied until the queue drains.
        assert_eq!(harness.position(alice).await, Position { x: 0, y: 0 });

        harness.advance(1).await;

        assert_eq!(harness.position(alice).await, Position { x: 100, y: 100 });
        let frames = drain_vision(&mut bob_vision);
        assert!(frames.iter().any(|frame| matches!(
            frame,
            VisionFrame::Remove { id, .. } if *id == alice
        )));
    }

    #[tokio::test]
    async fn test_note_can_be_read_nearby_but_not_from_afar() {
        let harness = setup().await;
        let (alice_session, _) = harness.join_at("alice", 10, 10).await;
        let (bob_session, _) = harness.join_at("bob", 12, 10).await;
        let (eve_session, _) = harness.join_at("eve", 40, 40).await;

        harness.api.say(&alice_session, "/note Hello").await.unwrap();

        let mut bob_chat = harness.api.subscribe_chat(&bob_session).unwrap().body;
        harness.api.read(&bob_session, 10, 10).await.unwrap();
        let frames = drain_chat(&mut bob_chat);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].from, "<SYSTEM>");
        assert_eq!(frames[0].text, "Message from alice: Hello");

        let mut eve_chat = harness.api.subscribe_chat(&eve_session).unwrap().body;
        harness.api.read(&eve_session, 10, 10).await.unwrap();
        let frames = drain_chat(&mut eve_chat);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].text.contains("Get closer"));
    }

    #[tokio::test]
    async fn test_leave_deletes_the_avatar() {
        let harness = setup().await;
        let (alice_session, alice) = harness.join_at("alice", 0, 0).await;
        let (bob_session, _) = harness.join_at("bob", 1, 0).await;

        let mut bob_vision = harness
            .api
            .subscribe_visibility(&bob_session)
            .await
            .unwrap()
            .body
            .1;

        harness.api.leave(&alice_session).await.unwrap();

        assert!(
            harness
                .world
                .registry
                .load::<(Position,)>(alice)
                .await
                .unwrap_err()
                .is_not_found()
        );
        // The name frees up again.
        assert!(harness.api.join("s-new", "alice").await.is_ok());
        // Observers saw the disappearance.
        let frames = drain_vision(&mut bob_vision);
        assert!(frames.iter().any(|frame| matches!(
            frame,
            VisionFrame::Remove { id, .. } if *id == alice
        )));
    }

    #[tokio::test]
    async fn test_unknown_session_is_rejected() {
        let harness = setup().await;
        let err = harness.api.say("ghost", "hi").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
