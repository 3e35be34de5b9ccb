//! Slash commands.
//!
//! The command set is closed and authored here. Commands reply to the
//! invoking listener only; argument parse failures reply
//! `Invalid syntax.`.

use std::sync::Arc;

use tracing::warn;

use lattice_component::{Entity, Named, Position, Readable, Render, StoreError};

use crate::chat::ChatSystem;

/// A slash command's name and help line.
pub struct ChatCommand {
    pub name: &'static str,
    pub help: &'static str,
}

/// The authored command set, in `/help` listing order.
pub const COMMANDS: &[ChatCommand] = &[
    ChatCommand {
        name: "help",
        help: "Displays this help",
    },
    ChatCommand {
        name: "tp",
        help: "Teleports you to the given coordinates. Eg: /tp 0 0",
    },
    ChatCommand {
        name: "note",
        help: "Leaves a note in the world. Eg: /note Hello world!",
    },
];

impl ChatSystem {
    pub(crate) async fn dispatch_command(
        &self,
        tick: i64,
        entity: Entity,
        input: &str,
    ) -> Result<(), StoreError> {
        let mut parts = input.split_whitespace();
        let Some(command) = parts.next() else {
            self.reply(entity, "Invalid syntax.".to_string());
            return Ok(());
        };
        let args: Vec<&str> = parts.collect();

        match command {
            "help" => {
                self.command_help(entity);
                Ok(())
            }
            "tp" => {
                self.command_tp(tick, entity, &args);
                Ok(())
            }
            "note" => self.command_note(entity, &args).await,
            other => {
                self.reply(entity, format!("Unknown command `/{other}`. Try /help."));
                Ok(())
            }
        }
    }

    fn command_help(&self, entity: Entity) {
        let mut message = String::from("This is the list of commands:\n");
        for command in COMMANDS {
            message.push_str(&format!("  /{}: {}\n", command.name, command.help));
        }
        self.reply(entity, message);
    }

    /// Teleport through the action queue, so the move observes the tick
    /// barrier. Teleports ignore obstacles.
    fn command_tp(&self, tick: i64, entity: Entity, args: &[&str]) {
        let parsed = match args {
            [x, y] => x.parse::<i64>().ok().zip(y.parse::<i64>().ok()),
            _ => None,
        };
        let Some((x, y)) = parsed else {
            self.reply(entity, "Invalid syntax.".to_string());
            return;
        };

        self.reply(entity, format!("Teleporting to [{x} {y}]."));
        let movement = Arc::clone(&self.movement);
        self.actions.queue_immediate(move || async move {
            if let Err(error) = movement.teleport(tick, entity, x, y).await {
                warn!(%error, entity_id = entity.id(), "teleport failed");
            }
        });
    }

    /// Leave a note: a fresh entity at the speaker's cell carrying the
    /// message.
    async fn command_note(&self, entity: Entity, args: &[&str]) -> Result<(), StoreError> {
        if args.is_empty() {
            self.reply(entity, "Invalid syntax.".to_string());
            return Ok(());
        }

        let (pos, named): (Position, Named) = self.registry.load(entity).await?;
        let text = args.join(" ");

        let note = self.registry.new_entity().await?;
        self.registry
            .create_components(
                note,
                (
                    Position { x: pos.x, y: pos.y },
                    Render {
                        ch: "n".to_string(),
                        color: 0x00c965,
                    },
                    Readable {
                        text: format!("Message from {}: {}", named.name, text),
                    },
                ),
            )
            .await?;

        self.reply(entity, "Note sent.".to_string());
        Ok(())
    }
}
