//! Polls the chat for commands and answers them.

use super::{Command, CommandDispatcher};
use crate::config::keys;
use crate::engine::BackupEngine;
use crate::sink::CommandSource;
use crate::{AgentError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct CommandListener {
    source: Arc<dyn CommandSource>,
    engine: Arc<BackupEngine>,
    dispatcher: CommandDispatcher,
}

impl CommandListener {
    pub fn new(source: Arc<dyn CommandSource>, engine: Arc<BackupEngine>) -> Self {
        Self {
            source,
            dispatcher: CommandDispatcher::new(Arc::clone(&engine)),
            engine,
        }
    }

    /// Fetch pending messages once, answer the commands among them and
    /// return how many were dispatched.
    ///
    /// The offset is stored before a command runs, so a crash never replays
    /// a command that already started.
    pub async fn poll_once(&self) -> Result<usize> {
        let Some(target) = self.engine.remote_target()? else {
            debug!("Remote not configured, skipping command poll");
            return Ok(0);
        };

        let store = self.engine.store();
        let offset = store.get_int(keys::LISTENER_OFFSET)?.unwrap_or(0);
        let updates = self
            .source
            .fetch_updates(&target, offset)
            .await
            .map_err(|e| AgentError::Remote(e.to_string()))?;

        let mut handled = 0;
        for message in updates {
            store.put_int(keys::LISTENER_OFFSET, message.update_id + 1)?;

            if message.chat_id != target.target_id {
                warn!(chat = %message.chat_id, "Ignoring message from unknown chat");
                continue;
            }
            let Some(command) = Command::parse(&message.text) else {
                debug!("Ignoring non-command message");
                continue;
            };

            info!("Received {:?} command", command);
            let reply = self.dispatcher.dispatch(command).await;
            if let Err(e) = self.engine.sink().send_message(&target, &reply).await {
                warn!("Failed to reply to {:?}: {}", command, e);
            }
            handled += 1;
        }

        Ok(handled)
    }
}
