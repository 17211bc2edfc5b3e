//! Conversation flows and the per-user scheduler that routes messages to them.
//!
//! A user is either idle or inside exactly one flow. While a flow is active
//! every message goes to it, commands included, until the flow reports
//! [`FlowOutcome::Finished`]. When idle, a registered entry command starts
//! its flow; anything else is ignored.
//!
//! The scheduler does no locking of its own. Callers must never run two
//! `handle_message` calls for the same user concurrently; the bot layer
//! does this by keeping one scheduler per user behind a mutex.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::im::command::{parse_command, CommandError, CommandParser};
use crate::im::handshake::HandshakeError;
use crate::im::{Message, Messenger, UserId};

/// What a flow tells the scheduler after handling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    /// The flow keeps owning the conversation.
    Continue,
    /// The flow is done; the scheduler goes back to idle.
    Finished,
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("parsing command: {0}")]
    Command(#[from] CommandError),
    #[error("{messenger} send message: {error:#}")]
    Delivery {
        messenger: String,
        error: anyhow::Error,
    },
    #[error("{} notification(s) could not be delivered: {}", .0.len(), join_errors(.0))]
    DeliveryBatch(Vec<anyhow::Error>),
    #[error("starting authorization: {0:#}")]
    Authorization(anyhow::Error),
    #[error("authorization handshake: {0}")]
    Handshake(#[from] HandshakeError),
}

fn join_errors(errors: &[anyhow::Error]) -> String {
    errors
        .iter()
        .map(|e| format!("{e:#}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl FlowError {
    pub fn delivery(messenger: &dyn Messenger, error: anyhow::Error) -> Self {
        FlowError::Delivery {
            messenger: messenger.name().to_string(),
            error,
        }
    }
}

/// A stateful conversation handler.
#[async_trait]
pub trait Flow: Send {
    /// Called with the entry command that activated the flow.
    async fn start(
        &mut self,
        cancel: &CancellationToken,
        message: &Message,
        messenger: &dyn Messenger,
    ) -> Result<FlowOutcome, FlowError>;

    /// Called for every message while the flow is active.
    async fn handle_message(
        &mut self,
        cancel: &CancellationToken,
        message: &Message,
        messenger: &dyn Messenger,
    ) -> Result<FlowOutcome, FlowError>;

    fn command_parser(&self) -> CommandParser {
        parse_command
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("flow already registered: {0}")]
    AlreadyRegistered(String),
    #[error("command {command} already triggers flow {flow}")]
    TriggerConflict { command: String, flow: String },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("handling message in flow {flow}: {error}")]
    Flow { flow: String, error: FlowError },
}

/// Builds a fully registered scheduler for one user.
pub type SchedulerFactory =
    Arc<dyn Fn(UserId) -> anyhow::Result<FlowScheduler> + Send + Sync>;

/// Per-user router holding the registered flows and the active one.
pub struct FlowScheduler {
    user_id: UserId,
    flows: HashMap<String, Box<dyn Flow>>,
    entry_points: HashMap<String, String>,
    current: Option<String>,
}

impl FlowScheduler {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            flows: HashMap::new(),
            entry_points: HashMap::new(),
            current: None,
        }
    }

    #[cfg(test)]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Name of the active flow, if any.
    pub fn current_flow(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Register `flow` under `name`, started by any of `commands` (with the
    /// leading `/`). Nothing is registered unless every check passes.
    pub fn register_flow<F>(
        &mut self,
        flow: F,
        name: &str,
        commands: &[&str],
    ) -> Result<(), RegisterError>
    where
        F: Flow + 'static,
    {
        if self.flows.contains_key(name) {
            return Err(RegisterError::AlreadyRegistered(name.to_string()));
        }
        for command in commands {
            if let Some(owner) = self.entry_points.get(*command) {
                return Err(RegisterError::TriggerConflict {
                    command: command.to_string(),
                    flow: owner.clone(),
                });
            }
        }

        for command in commands {
            self.entry_points
                .insert(command.to_string(), name.to_string());
        }
        self.flows.insert(name.to_string(), Box::new(flow));
        Ok(())
    }

    /// Route one inbound message: forward it to the active flow, or start
    /// the flow its entry command names.
    pub async fn handle_message(
        &mut self,
        cancel: &CancellationToken,
        message: &Message,
        messenger: &dyn Messenger,
    ) -> Result<(), SchedulerError> {
        debug!(
            "User {} entering handler, current flow: {:?}",
            self.user_id, self.current
        );
        let result = self.route(cancel, message, messenger).await;
        debug!(
            "User {} leaving handler, current flow: {:?}",
            self.user_id, self.current
        );
        result
    }

    async fn route(
        &mut self,
        cancel: &CancellationToken,
        message: &Message,
        messenger: &dyn Messenger,
    ) -> Result<(), SchedulerError> {
        if let Some(name) = self.current.clone() {
            let Some(flow) = self.flows.get_mut(&name) else {
                warn!("Active flow '{}' is not registered, going idle", name);
                self.current = None;
                return Ok(());
            };
            let outcome = flow
                .handle_message(cancel, message, messenger)
                .await
                .map_err(|error| SchedulerError::Flow {
                    flow: name.clone(),
                    error,
                })?;
            self.settle(&name, outcome);
            return Ok(());
        }

        if !message.is_command() {
            return Ok(());
        }

        let command = match message.as_command(parse_command) {
            Ok(command) => command,
            Err(e) => {
                debug!("Ignoring message from user {}: {}", self.user_id, e);
                return Ok(());
            }
        };

        let Some(name) = self.entry_points.get(&command.name).cloned() else {
            info!(
                "Command not recognized for user {}: {}",
                self.user_id, command.name
            );
            return Ok(());
        };
        let Some(flow) = self.flows.get_mut(&name) else {
            return Ok(());
        };

        info!("Starting flow '{}' for user {}", name, self.user_id);
        self.current = Some(name.clone());
        let outcome = flow
            .start(cancel, message, messenger)
            .await
            .map_err(|error| SchedulerError::Flow {
                flow: name.clone(),
                error,
            })?;
        self.settle(&name, outcome);
        Ok(())
    }

    fn settle(&mut self, name: &str, outcome: FlowOutcome) {
        if outcome == FlowOutcome::Finished {
            info!("Flow '{}' finished for user {}", name, self.user_id);
            self.current = None;
        }
    }
}
