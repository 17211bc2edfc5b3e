//! Half-duplex conduit between a background authorization task and the
//! chat flow relaying its questions.
//!
//! The background task holds a [`Handshake`] and asks questions one at a
//! time; each prompt carries the slot its answer goes back through. The flow
//! holds the [`AuthorizationChannel`], which tracks whose turn it is, so an
//! answer with no pending prompt (or a read while a prompt is still
//! unanswered) is reported as an error instead of hanging. Dropping the
//! `Handshake` closes the channel; that is the only termination signal.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("channel closed")]
    Closed,
    #[error("canceled")]
    Canceled,
    #[error("no prompt is waiting for an answer")]
    NoPendingPrompt,
    #[error("a prompt is still waiting for an answer")]
    PromptPending,
}

enum Step {
    Prompt {
        text: String,
        answer: oneshot::Sender<String>,
    },
    Notice(String),
}

/// What the consumer got from the background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A question; the next user message is its answer.
    Prompt(String),
    /// Informational text that expects no answer.
    Notice(String),
}

/// Create a connected producer/consumer pair. The producer gives up on any
/// wait once `cancel` fires.
pub fn channel(cancel: CancellationToken) -> (Handshake, AuthorizationChannel) {
    let (tx, rx) = mpsc::channel(1);
    (
        Handshake { steps: tx, cancel },
        AuthorizationChannel {
            steps: rx,
            state: Turn::AwaitingPrompt,
        },
    )
}

/// Producer half, owned by the background authorization task.
pub struct Handshake {
    steps: mpsc::Sender<Step>,
    cancel: CancellationToken,
}

impl Handshake {
    /// Send a prompt and wait for the user's answer.
    pub async fn ask(&self, prompt: impl Into<String>) -> Result<String, HandshakeError> {
        let (tx, rx) = oneshot::channel();
        let step = Step::Prompt {
            text: prompt.into(),
            answer: tx,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(HandshakeError::Canceled),
            sent = self.steps.send(step) => sent.map_err(|_| HandshakeError::Closed)?,
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HandshakeError::Canceled),
            answer = rx => answer.map_err(|_| HandshakeError::Closed),
        }
    }

    /// Send text that needs no answer.
    pub async fn notify(&self, text: impl Into<String>) -> Result<(), HandshakeError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HandshakeError::Canceled),
            sent = self.steps.send(Step::Notice(text.into())) => {
                sent.map_err(|_| HandshakeError::Closed)
            }
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

enum Turn {
    AwaitingPrompt,
    AwaitingAnswer {
        prompt: String,
        answer: oneshot::Sender<String>,
    },
    Closed,
}

/// Consumer half, owned by the flow talking to the user.
pub struct AuthorizationChannel {
    steps: mpsc::Receiver<Step>,
    state: Turn,
}

impl AuthorizationChannel {
    /// The prompt the user has not answered yet.
    pub fn pending_prompt(&self) -> Option<&str> {
        match &self.state {
            Turn::AwaitingAnswer { prompt, .. } => Some(prompt),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        matches!(self.state, Turn::Closed)
    }

    /// Hand the user's answer to the pending prompt.
    pub fn answer(&mut self, text: String) -> Result<(), HandshakeError> {
        match std::mem::replace(&mut self.state, Turn::AwaitingPrompt) {
            Turn::AwaitingAnswer { answer, .. } => {
                if answer.send(text).is_err() {
                    // The task gave up; the next read sees the channel close.
                    debug!("Authorization task stopped before reading the answer");
                }
                Ok(())
            }
            Turn::AwaitingPrompt => Err(HandshakeError::NoPendingPrompt),
            Turn::Closed => {
                self.state = Turn::Closed;
                Err(HandshakeError::Closed)
            }
        }
    }

    /// Wait for the next prompt or notice. `Ok(None)` means the background
    /// task is done.
    pub async fn next(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Received>, HandshakeError> {
        match self.state {
            Turn::AwaitingAnswer { .. } => return Err(HandshakeError::PromptPending),
            Turn::Closed => return Ok(None),
            Turn::AwaitingPrompt => {}
        }

        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HandshakeError::Canceled),
            step = self.steps.recv() => step,
        };
        match step {
            None => {
                self.state = Turn::Closed;
                Ok(None)
            }
            Some(Step::Prompt { text, answer }) => {
                self.state = Turn::AwaitingAnswer {
                    prompt: text.clone(),
                    answer,
                };
                Ok(Some(Received::Prompt(text)))
            }
            Some(Step::Notice(text)) => Ok(Some(Received::Notice(text))),
        }
    }
}
