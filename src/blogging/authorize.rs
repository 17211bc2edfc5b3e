use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blogging::Authorizer;
use crate::im::flow::{Flow, FlowError, FlowOutcome};
use crate::im::handshake::{AuthorizationChannel, HandshakeError, Received};
use crate::im::{Message, Messenger};

const NOT_RUNNING: &str = "Authorization is not running, please send your message again.";

/// Relays an [`Authorizer`]'s questions to the user and the user's answers
/// back, one turn per message, until the authorization task closes its
/// channel. Create one per user and platform.
pub struct AuthorizerFlow {
    authorizer: Arc<dyn Authorizer>,
    channel: Option<AuthorizationChannel>,
}

impl AuthorizerFlow {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            authorizer,
            channel: None,
        }
    }

    async fn reply(
        messenger: &dyn Messenger,
        message: &Message,
        text: &str,
    ) -> Result<(), FlowError> {
        messenger
            .send_message(&message.reply(text))
            .await
            .map_err(|e| FlowError::delivery(messenger, e))
    }
}

#[async_trait]
impl Flow for AuthorizerFlow {
    async fn start(
        &mut self,
        cancel: &CancellationToken,
        message: &Message,
        messenger: &dyn Messenger,
    ) -> Result<FlowOutcome, FlowError> {
        let channel = self
            .authorizer
            .start_authorization(cancel.clone(), message.user_id)
            .await
            .map_err(FlowError::Authorization)?;
        info!(
            "{} authorizer: started authorization for user {}",
            messenger.name(),
            message.user_id
        );
        self.channel = Some(channel);
        // The entry command carries no answer, so this only reads the first prompt.
        self.handle_message(cancel, message, messenger).await
    }

    async fn handle_message(
        &mut self,
        cancel: &CancellationToken,
        message: &Message,
        messenger: &dyn Messenger,
    ) -> Result<FlowOutcome, FlowError> {
        let Some(channel) = self.channel.as_mut() else {
            warn!(
                "{} authorizer: no authorization running for user {}",
                messenger.name(),
                message.user_id
            );
            Self::reply(messenger, message, NOT_RUNNING).await?;
            return Ok(FlowOutcome::Finished);
        };

        if !message.is_command() && !message.is_empty() {
            debug!(
                "{} authorizer: answer from chat {} for user {}",
                messenger.name(),
                message.chat_id,
                message.user_id
            );
            match channel.answer(message.text.clone()) {
                Ok(()) | Err(HandshakeError::Closed) => {}
                Err(HandshakeError::NoPendingPrompt) => {
                    warn!(
                        "{} authorizer: dropping answer from user {}, nothing was asked",
                        messenger.name(),
                        message.user_id
                    );
                }
                Err(e) => return Err(e.into()),
            }
        } else if let Some(prompt) = channel.pending_prompt() {
            // No answer in this message: ask again rather than read out of turn.
            Self::reply(messenger, message, prompt).await?;
            return Ok(FlowOutcome::Continue);
        }

        loop {
            match channel.next(cancel).await {
                Ok(Some(Received::Prompt(prompt))) => {
                    Self::reply(messenger, message, &prompt).await?;
                    return Ok(FlowOutcome::Continue);
                }
                Ok(Some(Received::Notice(notice))) => {
                    Self::reply(messenger, message, &notice).await?;
                }
                Ok(None) => {
                    info!(
                        "{} authorizer: finished authorization for user {}",
                        messenger.name(),
                        message.user_id
                    );
                    self.channel = None;
                    return Ok(FlowOutcome::Finished);
                }
                Err(HandshakeError::Canceled) => {
                    debug!(
                        "{} authorizer: turn canceled for user {}",
                        messenger.name(),
                        message.user_id
                    );
                    return Ok(FlowOutcome::Continue);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::handshake;
    use crate::im::testing::{message, RecordingMessenger};
    use crate::im::UserId;
    use anyhow::{bail, Result};
    use std::sync::Mutex;

    /// Authorizer whose background task asks a fixed list of questions,
    /// then optionally sends a closing notice.
    struct ScriptedAuthorizer {
        prompts: Vec<&'static str>,
        closing: Option<&'static str>,
        answers: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
    }

    impl ScriptedAuthorizer {
        fn asking(prompts: Vec<&'static str>) -> Self {
            Self {
                prompts,
                closing: None,
                answers: Arc::default(),
                fail_start: false,
            }
        }
    }

    #[async_trait]
    impl Authorizer for ScriptedAuthorizer {
        async fn is_authorized(&self, _user: UserId) -> bool {
            false
        }

        async fn start_authorization(
            &self,
            cancel: CancellationToken,
            _user: UserId,
        ) -> Result<AuthorizationChannel> {
            if self.fail_start {
                bail!("service unreachable");
            }
            let (handshake, channel) = handshake::channel(cancel);
            let prompts = self.prompts.clone();
            let closing = self.closing;
            let answers = self.answers.clone();
            tokio::spawn(async move {
                for prompt in prompts {
                    match handshake.ask(prompt).await {
                        Ok(answer) => answers.lock().unwrap().push(answer),
                        Err(_) => return,
                    }
                }
                if let Some(text) = closing {
                    let _ = handshake.notify(text).await;
                }
            });
            Ok(channel)
        }
    }

    async fn say(
        flow: &mut AuthorizerFlow,
        messenger: &RecordingMessenger,
        text: &str,
    ) -> Result<FlowOutcome, FlowError> {
        flow.handle_message(&CancellationToken::new(), &message(3, text), messenger)
            .await
    }

    #[tokio::test]
    async fn test_two_turns_then_finished() {
        let authorizer = Arc::new(ScriptedAuthorizer::asking(vec!["server?", "token?"]));
        let answers = authorizer.answers.clone();
        let mut flow = AuthorizerFlow::new(authorizer);
        let messenger = RecordingMessenger::new();

        let outcome = flow
            .start(&CancellationToken::new(), &message(3, "/auth"), &messenger)
            .await
            .unwrap();
        assert_eq!(outcome, FlowOutcome::Continue);
        assert_eq!(say(&mut flow, &messenger, "a1").await.unwrap(), FlowOutcome::Continue);
        assert_eq!(say(&mut flow, &messenger, "a2").await.unwrap(), FlowOutcome::Finished);

        assert_eq!(messenger.texts(), vec!["server?", "token?"]);
        assert_eq!(*answers.lock().unwrap(), vec!["a1", "a2"]);
        assert!(flow.channel.is_none());
    }

    #[tokio::test]
    async fn test_closing_notice_is_relayed_in_same_turn() {
        let mut authorizer = ScriptedAuthorizer::asking(vec!["user?"]);
        authorizer.closing = Some("Authorized as @me");
        let mut flow = AuthorizerFlow::new(Arc::new(authorizer));
        let messenger = RecordingMessenger::new();

        flow.start(&CancellationToken::new(), &message(3, "/auth"), &messenger)
            .await
            .unwrap();
        let outcome = say(&mut flow, &messenger, "me").await.unwrap();

        assert_eq!(outcome, FlowOutcome::Finished);
        assert_eq!(messenger.texts(), vec!["user?", "Authorized as @me"]);
    }

    #[tokio::test]
    async fn test_message_without_answer_repeats_prompt() {
        let authorizer = Arc::new(ScriptedAuthorizer::asking(vec!["server?"]));
        let answers = authorizer.answers.clone();
        let mut flow = AuthorizerFlow::new(authorizer);
        let messenger = RecordingMessenger::new();

        flow.start(&CancellationToken::new(), &message(3, "/auth"), &messenger)
            .await
            .unwrap();
        let outcome = say(&mut flow, &messenger, "/auth").await.unwrap();
        assert_eq!(outcome, FlowOutcome::Continue);
        assert_eq!(messenger.texts(), vec!["server?", "server?"]);
        assert!(answers.lock().unwrap().is_empty());

        assert_eq!(
            say(&mut flow, &messenger, "example.social").await.unwrap(),
            FlowOutcome::Finished
        );
        assert_eq!(*answers.lock().unwrap(), vec!["example.social"]);
    }

    #[tokio::test]
    async fn test_cancel_aborts_turn_silently() {
        let mut flow = AuthorizerFlow::new(Arc::new(ScriptedAuthorizer::asking(vec!["server?"])));
        let messenger = RecordingMessenger::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = flow
            .start(&cancel, &message(3, "/auth"), &messenger)
            .await
            .unwrap();
        assert_eq!(outcome, FlowOutcome::Continue);
        assert!(messenger.sent().is_empty());

        // The task saw the same cancellation and closed the channel.
        assert_eq!(say(&mut flow, &messenger, "late").await.unwrap(), FlowOutcome::Finished);
        assert!(messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_does_not_wedge() {
        let mut authorizer = ScriptedAuthorizer::asking(vec![]);
        authorizer.fail_start = true;
        let mut flow = AuthorizerFlow::new(Arc::new(authorizer));
        let messenger = RecordingMessenger::new();

        let err = flow
            .start(&CancellationToken::new(), &message(3, "/auth"), &messenger)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Authorization(_)));
        assert_eq!(say(&mut flow, &messenger, "/new").await.unwrap(), FlowOutcome::Finished);
        assert_eq!(messenger.texts(), vec![NOT_RUNNING]);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_an_error() {
        let mut flow = AuthorizerFlow::new(Arc::new(ScriptedAuthorizer::asking(vec!["server?"])));
        let messenger = RecordingMessenger::failing_on("server");

        let err = flow
            .start(&CancellationToken::new(), &message(3, "/auth"), &messenger)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Delivery { .. }));
    }
}
