use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use teloxide::prelude::*;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::blogging::authorize::AuthorizerFlow;
use crate::blogging::posting::PostingFlow;
use crate::blogging::Authorizer;
use crate::config::TelegramConfig;
use crate::im::flow::{FlowScheduler, SchedulerFactory};
use crate::im::telegram::{self, TelegramMessenger};
use crate::im::{Message as ChatMessage, Messenger, UserId};

pub const POSTING_FLOW: &str = "microblog_post";

/// Command list shown for `/help` and `/start`.
pub fn help_text(platforms: &[&str]) -> String {
    let mut text = String::from(
        "Hello! I cross-post what you write here to your microblogs.\n\n\
         Commands:\n\
         /new [langs] - Start a new post (e.g. /new en,es)\n\
         /send - Publish the current post\n\
         /cancel - Discard the current post\n",
    );
    for name in platforms {
        text.push_str(&format!("/{name}_auth - Link your {name} account\n"));
    }
    text
}

/// Factory registering the posting flow and one authorization flow per
/// platform. Every user's posting flow shares `posting`'s draft store.
pub fn scheduler_factory(
    posting: PostingFlow,
    authorizers: Vec<(String, Arc<dyn Authorizer>)>,
) -> SchedulerFactory {
    Arc::new(move |user: UserId| -> Result<FlowScheduler> {
        let mut scheduler = FlowScheduler::new(user);
        for (name, authorizer) in &authorizers {
            let flow_name = format!("{name}_auth");
            let command = format!("/{flow_name}");
            scheduler.register_flow(
                AuthorizerFlow::new(authorizer.clone()),
                &flow_name,
                &[command.as_str()],
            )?;
        }
        scheduler.register_flow(posting.clone(), POSTING_FLOW, &["/new"])?;
        Ok(scheduler)
    })
}

/// Per-user schedulers, created on first contact.
pub struct Sessions {
    factory: SchedulerFactory,
    help: String,
    schedulers: Mutex<HashMap<UserId, Arc<Mutex<FlowScheduler>>>>,
}

impl Sessions {
    pub fn new(factory: SchedulerFactory, help: String) -> Self {
        Self {
            factory,
            help,
            schedulers: Mutex::new(HashMap::new()),
        }
    }

    async fn scheduler(&self, user: UserId) -> Result<Arc<Mutex<FlowScheduler>>> {
        let mut schedulers = self.schedulers.lock().await;
        if let Some(scheduler) = schedulers.get(&user) {
            return Ok(scheduler.clone());
        }
        let scheduler = (self.factory)(user)
            .with_context(|| format!("Failed to build flow scheduler for user {}", user))?;
        info!("Created flow scheduler for user {}", user);
        let scheduler = Arc::new(Mutex::new(scheduler));
        schedulers.insert(user, scheduler.clone());
        Ok(scheduler)
    }

    /// Route one message through its sender's scheduler. The per-user lock
    /// is held for the whole call, so a user's messages never interleave.
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        message: &ChatMessage,
        messenger: &dyn Messenger,
    ) -> Result<()> {
        let scheduler = self.scheduler(message.user_id).await?;
        let mut scheduler = scheduler.lock().await;

        if scheduler.current_flow().is_none() && is_help(&message.text) {
            messenger.send_message(&message.reply(self.help.as_str())).await?;
            return Ok(());
        }

        if let Err(e) = scheduler.handle_message(cancel, message, messenger).await {
            error!("Error handling message from user {}: {:#}", message.user_id, e);
            messenger
                .send_message(&message.reply(format!("Error: {}", e)))
                .await?;
        }
        Ok(())
    }
}

fn is_help(text: &str) -> bool {
    matches!(text.split(' ').next(), Some("/help" | "/start"))
}

/// Start the Telegram bot and serve until `cancel` fires.
pub async fn run(
    config: &TelegramConfig,
    sessions: Arc<Sessions>,
    cancel: CancellationToken,
) -> Result<()> {
    let bot = Bot::new(&config.bot_token);
    let messenger = Arc::new(TelegramMessenger::new(bot.clone()));

    info!("Starting Telegram bot...");

    let allowed_users = config.allowed_user_ids.clone();

    let handler = Update::filter_message()
        .filter_map(move |msg: Message| {
            let user = msg.from.as_ref()?;
            if allowed_users.contains(&user.id.0) {
                Some(msg)
            } else {
                None
            }
        })
        .endpoint(handle_message);

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![sessions, messenger, cancel.clone()])
        .default_handler(|upd| async move {
            warn!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("bot"))
        .build();

    let shutdown = dispatcher.shutdown_token();
    tokio::spawn(async move {
        cancel.cancelled().await;
        info!("Shutting down Telegram bot...");
        if let Ok(done) = shutdown.shutdown() {
            done.await;
        }
    });

    dispatcher.dispatch().await;
    Ok(())
}

async fn handle_message(
    bot: Bot,
    msg: Message,
    sessions: Arc<Sessions>,
    messenger: Arc<TelegramMessenger>,
    cancel: CancellationToken,
) -> ResponseResult<()> {
    let message = match telegram::from_telegram(&bot, &msg).await {
        Ok(Some(message)) => message,
        Ok(None) => return Ok(()),
        Err(e) => {
            error!("Failed to read message in chat {}: {:#}", msg.chat.id, e);
            bot.send_message(msg.chat.id, format!("Error: {}", e))
                .await?;
            return Ok(());
        }
    };

    info!(
        "Message from user {} ({} image(s)): {}",
        message.user_id,
        message.images.len(),
        message.text
    );

    if let Err(e) = sessions
        .dispatch(&cancel, &message, messenger.as_ref())
        .await
    {
        error!("Error processing message: {:#}", e);
    }

    Ok(())
}
