//! Conversation session: one backend connection bound to one chat.
//!
//! Each session runs as its own task. The task submits user text (translated
//! into the backend language), accumulates streamed reply fragments and, on
//! end of turn, delivers the whole reply in the chat's locale. While
//! fragments arrive it keeps a debounced typing indicator going.

use crate::backend::{BackendError, Connection, ConnectionEvent, ControlSignal, OpenedConnection, Packet};
use crate::locale::LocaleStore;
use crate::transport::ChatTransport;
use crate::translator::TextTranslator;
use crate::ChatId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyState {
    Idle,
    Accumulating(String),
}

/// Reply accumulation plus typing-indicator debounce.
#[derive(Debug)]
pub struct ReplyBuffer {
    state: ReplyState,
    typing_interval: Duration,
    last_typing: Option<Instant>,
}

impl ReplyBuffer {
    pub fn new(typing_interval: Duration) -> Self {
        Self {
            state: ReplyState::Idle,
            typing_interval,
            last_typing: None,
        }
    }

    pub fn state(&self) -> &ReplyState {
        &self.state
    }

    /// Append a fragment. Returns true when a typing indicator is due.
    pub fn push_fragment(&mut self, fragment: &str, now: Instant) -> bool {
        match &mut self.state {
            ReplyState::Idle => self.state = ReplyState::Accumulating(fragment.to_string()),
            ReplyState::Accumulating(buffer) => buffer.push_str(fragment),
        }

        let due = self
            .last_typing
            .map_or(true, |last| now.saturating_duration_since(last) >= self.typing_interval);
        if due {
            self.last_typing = Some(now);
        }
        due
    }

    /// Count an indicator sent outside the fragment path toward the window.
    pub fn mark_typing(&mut self, now: Instant) {
        self.last_typing = Some(now);
    }

    /// End of turn: the trimmed reply, if any text accumulated. Always returns to idle.
    pub fn end_turn(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.state, ReplyState::Idle) {
            ReplyState::Idle => None,
            ReplyState::Accumulating(buffer) => {
                let reply = buffer.trim();
                (!reply.is_empty()).then(|| reply.to_string())
            }
        }
    }
}

/// Collaborators shared by every session.
pub struct SessionContext {
    pub translator: Arc<dyn TextTranslator>,
    pub transport: Arc<dyn ChatTransport>,
    pub locales: LocaleStore,
    pub backend_language: String,
    pub default_locale: String,
    pub typing_interval: Duration,
}

/// Sent to the router when a session's connection fails.
#[derive(Debug)]
pub struct SessionNotice {
    pub chat_id: ChatId,
    pub generation: u64,
    pub error: BackendError,
}

#[derive(Debug)]
struct UserText {
    text: String,
    locale: String,
}

/// Registry-side handle of a running session.
pub struct SessionHandle {
    generation: u64,
    connection: Arc<dyn Connection>,
    inbox: mpsc::UnboundedSender<UserText>,
}

impl SessionHandle {
    /// Start the session task over an opened backend connection.
    pub fn spawn(
        chat_id: ChatId,
        generation: u64,
        opened: OpenedConnection,
        context: Arc<SessionContext>,
        notices: mpsc::UnboundedSender<SessionNotice>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let task = SessionTask {
            chat_id,
            generation,
            connection: Arc::clone(&opened.connection),
            buffer: ReplyBuffer::new(context.typing_interval),
            context,
            notices,
        };
        tokio::spawn(task.run(inbox_rx, opened.events));

        Self {
            generation,
            connection: opened.connection,
            inbox: inbox_tx,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Submit user text written in `locale`. Fire-and-forget.
    pub fn send_text(&self, text: impl Into<String>, locale: &str) {
        let input = UserText {
            text: text.into(),
            locale: locale.to_string(),
        };
        if self.inbox.send(input).is_err() {
            debug!("Session task already stopped, dropping text");
        }
    }

    /// False once the backend connection died or the session task exited.
    pub fn is_active(&self) -> bool {
        !self.inbox.is_closed() && self.connection.is_active()
    }

    pub fn close(&self) {
        self.connection.close();
    }
}

struct SessionTask {
    chat_id: ChatId,
    generation: u64,
    connection: Arc<dyn Connection>,
    buffer: ReplyBuffer,
    context: Arc<SessionContext>,
    notices: mpsc::UnboundedSender<SessionNotice>,
}

impl SessionTask {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<UserText>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        loop {
            tokio::select! {
                input = inbox.recv() => match input {
                    Some(input) => self.submit(input).await,
                    None => break,
                },
                event = events.recv() => match event {
                    Some(ConnectionEvent::Packet(packet)) => self.on_packet(packet).await,
                    Some(ConnectionEvent::Error(error)) => {
                        self.report(error);
                        break;
                    }
                    None => break,
                },
            }
        }
        debug!("Session task for chat {} stopped", self.chat_id);
    }

    async fn submit(&mut self, input: UserText) {
        let ctx = Arc::clone(&self.context);
        let text = if input.locale == ctx.backend_language {
            input.text
        } else {
            ctx.translator
                .translate(&input.text, &input.locale, &ctx.backend_language)
                .await
        };

        self.connection.send_text(text);
        self.buffer.mark_typing(Instant::now());
        self.send_typing().await;
    }

    async fn on_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Text(fragment) => {
                if self.buffer.push_fragment(&fragment, Instant::now()) {
                    self.send_typing().await;
                }
            }
            Packet::Control(ControlSignal::InteractionEnd) => {
                if let Some(reply) = self.buffer.end_turn() {
                    self.deliver(reply).await;
                }
            }
            Packet::Control(ControlSignal::Other(kind)) => {
                debug!("Ignoring control signal {} for chat {}", kind, self.chat_id);
            }
        }
    }

    async fn deliver(&self, reply: String) {
        let ctx = &self.context;
        let locale = ctx.locales.get_or(self.chat_id, &ctx.default_locale);
        let text = if locale == ctx.backend_language {
            reply
        } else {
            ctx.translator
                .translate(&reply, &ctx.backend_language, &locale)
                .await
        };

        match ctx.transport.send_text(self.chat_id, &text).await {
            Ok(()) => info!("Sent reply to chat {}", self.chat_id),
            Err(e) => warn!(chat_id = self.chat_id, error = %e, "failed to deliver reply"),
        }
    }

    async fn send_typing(&self) {
        if let Err(e) = self.context.transport.send_typing(self.chat_id).await {
            debug!("Typing indicator for chat {} failed: {}", self.chat_id, e);
        }
    }

    fn report(&self, error: BackendError) {
        warn!(
            chat_id = self.chat_id,
            error = %error,
            "closing conversation after backend error"
        );
        let notice = SessionNotice {
            chat_id: self.chat_id,
            generation: self.generation,
            error,
        };
        if self.notices.send(notice).is_err() {
            debug!("Router gone, eviction notice for chat {} dropped", self.chat_id);
        }
    }
}
