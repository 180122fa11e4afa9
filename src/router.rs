//! Message router.
//!
//! Runs as a single task: inbound chat events, session error notices and the
//! shutdown signal are handled one at a time, which is what makes lazy session
//! creation idempotent without any locking around the registry.

use crate::backend::{
    Backend, Capabilities, ChatCredentials, CredentialExchange, OpenRequest, SessionIdCache,
};
use crate::locale::LocaleDetector;
use crate::metrics::RelayMetrics;
use crate::registry::SessionRegistry;
use crate::session::{SessionContext, SessionHandle, SessionNotice};
use crate::transport::{ChatEvent, ChatInfo, ChatKind};
use crate::ChatId;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEFAULT_GREETING: &str = "Hello! Please introduce yourself";

pub struct Router {
    registry: SessionRegistry,
    backend: Arc<dyn Backend>,
    exchange: Arc<dyn CredentialExchange>,
    session_ids: SessionIdCache,
    detector: LocaleDetector,
    context: Arc<SessionContext>,
    greeting: String,
    metrics: Arc<RelayMetrics>,
    notices_tx: mpsc::UnboundedSender<SessionNotice>,
    notices_rx: mpsc::UnboundedReceiver<SessionNotice>,
}

impl Router {
    pub fn new(
        backend: Arc<dyn Backend>,
        exchange: Arc<dyn CredentialExchange>,
        context: Arc<SessionContext>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        Self {
            registry: SessionRegistry::new(),
            backend,
            exchange,
            session_ids: SessionIdCache::new(),
            detector: LocaleDetector::default(),
            context,
            greeting: DEFAULT_GREETING.to_string(),
            metrics,
            notices_tx,
            notices_rx,
        }
    }

    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = greeting.into();
        self
    }

    pub fn with_detector(mut self, detector: LocaleDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Session ids issued so far, keyed by chat.
    pub fn session_ids(&self) -> &SessionIdCache {
        &self.session_ids
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Route one inbound chat event to its session.
    pub fn handle_event(&mut self, event: ChatEvent) {
        let chat = event.chat();
        if chat.kind != ChatKind::Direct {
            debug!("Ignoring event from non-direct chat {}", chat.id);
            return;
        }

        match event {
            ChatEvent::Start(chat) => {
                info!("Conversation start requested by chat {}", chat.id);
                let greeting = self.greeting.clone();
                let language = self.context.backend_language.clone();
                self.session_for(&chat).send_text(greeting, &language);
            }
            ChatEvent::Text(chat, text) => {
                let locale = self.resolve_locale(chat.id, &text);
                self.session_for(&chat).send_text(text, &locale);
            }
        }
    }

    /// Evict the session that reported an error, unless it was already replaced.
    pub fn handle_notice(&mut self, notice: SessionNotice) {
        if self.registry.evict(notice.chat_id, notice.generation) {
            self.metrics.record_session_evicted();
            warn!(
                chat_id = notice.chat_id,
                error = %notice.error,
                "conversation evicted; next message starts a new one"
            );
        } else {
            debug!(
                "Stale notice for chat {} (generation {}) ignored",
                notice.chat_id, notice.generation
            );
        }
    }

    /// Handle every notice already queued. Returns how many were handled.
    pub fn drain_notices(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(notice) = self.notices_rx.try_recv() {
            self.handle_notice(notice);
            handled += 1;
        }
        handled
    }

    /// Close every active session and log the final counters.
    pub fn shutdown(&mut self) {
        let closed = self.registry.close_all();
        info!("Closed {} active conversation(s)", closed);
        info!("{}", self.metrics.report().format());
    }

    /// Serve events until the channel closes or `shutdown` resolves, then shut down.
    pub async fn run<S>(mut self, mut events: mpsc::Receiver<ChatEvent>, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;

                Some(notice) = self.notices_rx.recv() => self.handle_notice(notice),
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping router");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("Chat event stream closed, stopping router");
                        break;
                    }
                },
            }
        }
        self.shutdown();
    }

    fn resolve_locale(&self, chat_id: ChatId, text: &str) -> String {
        let locales = &self.context.locales;
        match self.detector.detect(text) {
            Some(code) => {
                locales.remember(chat_id, code);
                code.to_string()
            }
            None => locales.get_or(chat_id, &self.context.default_locale),
        }
    }

    fn session_for(&mut self, chat: &ChatInfo) -> &SessionHandle {
        // A dead session may still be registered while its notice is in flight
        if let Some(stale) = self.registry.get(chat.id).filter(|h| !h.is_active()) {
            let generation = stale.generation();
            if self.registry.evict(chat.id, generation) {
                self.metrics.record_session_evicted();
                warn!(
                    chat_id = chat.id,
                    "conversation no longer active; starting a new one"
                );
            }
        }

        let backend = &self.backend;
        let exchange = &self.exchange;
        let session_ids = &self.session_ids;
        let context = &self.context;
        let metrics = &self.metrics;
        let notices = &self.notices_tx;

        self.registry.get_or_create(chat.id, |generation| {
            let credentials = ChatCredentials::new(chat.id, Arc::clone(exchange), session_ids.clone());
            let opened = backend.open(OpenRequest {
                chat_id: chat.id,
                user_name: chat.user_name.clone(),
                capabilities: Capabilities::text_only(),
                credentials: Arc::new(credentials),
            });
            metrics.record_session_created();
            SessionHandle::spawn(chat.id, generation, opened, Arc::clone(context), notices.clone())
        })
    }
}
