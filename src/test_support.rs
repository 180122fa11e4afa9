//! In-memory collaborators for unit tests.

use crate::backend::{
    Backend, BackendError, Connection, ConnectionEvent, CredentialExchange, CredentialSupplier,
    OpenRequest, OpenedConnection, Packet, SessionCredential,
};
use crate::transport::ChatTransport;
use crate::translator::TextTranslator;
use crate::ChatId;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Text(ChatId, String),
    Typing(ChatId),
}

pub struct FakeTransport {
    calls: mpsc::UnboundedSender<TransportCall>,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { calls: tx }), rx)
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()> {
        let _ = self.calls.send(TransportCall::Text(chat_id, text.to_string()));
        Ok(())
    }

    async fn send_typing(&self, chat_id: ChatId) -> Result<()> {
        let _ = self.calls.send(TransportCall::Typing(chat_id));
        Ok(())
    }
}

pub async fn recv_call(calls: &mut mpsc::UnboundedReceiver<TransportCall>) -> TransportCall {
    tokio::time::timeout(Duration::from_secs(5), calls.recv())
        .await
        .expect("transport call within timeout")
        .expect("transport channel open")
}

/// Tags text with the direction instead of translating it.
#[derive(Default)]
pub struct FakeTranslator {
    calls: Mutex<Vec<(String, String, String)>>,
}

impl FakeTranslator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextTranslator for FakeTranslator {
    async fn translate(&self, text: &str, source: &str, target: &str) -> String {
        self.calls
            .lock()
            .unwrap()
            .push((text.to_string(), source.to_string(), target.to_string()));
        format!("[{}->{}] {}", source, target, text)
    }
}

pub struct FakeConnection {
    events: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
    sent: Mutex<Vec<String>>,
    active: AtomicBool,
    closes: AtomicUsize,
}

impl FakeConnection {
    pub fn emit(&self, packet: Packet) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(ConnectionEvent::Packet(packet));
        }
    }

    pub fn fail(&self, error: BackendError) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(events) = self.events.lock().unwrap().take() {
            let _ = events.send(ConnectionEvent::Error(error));
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Connection for FakeConnection {
    fn send_text(&self, text: String) {
        self.sent.lock().unwrap().push(text);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        self.events.lock().unwrap().take();
    }
}

pub struct OpenedFake {
    pub connection: Arc<FakeConnection>,
    pub chat_id: ChatId,
    pub user_name: Option<String>,
    pub credentials: Arc<dyn CredentialSupplier>,
}

#[derive(Default)]
pub struct FakeBackend {
    opened: Mutex<Vec<OpenedFake>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn connection(&self, index: usize) -> Arc<FakeConnection> {
        Arc::clone(&self.opened.lock().unwrap()[index].connection)
    }

    pub fn opened_for(&self, index: usize) -> (ChatId, Option<String>) {
        let opened = self.opened.lock().unwrap();
        (opened[index].chat_id, opened[index].user_name.clone())
    }

    pub fn credentials(&self, index: usize) -> Arc<dyn CredentialSupplier> {
        Arc::clone(&self.opened.lock().unwrap()[index].credentials)
    }
}

impl Backend for FakeBackend {
    fn open(&self, request: OpenRequest) -> OpenedConnection {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(FakeConnection {
            events: Mutex::new(Some(tx)),
            sent: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
        });

        self.opened.lock().unwrap().push(OpenedFake {
            connection: Arc::clone(&connection),
            chat_id: request.chat_id,
            user_name: request.user_name,
            credentials: request.credentials,
        });

        OpenedConnection {
            connection,
            events: rx,
        }
    }
}

/// Hands out a new session id on every exchange, like a forgetful backend.
#[derive(Default)]
pub struct FakeExchange {
    issued: AtomicUsize,
}

impl FakeExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CredentialExchange for FakeExchange {
    async fn exchange(&self, _session_id: Option<&str>) -> Result<SessionCredential> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(SessionCredential {
            session_id: format!("session-{}", n),
            token: format!("token-{}", n),
            expiration_time: Utc::now() + chrono::Duration::hours(1),
            kind: "Bearer".to_string(),
        })
    }
}

struct StaticCredentials;

#[async_trait]
impl CredentialSupplier for StaticCredentials {
    async fn credential(&self) -> Result<SessionCredential> {
        Ok(SessionCredential {
            session_id: "static".to_string(),
            token: "static".to_string(),
            expiration_time: Utc::now() + chrono::Duration::hours(1),
            kind: "Bearer".to_string(),
        })
    }
}

pub fn static_credentials() -> Arc<dyn CredentialSupplier> {
    Arc::new(StaticCredentials)
}
