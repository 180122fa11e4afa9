//! HTTP implementation of the backend contract.
//!
//! Each submitted text is one `:sendText` request whose response body is a
//! server-sent-event stream of packets. Requests for a connection are issued
//! one at a time by a worker task, so packets reach the event channel in
//! delivery order.

use super::{
    Backend, BackendError, Capabilities, Connection, ConnectionEvent, ControlSignal,
    CredentialSupplier, OpenRequest, OpenedConnection, Packet, SessionCredential,
};
use crate::ChatId;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Refresh a session credential this long before it expires.
const CREDENTIAL_MARGIN_SECS: i64 = 60;

pub struct HttpBackend {
    client: reqwest::Client,
    send_text_url: String,
}

impl HttpBackend {
    pub fn new(client: reqwest::Client, api_url: &str, scene: &str) -> Self {
        Self {
            client,
            send_text_url: format!("{}/v1/{}:sendText", api_url.trim_end_matches('/'), scene),
        }
    }
}

impl Backend for HttpBackend {
    fn open(&self, request: OpenRequest) -> OpenedConnection {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (texts_tx, texts_rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));

        let worker = ConnectionWorker {
            client: self.client.clone(),
            url: self.send_text_url.clone(),
            chat_id: request.chat_id,
            user_name: request.user_name,
            capabilities: request.capabilities,
            credentials: request.credentials,
            credential: None,
            active: Arc::clone(&active),
            events: events_tx,
        };
        let task = tokio::spawn(worker.run(texts_rx));

        OpenedConnection {
            connection: Arc::new(HttpConnection {
                texts: texts_tx,
                active,
                task: task.abort_handle(),
            }),
            events: events_rx,
        }
    }
}

struct HttpConnection {
    texts: mpsc::UnboundedSender<String>,
    active: Arc<AtomicBool>,
    task: AbortHandle,
}

impl Connection for HttpConnection {
    fn send_text(&self, text: String) {
        if !self.is_active() || self.texts.send(text).is_err() {
            debug!("Dropping text for inactive backend connection");
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendTextRequest<'a> {
    session_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<UserInfo<'a>>,
    capabilities: Capabilities,
}

#[derive(Debug, Serialize)]
struct UserInfo<'a> {
    name: &'a str,
}

struct ConnectionWorker {
    client: reqwest::Client,
    url: String,
    chat_id: ChatId,
    user_name: Option<String>,
    capabilities: Capabilities,
    credentials: Arc<dyn CredentialSupplier>,
    credential: Option<SessionCredential>,
    active: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionWorker {
    async fn run(mut self, mut texts: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = texts.recv().await {
            if let Err(e) = self.submit(&text).await {
                warn!("Backend connection for chat {} failed: {}", self.chat_id, e);
                self.active.store(false, Ordering::SeqCst);
                let _ = self.events.send(ConnectionEvent::Error(e));
                return;
            }
        }
    }

    async fn current_credential(&mut self) -> Result<SessionCredential, BackendError> {
        let margin = chrono::Duration::seconds(CREDENTIAL_MARGIN_SECS);
        if let Some(credential) = &self.credential {
            if !credential.expires_within(margin, Utc::now()) {
                return Ok(credential.clone());
            }
        }

        let credential = self
            .credentials
            .credential()
            .await
            .map_err(|e| BackendError::Credentials(format!("{:#}", e)))?;
        self.credential = Some(credential.clone());
        Ok(credential)
    }

    async fn submit(&mut self, text: &str) -> Result<(), BackendError> {
        let credential = self.current_credential().await?;
        let request = SendTextRequest {
            session_id: &credential.session_id,
            text,
            user: self.user_name.as_deref().map(|name| UserInfo { name }),
            capabilities: self.capabilities,
        };

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::AUTHORIZATION, credential.authorization())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body });
        }

        let mut lines = LineBuffer::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            for line in lines.push(&chunk?) {
                if let Some(packet) = parse_sse_line(&line) {
                    if self.events.send(ConnectionEvent::Packet(packet)).is_err() {
                        return Ok(());
                    }
                }
            }
        }
        if let Some(packet) = lines.finish().as_deref().and_then(parse_sse_line) {
            let _ = self.events.send(ConnectionEvent::Packet(packet));
        }

        Ok(())
    }
}

/// Splits a byte stream into lines; a multi-byte character may straddle chunks.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&std::mem::take(&mut self.pending))
            .trim()
            .to_string();
        (!rest.is_empty()).then_some(rest)
    }
}

#[derive(Debug, Deserialize)]
struct WirePacket {
    text: Option<WireText>,
    control: Option<WireControl>,
}

#[derive(Debug, Deserialize)]
struct WireText {
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireControl {
    #[serde(rename = "type")]
    kind: String,
}

/// Parse one `data: {...}` line into a packet. Anything else is `None`.
fn parse_sse_line(line: &str) -> Option<Packet> {
    let json = line.strip_prefix("data:")?.trim_start();
    let packet: WirePacket = serde_json::from_str(json).ok()?;

    if let Some(control) = packet.control {
        return Some(Packet::Control(match control.kind.as_str() {
            "INTERACTION_END" => ControlSignal::InteractionEnd,
            _ => ControlSignal::Other(control.kind),
        }));
    }

    packet
        .text
        .map(|t| t.text)
        .filter(|t| !t.is_empty())
        .map(Packet::Text)
}
