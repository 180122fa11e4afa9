//! Chat → session mapping.
//!
//! Owned by the router task; all access is sequential, so lookups and lazy
//! creation cannot race. Every session gets a fresh generation number so an
//! error reported by a replaced session never evicts its successor.

use crate::session::SessionHandle;
use crate::ChatId;
use std::collections::HashMap;
use tracing::info;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<ChatId, SessionHandle>,
    next_generation: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chat_id: ChatId) -> Option<&SessionHandle> {
        self.sessions.get(&chat_id)
    }

    /// Existing session for the chat, or one built by `create` with a new generation.
    pub fn get_or_create<F>(&mut self, chat_id: ChatId, create: F) -> &SessionHandle
    where
        F: FnOnce(u64) -> SessionHandle,
    {
        let next_generation = &mut self.next_generation;
        self.sessions.entry(chat_id).or_insert_with(|| {
            *next_generation += 1;
            info!("Create conversation with chat {}", chat_id);
            create(*next_generation)
        })
    }

    /// Remove the chat's session if it is still `generation`. Returns true if removed.
    pub fn evict(&mut self, chat_id: ChatId, generation: u64) -> bool {
        match self.sessions.get(&chat_id) {
            Some(handle) if handle.generation() == generation => {
                self.sessions.remove(&chat_id);
                true
            }
            _ => false,
        }
    }

    /// Close every active session and empty the registry. Returns how many were closed.
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for (chat_id, handle) in self.sessions.drain() {
            if handle.is_active() {
                handle.close();
                closed += 1;
                info!("Closed conversation with chat {}", chat_id);
            }
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
