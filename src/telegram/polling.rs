//! Long-polling update loop.

use super::{update_to_event, TelegramClient};
use crate::transport::ChatEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

const MAX_BACKOFF_SECS: u64 = 60;

/// Poll `getUpdates` forever, forwarding chat events until the receiver is dropped.
///
/// Failures back off exponentially from 1s up to 60s; a successful poll
/// resets the delay.
pub fn spawn_polling(client: Arc<TelegramClient>, events: mpsc::Sender<ChatEvent>) -> JoinHandle<()> {
    info!("Telegram transport starting long polling");

    tokio::spawn(async move {
        let mut offset: Option<i64> = None;
        let mut backoff_secs: u64 = 1;

        loop {
            let updates = match client.get_updates(offset).await {
                Ok(updates) => updates,
                Err(e) => {
                    error!("Telegram poll failed (retry in {}s): {:#}", backoff_secs, e);
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }
            };
            backoff_secs = 1;

            if let Some(last) = updates.last() {
                offset = Some(last.update_id + 1);
            }

            for event in updates.into_iter().filter_map(update_to_event) {
                if events.send(event).await.is_err() {
                    info!("Chat event receiver dropped, stopping poll");
                    return;
                }
            }
        }
    })
}
