use anyhow::{Context, Result};
use chat_relay::backend::{HttpBackend, TokenEndpoint};
use chat_relay::config::{Config, TransportMode};
use chat_relay::iam::{IamTokenProvider, ServiceAccountKey};
use chat_relay::locale::LocaleStore;
use chat_relay::metrics::RelayMetrics;
use chat_relay::router::Router;
use chat_relay::session::SessionContext;
use chat_relay::telegram::{self, TelegramClient, WebhookState};
use chat_relay::translator::{Glossary, YandexTranslator};
use chat_relay::transport::ChatEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Inbound chat events buffered between the transport and the router.
const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored when absent)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chat_relay=info".parse()?),
        )
        .init();

    info!("Starting chat relay");

    let config = Config::from_env()?;
    let metrics = Arc::new(RelayMetrics::new());
    let http = reqwest::Client::new();

    // Translation credentials: the first exchange must succeed
    let key = ServiceAccountKey::load(&config.yandex_key_file)?;
    let iam = Arc::new(IamTokenProvider::new(
        http.clone(),
        key,
        &config.yandex_iam_url,
        Arc::clone(&metrics),
    ));
    iam.init().await?;
    let mut scheduler = Arc::clone(&iam)
        .start_refresh_schedule(config.iam_refresh_interval())
        .await?;

    let glossary = Glossary::load_if_exists(&config.glossary_file)?;
    let translator = YandexTranslator::new(
        http.clone(),
        &config.yandex_translate_url,
        iam.token(),
        Arc::clone(&metrics),
    )
    .with_folder_id(config.yandex_folder_id.clone())
    .with_glossary(glossary);

    let bot = Arc::new(TelegramClient::new(
        http.clone(),
        &config.telegram_api_url,
        &config.telegram_bot_token,
    ));

    let backend = HttpBackend::new(http.clone(), &config.inworld_api_url, &config.inworld_scene);
    let exchange = TokenEndpoint::new(
        http.clone(),
        &config.inworld_api_url,
        &config.inworld_key,
        &config.inworld_secret,
        &config.inworld_scene,
    );

    let context = Arc::new(SessionContext {
        translator: Arc::new(translator),
        transport: bot.clone(),
        locales: LocaleStore::new(),
        backend_language: config.backend_language.clone(),
        default_locale: config.default_user_locale.clone(),
        typing_interval: config.typing_interval(),
    });
    let router = Router::new(Arc::new(backend), Arc::new(exchange), context, Arc::clone(&metrics))
        .with_greeting(config.greeting_text.clone());

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let (router_stop_tx, router_stop_rx) = oneshot::channel::<()>();
    let router_task = tokio::spawn(router.run(events_rx, async move {
        let _ = router_stop_rx.await;
    }));

    let intake = start_intake(&config, bot, events_tx, Arc::clone(&metrics)).await?;

    shutdown_signal().await;
    info!("Shutting down");

    // Stop intake first so no new events reach the router
    intake.stop().await;
    let _ = router_stop_tx.send(());
    if let Err(e) = router_task.await {
        error!("Router task failed: {}", e);
    }

    if let Err(e) = scheduler.shutdown().await {
        error!("Failed to stop IAM refresh scheduler: {}", e);
    }

    info!("Chat relay stopped");
    Ok(())
}

enum Intake {
    Polling(JoinHandle<()>),
    Webhook {
        stop: oneshot::Sender<()>,
        server: JoinHandle<Result<()>>,
    },
}

impl Intake {
    async fn stop(self) {
        match self {
            Self::Polling(poller) => poller.abort(),
            Self::Webhook { stop, server } => {
                let _ = stop.send(());
                match server.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Webhook server error: {:#}", e),
                    Err(e) => error!("Webhook server task failed: {}", e),
                }
            }
        }
    }
}

async fn start_intake(
    config: &Config,
    client: Arc<TelegramClient>,
    events: mpsc::Sender<ChatEvent>,
    metrics: Arc<RelayMetrics>,
) -> Result<Intake> {
    match config.transport_mode {
        TransportMode::Polling => Ok(Intake::Polling(telegram::spawn_polling(client, events))),
        TransportMode::Webhook => {
            let secret = config
                .telegram_webhook_secret
                .as_deref()
                .context("TELEGRAM_WEBHOOK_SECRET must be set in webhook mode")?;

            if let Some(url) = &config.webhook_url {
                client.set_webhook(url, secret).await?;
                info!("Webhook registered at {}", url);
            }

            let (stop, stop_rx) = oneshot::channel::<()>();
            let state = WebhookState::new(events, secret, metrics);
            let server = tokio::spawn(telegram::serve(config.port, state, async move {
                let _ = stop_rx.await;
            }));

            Ok(Intake::Webhook { stop, server })
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
