use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tugo_client::config::Config;
use tugo_client::realtime::{Connector, SockJsConnector};
use tugo_client::session::{RefreshSignals, SessionClient};
use tugo_client::storage::{FileStore, KeyValueStore};
use tugo_client::NotesSession;
use tugo_common::NoteMessage;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let Some(user_id) = config.user_id else {
        tracing::error!("TUGO_USER_ID is required to listen for notes");
        std::process::exit(2);
    };

    // Shared with every other client process on this machine.
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(config.storage_path.clone()));

    let client = SessionClient::builder(config.base_url.clone())
        .store(store)
        .signals(RefreshSignals::new())
        .settings(config.refresh)
        .build()
        .expect("failed to build HTTP client");

    let connector: Arc<dyn Connector> = Arc::new(
        SockJsConnector::new(config.base_url.clone(), config.transport)
            .with_cookies(client.cookie_jar()),
    );

    tracing::info!(
        base_url = %config.base_url,
        user_id,
        storage = %config.storage_path.display(),
        "tugo-notes configured"
    );

    let session = NotesSession::new(client, connector);
    session
        .store()
        .set_global_message_callback(Some(Arc::new(|note: NoteMessage| {
            tracing::info!(
                room_id = note.room_id,
                from = %note.sender_nickname,
                content = %note.content,
                "new note"
            );
        })));

    let mut unread = session.store().watch_unread_count();
    let watcher = tokio::spawn(async move {
        while unread.changed().await.is_ok() {
            let count = *unread.borrow_and_update();
            tracing::info!(count, "unread notes");
        }
    });

    if let Err(err) = session.start(user_id).await {
        tracing::error!(%err, "failed to start notes session");
        std::process::exit(1);
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for ctrl-c");
    }

    tracing::info!("shutting down");
    session.shutdown().await;
    watcher.abort();
}
