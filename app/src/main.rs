use std::future::Future;
use std::sync::Arc;

use quarry_adapters::default_router;
use quarry_core::backend::ConnectionBackend;
use quarry_core::connections::Connection;
use quarry_core::settings::Settings;
use quarry_core::state::{AppState, StatePaths};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

fn init_tracing(fallback_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback_filter));
    // a subscriber may already be installed (tests)
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init();
}

/// Matches `key` against connection ids first, then names.
fn find_connection(connections: &[Connection], key: &str) -> Option<Uuid> {
    let by_id = Uuid::parse_str(key).ok();
    connections
        .iter()
        .find(|connection| Some(connection.id) == by_id)
        .or_else(|| connections.iter().find(|connection| connection.name == key))
        .map(|connection| connection.id)
}

async fn run_app(
    paths: &StatePaths,
    settings: &Settings,
    backend: Arc<dyn ConnectionBackend>,
    target: Option<&str>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::load(paths, settings, backend);
    let forwarder = state.spawn_event_forwarder();

    if let Some(key) = target {
        let Some(id) = find_connection(&state.connections(), key) else {
            state.shutdown();
            return Err(format!("no connection named or identified by {key:?}").into());
        };
        if let Err(error) = state.connect(id).await {
            tracing::warn!(connection_id = %id, %error, "initial connect failed; health monitor will retry");
        }
        state.set_active_connection(Some(id));
    }

    shutdown.await;
    state.shutdown();
    forwarder.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let paths = StatePaths::default_paths()?;
    let settings = Settings::load_or_default(&paths.settings);
    init_tracing(&settings.logging.filter);

    let target = std::env::args().nth(1);
    run_app(
        &paths,
        &settings,
        Arc::new(default_router()),
        target.as_deref(),
        async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "failed to listen for ctrl-c");
            }
        },
    )
    .await
}
