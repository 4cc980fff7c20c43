use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use copydesk::{
    api::ApiClient,
    config::{derive_ws_url, Settings},
    dashboard::{self, DashboardState},
    push,
    reconciler::LiveStore,
    store::SqliteStore,
    sync,
};

#[derive(Debug, Parser)]
#[command(name = "copydesk", version)]
struct Cli {
    /// Override API_BASE_URL
    #[arg(long)]
    api_base_url: Option<String>,

    /// Run without the local dashboard
    #[arg(long)]
    no_dashboard: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(url) = cli.api_base_url {
        settings.api_base_url = url.trim().trim_end_matches('/').to_string();
        if std::env::var("PUSH_WS_URL").map(|v| v.trim().is_empty()).unwrap_or(true) {
            settings.push_ws_url = derive_ws_url(&settings.api_base_url);
        }
        settings.validate()?;
    }
    if cli.no_dashboard {
        settings.dashboard_enabled = false;
    }

    let store = SqliteStore::new(&settings.sqlite_path)?;
    store.init_db()?;

    log::info!(
        "app.start api={} push={} sqlite={} dashboard={}",
        settings.api_base_url,
        settings.push_ws_url,
        store.path(),
        settings.dashboard_enabled
    );

    let (channel, transport) = push::ws_channel(settings.clone());
    let live = LiveStore::new(Arc::new(channel));
    transport.spawn(live.clone(), store.clone());

    let api = ApiClient::new(&settings)?;

    if settings.dashboard_enabled {
        let state = DashboardState {
            settings: settings.clone(),
            store: store.clone(),
            live: live.clone(),
            api: api.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = dashboard::serve_dashboard(state).await {
                log::error!("dashboard.error {}", e);
            }
        });
    }

    // Keep the account feed open for the process lifetime so snapshots track
    // live pushes, not just the periodic refetch.
    let feed = live.listen(|event| {
        log::trace!("push.event name={}", event.name());
    });

    let result = tokio::select! {
        r = sync::run(settings, store, live.clone(), api) => r,
        _ = tokio::signal::ctrl_c() => {
            log::info!("app.shutdown signal=ctrl_c");
            Ok(())
        }
    };

    drop(feed);
    live.shutdown();
    result
}
