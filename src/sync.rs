use std::time::Duration;

use anyhow::Result;
use tokio::time::MissedTickBehavior;

use crate::{
    api::{with_retry, ApiClient},
    config::Settings,
    reconciler::LiveStore,
    store::SqliteStore,
    utils::now_ts,
};

pub async fn run(settings: Settings, store: SqliteStore, live: LiveStore, api: ApiClient) -> Result<()> {
    let mut accounts_tick = tokio::time::interval(Duration::from_secs(settings.accounts_refresh_secs));
    accounts_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut subscription_tick =
        tokio::time::interval(Duration::from_secs(settings.subscription_refresh_secs));
    subscription_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut snap_tick = tokio::time::interval(Duration::from_secs(settings.snapshot_interval_secs));
    snap_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    log::info!(
        "sync.start accounts_every={}s subscription_every={}s snapshot_every={}s",
        settings.accounts_refresh_secs,
        settings.subscription_refresh_secs,
        settings.snapshot_interval_secs
    );

    loop {
        tokio::select! {
            _ = accounts_tick.tick() => {
                refresh_accounts(&settings, &store, &live, &api).await;
            }
            _ = subscription_tick.tick() => {
                refresh_subscription(&settings, &store, &live, &api).await;
            }
            _ = live.subscription_invalidated() => {
                log::info!("sync.subscription.invalidated");
                refresh_subscription(&settings, &store, &live, &api).await;
                subscription_tick.reset();
            }
            _ = snap_tick.tick() => {
                if let Err(e) = persist_snapshots(&settings, &store, &live, now_ts()) {
                    log::warn!("sync.snapshot.failed err={}", e);
                }
            }
        }
    }
}

fn retry_base(settings: &Settings) -> Duration {
    Duration::from_millis(settings.fetch_retry_base_ms)
}

pub async fn refresh_accounts(settings: &Settings, store: &SqliteStore, live: &LiveStore, api: &ApiClient) {
    let ticket = live.begin_accounts_fetch();
    match with_retry("sync.accounts", settings.fetch_max_retries, retry_base(settings), || {
        api.get_accounts()
    })
    .await
    {
        Ok(fetched) => {
            let n = fetched.len();
            let list = live.complete_accounts_fetch(ticket, fetched);
            log::info!("sync.accounts.fetched count={} cached={}", n, list.len());
            store
                .upsert_runtime_status(
                    "sync.accounts",
                    "ok",
                    &format!("fetched {n}"),
                    None,
                    now_ts(),
                )
                .ok();
        }
        Err(e) => {
            // The previous list stays in place.
            live.abandon_accounts_fetch(ticket);
            log::error!("sync.accounts.failed err={}", e);
            store
                .upsert_runtime_status(
                    "sync.accounts",
                    "error",
                    "fetch_failed",
                    Some(&e.to_string()),
                    now_ts(),
                )
                .ok();
        }
    }
}

pub async fn refresh_subscription(
    settings: &Settings,
    store: &SqliteStore,
    live: &LiveStore,
    api: &ApiClient,
) {
    match with_retry(
        "sync.subscription",
        settings.fetch_max_retries,
        retry_base(settings),
        || api.get_subscription(),
    )
    .await
    {
        Ok(snapshot) => {
            let ts = now_ts();
            let tier = snapshot.subscription_tier;
            match serde_json::to_value(&snapshot) {
                Ok(payload) => {
                    if let Err(e) = store.insert_subscription_snapshot(ts, &payload) {
                        log::warn!("sync.subscription.persist_failed err={}", e);
                    }
                }
                Err(e) => log::warn!("sync.subscription.encode_failed err={}", e),
            }
            live.set_subscription(snapshot);
            log::info!("sync.subscription.fetched tier={}", tier.as_str());
            store
                .upsert_runtime_status("sync.subscription", "ok", tier.as_str(), None, ts)
                .ok();
        }
        Err(e) => {
            log::error!("sync.subscription.failed err={}", e);
            store
                .upsert_runtime_status(
                    "sync.subscription",
                    "error",
                    "fetch_failed",
                    Some(&e.to_string()),
                    now_ts(),
                )
                .ok();
        }
    }
}

/// Write the cached accounts as one snapshot batch and drop rows past retention.
pub fn persist_snapshots(settings: &Settings, store: &SqliteStore, live: &LiveStore, ts: f64) -> Result<usize> {
    let accounts = live.accounts();
    let n = store.insert_account_snapshots(ts, accounts.iter().map(|a| a.as_ref()))?;
    let cutoff = ts - (settings.snapshot_retention_hours as f64) * 3600.0;
    let pruned = store.prune_snapshots(cutoff)?;
    if pruned > 0 {
        log::debug!("sync.snapshot.pruned rows={}", pruned);
    }
    Ok(n)
}
