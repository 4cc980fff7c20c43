use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tower_http::cors::CorsLayer;

use crate::{
    account::Account,
    api::{AddonChange, ApiClient, ApiError, ClientDiscount, HistoryQuery, SpecialDiscount, TierChange},
    config::Settings,
    reconciler::LiveStore,
    store::SqliteStore,
    utils::now_ts,
};

#[derive(Clone)]
pub struct DashboardState {
    pub settings: Settings,
    pub store: SqliteStore,
    pub live: LiveStore,
    pub api: ApiClient,
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/health", get(api_health))
        .route("/api/accounts", get(api_accounts))
        .route("/api/accounts/{id}/snapshots", get(api_account_snapshots))
        .route("/api/subscription", get(api_subscription))
        .route("/api/history", get(api_history))
        .route("/api/admin/{user_id}/trial/reset", post(admin_reset_trial))
        .route("/api/admin/{user_id}/trial/disable", post(admin_disable_trial))
        .route("/api/admin/{user_id}/addon", post(admin_addon))
        .route("/api/admin/{user_id}/discount/client", post(admin_client_discount))
        .route("/api/admin/{user_id}/discount/special", post(admin_special_discount))
        .route("/api/admin/{user_id}/tier", post(admin_tier).put(admin_tier))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve_dashboard(state: DashboardState) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.settings.dashboard_host, state.settings.dashboard_port)
        .parse()
        .context("dashboard addr parse")?;
    let app = router(state);

    log::info!("dashboard.start url=http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index(State(st): State<DashboardState>) -> impl IntoResponse {
    Html(render_index_html(
        st.api.base_url(),
        st.store.path(),
        st.settings.dashboard_enable_admin,
    ))
}

fn render_index_html(api_base_url: &str, sqlite_path: &str, admin: bool) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>CopyDesk • Accounts</title>
    <style>
      :root {{ --bg: #0b1220; --stroke: rgba(255,255,255,0.12); --text: rgba(255,255,255,0.92); --muted: rgba(255,255,255,0.65); --good: #33d17a; --bad: #ff4d4d; --warn: #ffcc00; }}
      body {{ margin: 0; font-family: ui-sans-serif, system-ui, Segoe UI, Roboto, Helvetica, Arial; color: var(--text); background: var(--bg); }}
      .wrap {{ max-width: 1180px; margin: 0 auto; padding: 22px 18px 42px; }}
      .card {{ border: 1px solid var(--stroke); border-radius: 14px; background: rgba(255,255,255,0.05); margin-top: 14px; }}
      .hd {{ padding: 12px 14px; border-bottom: 1px solid rgba(255,255,255,0.08); font-weight: 800; display: flex; justify-content: space-between; }}
      .bd {{ padding: 12px 14px; }}
      .muted {{ color: var(--muted); font-size: 12px; }}
      .mono {{ font-family: ui-monospace, Menlo, Consolas, monospace; }}
      .good {{ color: var(--good); }} .bad {{ color: var(--bad); }} .warn {{ color: var(--warn); }}
      table {{ width: 100%; border-collapse: collapse; }}
      th, td {{ padding: 8px 10px; border-bottom: 1px solid rgba(255,255,255,0.07); text-align: left; font-size: 13px; }}
      th {{ color: var(--muted); font-size: 12px; }}
      .banner {{ display: none; margin-top: 12px; padding: 10px 12px; border-radius: 12px; background: rgba(255,77,77,0.10); border: 1px solid var(--stroke); white-space: pre-wrap; }}
    </style>
  </head>
  <body>
    <div class="wrap">
      <div class="card"><div class="hd">CopyDesk <span class="muted">backend <span class="mono">{api_base_url}</span> • sqlite <span class="mono">{sqlite_path}</span> • admin <b>{admin}</b></span></div></div>
      <div class="banner mono" id="banner"></div>
      <div class="card">
        <div class="hd">Subscription <span class="muted" id="subLabel">--</span></div>
        <div class="bd" id="subBody">--</div>
      </div>
      <div class="card">
        <div class="hd">Accounts <span class="muted" id="acctMeta">--</span></div>
        <div class="bd">
          <table>
            <thead><tr><th class="mono">id</th><th>name</th><th>status</th><th>balance</th><th>equity</th><th>margin lvl</th></tr></thead>
            <tbody id="acctRows"></tbody>
          </table>
        </div>
      </div>
    </div>
    <script>
      const fmt = (x, d=2) => (x === null || x === undefined || !Number.isFinite(Number(x))) ? "--" : Number(x).toFixed(d);
      const esc = (s) => String(s ?? "").replaceAll("&","&amp;").replaceAll("<","&lt;").replaceAll(">","&gt;");
      async function getJson(path) {{
        const r = await fetch(path, {{ cache: "no-store" }});
        if (!r.ok) throw new Error(`${{path}} -> ${{r.status}}`);
        return await r.json();
      }}
      async function refresh() {{
        const banner = document.getElementById("banner");
        try {{
          const [health, accounts, sub] = await Promise.all([
            getJson("/api/health"), getJson("/api/accounts"), getJson("/api/subscription"),
          ]);
          const blocking = health.blocking || [];
          banner.style.display = blocking.length ? "block" : "none";
          banner.textContent = blocking.map((x) => `${{x.component}}: ${{x.message}} ${{x.detail || ""}}`).join("\n");

          const e = sub.entitlements;
          document.getElementById("subLabel").textContent = e ? e.statusLabel : "not loaded";
          document.getElementById("subBody").innerHTML = e
            ? `tier <b>${{esc(e.subscriptionTier)}}</b> (gating ${{esc(e.gatingTier)}}) • masters ${{e.limits.totalMasters}} • slaves ${{e.limits.totalSlaves}} • phase <span class="mono">${{esc(e.phase)}}</span>`
            : "--";

          const tb = document.getElementById("acctRows");
          tb.innerHTML = "";
          for (const a of accounts) {{
            const st = a.connectionStatus || "unknown";
            const cls = st === "online" ? "good" : (st === "offline" ? "bad" : "warn");
            const tr = document.createElement("tr");
            tr.innerHTML = `<td class="mono">${{esc(a.id)}}</td><td>${{esc(a.name || "--")}}</td><td class="${{cls}}">${{esc(st)}}</td><td>${{fmt(a.balance)}}</td><td>${{fmt(a.equity)}}</td><td>${{fmt(a.marginLevel, 1)}}</td>`;
            tb.appendChild(tr);
          }}
          document.getElementById("acctMeta").textContent = `${{accounts.length}} cached`;
        }} catch (err) {{
          banner.style.display = "block";
          banner.textContent = "refresh failed: " + (err && err.message ? err.message : String(err));
        }}
      }}
      refresh();
      setInterval(refresh, 2000);
    </script>
  </body>
</html>"#,
        api_base_url = api_base_url,
        sqlite_path = sqlite_path,
        admin = if admin { "on" } else { "off" },
    )
}

fn blocking_statuses(statuses: &JsonValue) -> Vec<JsonValue> {
    statuses
        .as_object()
        .map(|m| {
            m.values()
                .filter(|v| v.get("level").and_then(|x| x.as_str()) == Some("error"))
                .cloned()
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

async fn api_health(State(st): State<DashboardState>) -> impl IntoResponse {
    let statuses = st
        .store
        .fetch_runtime_statuses()
        .unwrap_or_else(|_| json!({}));
    let blocking = blocking_statuses(&statuses);
    Json(json!({
        "ts": now_ts(),
        "ok": blocking.is_empty(),
        "components": statuses,
        "blocking": blocking,
        "listeners": st.live.listener_count(),
    }))
}

async fn api_accounts(State(st): State<DashboardState>) -> impl IntoResponse {
    let list = st.live.accounts();
    let rows: Vec<&Account> = list.iter().map(|a| a.as_ref()).collect();
    Json(json!(rows))
}

#[derive(Deserialize)]
struct LimitQ {
    limit: Option<usize>,
}

async fn api_account_snapshots(
    State(st): State<DashboardState>,
    Path(id): Path<String>,
    Query(q): Query<LimitQ>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    match st.store.fetch_account_snapshots(id.trim(), limit) {
        Ok(rows) => Json(JsonValue::Array(rows)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn api_subscription(State(st): State<DashboardState>) -> impl IntoResponse {
    let now = Utc::now();
    let snapshot = st.live.subscription();
    let entitlements = snapshot.as_deref().map(|s| s.entitlements(now));
    let persisted = if snapshot.is_none() {
        st.store.fetch_latest_subscription_snapshot().unwrap_or(None)
    } else {
        None
    };
    Json(json!({
        "ts": now_ts(),
        "subscription": snapshot.as_deref(),
        "entitlements": entitlements,
        "lastPersisted": persisted,
    }))
}

async fn api_history(State(st): State<DashboardState>, Query(q): Query<HistoryQuery>) -> Response {
    match st.api.get_history(&q).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => api_error(e),
    }
}

fn api_error(e: ApiError) -> Response {
    (e.status_code(), Json(json!({"ok": false, "error": e.to_string()}))).into_response()
}

fn admin_forbidden(st: &DashboardState) -> Option<Response> {
    if st.settings.dashboard_enable_admin {
        return None;
    }
    Some(
        (
            StatusCode::FORBIDDEN,
            Json(json!({"ok": false, "error": "admin_disabled"})),
        )
            .into_response(),
    )
}

fn admin_done(st: &DashboardState, action: &str, user_id: &str, result: Result<JsonValue, ApiError>) -> Response {
    match result {
        Ok(body) => {
            log::info!("dashboard.admin action={} user={}", action, user_id);
            st.live.invalidate_subscription();
            Json(json!({"ok": true, "result": body})).into_response()
        }
        Err(e) => {
            log::warn!("dashboard.admin_failed action={} user={} err={}", action, user_id, e);
            api_error(e)
        }
    }
}

async fn admin_reset_trial(State(st): State<DashboardState>, Path(user_id): Path<String>) -> Response {
    if let Some(r) = admin_forbidden(&st) {
        return r;
    }
    let res = st.api.reset_trial(&user_id).await;
    admin_done(&st, "trial_reset", &user_id, res)
}

async fn admin_disable_trial(State(st): State<DashboardState>, Path(user_id): Path<String>) -> Response {
    if let Some(r) = admin_forbidden(&st) {
        return r;
    }
    let res = st.api.disable_trial(&user_id).await;
    admin_done(&st, "trial_disable", &user_id, res)
}

async fn admin_addon(
    State(st): State<DashboardState>,
    Path(user_id): Path<String>,
    Json(change): Json<AddonChange>,
) -> Response {
    if let Some(r) = admin_forbidden(&st) {
        return r;
    }
    let res = st.api.update_addon(&user_id, &change).await;
    admin_done(&st, "addon", &user_id, res)
}

async fn admin_client_discount(
    State(st): State<DashboardState>,
    Path(user_id): Path<String>,
    Json(discount): Json<ClientDiscount>,
) -> Response {
    if let Some(r) = admin_forbidden(&st) {
        return r;
    }
    let res = st.api.set_client_discount(&user_id, &discount).await;
    admin_done(&st, "discount_client", &user_id, res)
}

async fn admin_special_discount(
    State(st): State<DashboardState>,
    Path(user_id): Path<String>,
    Json(discount): Json<SpecialDiscount>,
) -> Response {
    if let Some(r) = admin_forbidden(&st) {
        return r;
    }
    let res = st.api.set_special_discount(&user_id, &discount).await;
    admin_done(&st, "discount_special", &user_id, res)
}

async fn admin_tier(
    State(st): State<DashboardState>,
    Path(user_id): Path<String>,
    Json(change): Json<TierChange>,
) -> Response {
    if let Some(r) = admin_forbidden(&st) {
        return r;
    }
    let res = st.api.update_tier(&user_id, &change).await;
    admin_done(&st, "tier", &user_id, res)
}
