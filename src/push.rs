use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value as JsonValue;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::{header::AUTHORIZATION, HeaderValue},
    Message,
};

use crate::{
    account::{AccountId, AccountUpdate},
    config::Settings,
    reconciler::LiveStore,
    store::SqliteStore,
    utils::{backoff_delay, now_ts},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const EVENT_ACCOUNT_UPDATE: &str = "account:update";
pub const EVENT_TRADE_UPDATE: &str = "trade:update";
pub const EVENT_COMMAND_UPDATE: &str = "command:update";

// Only account updates are reconciled; the rest reach listeners as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    AccountUpdate(AccountUpdate),
    TradeUpdate(JsonValue),
    CommandUpdate(JsonValue),
    Unknown { event: String, data: JsonValue },
}

impl PushEvent {
    pub fn name(&self) -> &str {
        match self {
            PushEvent::AccountUpdate(_) => EVENT_ACCOUNT_UPDATE,
            PushEvent::TradeUpdate(_) => EVENT_TRADE_UPDATE,
            PushEvent::CommandUpdate(_) => EVENT_COMMAND_UPDATE,
            PushEvent::Unknown { event, .. } => event,
        }
    }

    pub fn decode(event: &str, data: JsonValue) -> Result<Self> {
        Ok(match event {
            EVENT_ACCOUNT_UPDATE => PushEvent::AccountUpdate(
                serde_json::from_value(data).with_context(|| format!("decode {event}"))?,
            ),
            EVENT_TRADE_UPDATE => PushEvent::TradeUpdate(data),
            EVENT_COMMAND_UPDATE => PushEvent::CommandUpdate(data),
            other => PushEvent::Unknown {
                event: other.to_string(),
                data,
            },
        })
    }
}

/// Decode one text frame.
///
/// Accepts `{"event": name, "data": payload}` envelopes and `[name, payload]`
/// arrays, the latter optionally prefixed by a numeric packet code (`42[...]`).
/// Frames that carry no event (keepalives, acks) yield `Ok(None)`.
pub fn parse_frame(text: &str) -> Result<Option<PushEvent>> {
    let body = text.trim().trim_start_matches(|c: char| c.is_ascii_digit());
    if body.is_empty() {
        return Ok(None);
    }
    let v: JsonValue = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };

    let (name, data) = match v {
        JsonValue::Object(mut m) => {
            let name = m
                .get("event")
                .or_else(|| m.get("type"))
                .and_then(|x| x.as_str())
                .map(|s| s.to_string());
            let Some(name) = name else { return Ok(None) };
            let data = m
                .remove("data")
                .or_else(|| m.remove("payload"))
                .unwrap_or(JsonValue::Null);
            (name, data)
        }
        JsonValue::Array(mut items) => {
            if items.is_empty() {
                return Ok(None);
            }
            let Some(name) = items[0].as_str().map(|s| s.to_string()) else {
                return Ok(None);
            };
            let data = if items.len() > 1 {
                items.swap_remove(1)
            } else {
                JsonValue::Null
            };
            (name, data)
        }
        _ => return Ok(None),
    };

    PushEvent::decode(&name, data).map(Some)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    SubscribeAccounts,
    UnsubscribeAccounts,
    SubscribeAccount(AccountId),
    UnsubscribeAccount(AccountId),
}

impl OutboundMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundMessage::SubscribeAccounts => "subscribe:accounts",
            OutboundMessage::UnsubscribeAccounts => "unsubscribe:accounts",
            OutboundMessage::SubscribeAccount(_) => "subscribe:account",
            OutboundMessage::UnsubscribeAccount(_) => "unsubscribe:account",
        }
    }

    pub fn to_frame(&self) -> String {
        let data = match self {
            OutboundMessage::SubscribeAccount(id) | OutboundMessage::UnsubscribeAccount(id) => {
                serde_json::json!({ "accountId": id })
            }
            _ => JsonValue::Null,
        };
        serde_json::json!({ "event": self.event_name(), "data": data }).to_string()
    }
}

/// Outbound half of the push connection as seen by the store.
pub trait PushChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Hand a frame to the transport. Returns `false` if it was dropped.
    fn send(&self, msg: OutboundMessage) -> bool;
}

#[derive(Clone)]
pub struct WsChannel {
    connected: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl PushChannel for WsChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send(&self, msg: OutboundMessage) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.tx.send(msg).is_ok()
    }
}

pub struct WsTransport {
    settings: Settings,
    connected: Arc<AtomicBool>,
    rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

pub fn ws_channel(settings: Settings) -> (WsChannel, WsTransport) {
    let connected = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        WsChannel {
            connected: connected.clone(),
            tx,
        },
        WsTransport {
            settings,
            connected,
            rx,
        },
    )
}

impl WsTransport {
    pub fn spawn(self, live: LiveStore, store: SqliteStore) {
        tokio::spawn(async move {
            if let Err(e) = self.run(live, store).await {
                log::error!("push.ws.loop.error {}", e);
            }
        });
    }

    async fn run(mut self, live: LiveStore, store: SqliteStore) -> Result<()> {
        let url = self.settings.push_ws_url.clone();
        let max_delay = Duration::from_secs(self.settings.push_reconnect_max_secs);
        let mut attempt: u32 = 0;

        loop {
            match self.connect(&url).await {
                Ok(ws) => {
                    attempt = 0;
                    // Frames still queued belong to the previous session.
                    while self.rx.try_recv().is_ok() {}
                    self.connected.store(true, Ordering::Release);
                    log::info!("push.connected url={}", url);
                    store
                        .upsert_runtime_status("push.ws", "ok", "connected", Some(&url), now_ts())
                        .ok();

                    match self.pump(ws, &live).await {
                        Ok(true) => {}
                        Ok(false) => {
                            self.connected.store(false, Ordering::Release);
                            log::info!("push.closed outbound queue dropped");
                            return Ok(());
                        }
                        Err(e) => log::warn!("push.stream.error {}", e),
                    }

                    self.connected.store(false, Ordering::Release);
                    store
                        .upsert_runtime_status("push.ws", "warn", "disconnected", Some(&url), now_ts())
                        .ok();
                }
                Err(e) => {
                    log::warn!("push.connect.failed url={} attempt={} err={}", url, attempt, e);
                    store
                        .upsert_runtime_status(
                            "push.ws",
                            "error",
                            "connect_failed",
                            Some(&e.to_string()),
                            now_ts(),
                        )
                        .ok();
                }
            }

            let delay = backoff_delay(attempt, Duration::from_millis(500), max_delay);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect(&self, url: &str) -> Result<WsStream> {
        let mut req = url
            .into_client_request()
            .map_err(|e| anyhow!("push url {url}: {e}"))?;
        if let Some(token) = self.settings.api_token.as_deref() {
            req.headers_mut().insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| anyhow!("API_TOKEN not a valid header: {e}"))?,
            );
        }
        let (ws, _resp) = tokio_tungstenite::connect_async(req)
            .await
            .with_context(|| format!("connect {url}"))?;
        Ok(ws)
    }

    // Ok(false): the outbound queue is gone, stop for good.
    async fn pump(&mut self, ws: WsStream, live: &LiveStore) -> Result<bool> {
        let (mut sink, mut stream) = ws.split();

        if live.wants_account_feed() {
            sink.send(Message::Text(OutboundMessage::SubscribeAccounts.to_frame().into()))
                .await?;
        }
        for id in live.watched_accounts() {
            sink.send(Message::Text(OutboundMessage::SubscribeAccount(id).to_frame().into()))
                .await?;
        }

        loop {
            tokio::select! {
                out = self.rx.recv() => {
                    let Some(msg) = out else { return Ok(false); };
                    log::debug!("push.send event={}", msg.event_name());
                    sink.send(Message::Text(msg.to_frame().into())).await?;
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(t))) => handle_text(live, t.as_str()),
                        Some(Ok(Message::Ping(p))) => sink.send(Message::Pong(p)).await?,
                        Some(Ok(Message::Close(_))) | None => return Ok(true),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }
}

fn handle_text(live: &LiveStore, text: &str) {
    match parse_frame(text) {
        Ok(Some(event)) => {
            if let PushEvent::Unknown { event: name, .. } = &event {
                log::debug!("push.event.unknown name={}", name);
            }
            live.apply_event(&event);
        }
        Ok(None) => {}
        Err(e) => log::warn!("push.frame.invalid err={:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_envelope_frames() {
        let ev = parse_frame(r#"{"event":"account:update","data":{"accountId":"A1","equity":150}}"#)
            .unwrap()
            .unwrap();
        match ev {
            PushEvent::AccountUpdate(u) => {
                assert_eq!(u.account_id.as_str(), "A1");
                assert_eq!(u.equity, Some(150.0));
                assert_eq!(u.balance, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_array_frames_with_packet_prefix() {
        let ev = parse_frame(r#"42["account:update",{"accountId":{"$oid":"A1"},"balance":9}]"#)
            .unwrap()
            .unwrap();
        assert_eq!(ev.name(), EVENT_ACCOUNT_UPDATE);
        let PushEvent::AccountUpdate(u) = ev else { panic!("not an account update") };
        assert_eq!(u.account_id, AccountId::new("A1"));
        assert_eq!(u.balance, Some(9.0));
    }

    #[test]
    fn passes_trade_and_command_through() {
        let ev = parse_frame(r#"["trade:update",{"ticket":77,"symbol":"XAUUSD"}]"#)
            .unwrap()
            .unwrap();
        assert_eq!(ev, PushEvent::TradeUpdate(json!({"ticket": 77, "symbol": "XAUUSD"})));

        let ev = parse_frame(r#"{"type":"command:update","payload":{"status":"done"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(ev, PushEvent::CommandUpdate(json!({"status": "done"})));
    }

    #[test]
    fn unknown_events_are_kept() {
        let ev = parse_frame(r#"{"event":"user:notice","data":"hi"}"#).unwrap().unwrap();
        assert_eq!(
            ev,
            PushEvent::Unknown {
                event: "user:notice".to_string(),
                data: json!("hi")
            }
        );
    }

    #[test]
    fn keepalives_yield_nothing() {
        assert!(parse_frame("2").unwrap().is_none());
        assert!(parse_frame("").unwrap().is_none());
        assert!(parse_frame("40").unwrap().is_none());
        assert!(parse_frame(r#"{"ok":true}"#).unwrap().is_none());
        assert!(parse_frame("not json").unwrap().is_none());
    }

    #[test]
    fn malformed_account_update_is_an_error() {
        assert!(parse_frame(r#"{"event":"account:update","data":{"equity":1}}"#).is_err());
    }

    #[test]
    fn outbound_frames() {
        let f = OutboundMessage::SubscribeAccount(AccountId::new(" A1 ")).to_frame();
        let v: JsonValue = serde_json::from_str(&f).unwrap();
        assert_eq!(v, json!({"event": "subscribe:account", "data": {"accountId": "A1"}}));

        let v: JsonValue =
            serde_json::from_str(&OutboundMessage::UnsubscribeAccounts.to_frame()).unwrap();
        assert_eq!(v["event"], json!("unsubscribe:accounts"));
    }

    #[test]
    fn ws_channel_drops_while_disconnected() {
        let settings = Settings::for_tests();
        let (chan, mut transport) = ws_channel(settings);
        assert!(!chan.is_connected());
        assert!(!chan.send(OutboundMessage::SubscribeAccounts));
        assert!(transport.rx.try_recv().is_err());

        transport.connected.store(true, Ordering::Release);
        assert!(chan.send(OutboundMessage::SubscribeAccounts));
        assert_eq!(transport.rx.try_recv().unwrap(), OutboundMessage::SubscribeAccounts);
    }

    type ServerWs = WebSocketStream<TcpStream>;

    async fn next_text(ws: &mut ServerWs) -> JsonValue {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(t))) => return serde_json::from_str(t.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    }

    async fn accept_and_expect_subscriptions(listener: &tokio::net::TcpListener) -> ServerWs {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        assert_eq!(next_text(&mut ws).await, json!({"event": "subscribe:accounts", "data": null}));
        assert_eq!(
            next_text(&mut ws).await,
            json!({"event": "subscribe:account", "data": {"accountId": "A1"}})
        );
        ws
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn transport_resubscribes_and_reconciles_over_a_socket() {
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("p.sqlite").to_str().unwrap()).unwrap();
        store.init_db().unwrap();

        let mut settings = Settings::for_tests();
        settings.push_ws_url = format!("ws://{addr}");
        let (chan, transport) = ws_channel(settings);
        let live = LiveStore::new(Arc::new(chan.clone()));
        let ticket = live.begin_accounts_fetch();
        live.complete_accounts_fetch(ticket, vec![crate::account::Account::new("A1")]);

        // Registered while disconnected: nothing is sent yet, but both
        // subscriptions must be replayed once the socket opens.
        let mut listener = live.listen(|_| {});
        listener.watch_account(Some(AccountId::new("A1")));
        assert!(!chan.is_connected());

        transport.spawn(live.clone(), store.clone());

        tokio::time::timeout(Duration::from_secs(10), async {
            let mut ws = accept_and_expect_subscriptions(&server).await;
            assert!(chan.is_connected());
            let statuses = store.fetch_runtime_statuses().unwrap();
            assert_eq!(statuses["push.ws"]["level"], "ok");

            let frame = json!({"event": "account:update", "data": {"accountId": "A1", "equity": 42}});
            ws.send(Message::Text(frame.to_string().into())).await.unwrap();
            let id = AccountId::new("A1");
            wait_until(|| live.account(&id).and_then(|a| a.equity) == Some(42.0)).await;

            ws.send(Message::Ping(b"hb".to_vec().into())).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Pong(p))) => {
                        assert_eq!(&p[..], b"hb");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("socket ended: {other:?}"),
                }
            }

            // Server drops the socket; the transport reconnects and replays.
            drop(ws);
            let _ws = accept_and_expect_subscriptions(&server).await;
            assert!(chan.is_connected());
        })
        .await
        .expect("transport test timed out");

        drop(listener);
    }
}
