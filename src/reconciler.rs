//! Live account cache and listener registry.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    account::{apply_update, Account, AccountId, AccountList, AccountUpdate},
    push::{OutboundMessage, PushChannel, PushEvent},
    subscription::{Entitlements, SubscriptionSnapshot},
};

pub type Callback = Arc<dyn Fn(&PushEvent) + Send + Sync>;

// Swapping the callback never touches the channel registration.
struct CallbackCell {
    current: RwLock<Callback>,
}

impl CallbackCell {
    fn invoke(&self, event: &PushEvent) {
        // Clone out before calling so a callback may replace itself.
        let cb = self.current.read().clone();
        cb(event);
    }
}

struct AccountCache {
    list: AccountList,
    seq: u64,
    in_flight: usize,
    journal: Vec<(u64, AccountUpdate)>,
    next_generation: u64,
    applied_generation: u64,
}

struct Inner {
    channel: Arc<dyn PushChannel>,
    accounts: RwLock<AccountCache>,
    subscription: RwLock<Option<Arc<SubscriptionSnapshot>>>,
    listeners: RwLock<HashMap<Uuid, Arc<CallbackCell>>>,
    watched: Mutex<HashMap<Uuid, AccountId>>,
    invalidated: Notify,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct LiveStore {
    inner: Arc<Inner>,
}

#[must_use]
#[derive(Debug)]
pub struct FetchTicket {
    seq: u64,
    generation: u64,
}

impl LiveStore {
    pub fn new(channel: Arc<dyn PushChannel>) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                accounts: RwLock::new(AccountCache {
                    list: Arc::new(Vec::new()),
                    seq: 0,
                    in_flight: 0,
                    journal: Vec::new(),
                    next_generation: 0,
                    applied_generation: 0,
                }),
                subscription: RwLock::new(None),
                listeners: RwLock::new(HashMap::new()),
                watched: Mutex::new(HashMap::new()),
                invalidated: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    // ---- Accounts ----

    pub fn accounts(&self) -> AccountList {
        self.inner.accounts.read().list.clone()
    }

    pub fn account(&self, id: &AccountId) -> Option<Arc<Account>> {
        self.inner
            .accounts
            .read()
            .list
            .iter()
            .find(|a| &a.id == id)
            .cloned()
    }

    pub fn apply_account_update(&self, update: &AccountUpdate) -> bool {
        let mut cache = self.inner.accounts.write();
        cache.seq += 1;
        let seq = cache.seq;
        if cache.in_flight > 0 {
            cache.journal.push((seq, update.clone()));
        }
        match apply_update(&cache.list, update) {
            Some(next) => {
                cache.list = next;
                true
            }
            None => {
                log::debug!("live.account.unmatched id={}", update.account_id);
                false
            }
        }
    }

    pub fn begin_accounts_fetch(&self) -> FetchTicket {
        let mut cache = self.inner.accounts.write();
        cache.in_flight += 1;
        cache.next_generation += 1;
        FetchTicket {
            seq: cache.seq,
            generation: cache.next_generation,
        }
    }

    /// Install a fetched list, replaying every push that arrived after the
    /// fetch started. A response older than one already installed is
    /// discarded.
    pub fn complete_accounts_fetch(&self, ticket: FetchTicket, fetched: Vec<Account>) -> AccountList {
        let mut cache = self.inner.accounts.write();
        cache.in_flight = cache.in_flight.saturating_sub(1);

        if ticket.generation < cache.applied_generation {
            log::debug!(
                "live.fetch.stale generation={} applied={}",
                ticket.generation,
                cache.applied_generation
            );
        } else {
            let mut list: AccountList = Arc::new(fetched.into_iter().map(Arc::new).collect());
            for (_, u) in cache.journal.iter().filter(|(s, _)| *s > ticket.seq) {
                if let Some(next) = apply_update(&list, u) {
                    list = next;
                }
            }
            cache.list = list;
            cache.applied_generation = ticket.generation;
        }

        if cache.in_flight == 0 {
            cache.journal.clear();
        }
        cache.list.clone()
    }

    pub fn abandon_accounts_fetch(&self, ticket: FetchTicket) {
        let mut cache = self.inner.accounts.write();
        cache.in_flight = cache.in_flight.saturating_sub(1);
        if cache.in_flight == 0 {
            cache.journal.clear();
        }
        log::debug!("live.fetch.abandoned generation={}", ticket.generation);
    }

    // ---- Subscription ----

    pub fn subscription(&self) -> Option<Arc<SubscriptionSnapshot>> {
        self.inner.subscription.read().clone()
    }

    pub fn set_subscription(&self, snapshot: SubscriptionSnapshot) {
        *self.inner.subscription.write() = Some(Arc::new(snapshot));
    }

    pub fn entitlements(&self, now: DateTime<Utc>) -> Option<Entitlements> {
        self.subscription().map(|s| s.entitlements(now))
    }

    pub fn invalidate_subscription(&self) {
        self.inner.invalidated.notify_one();
    }

    pub async fn subscription_invalidated(&self) {
        self.inner.invalidated.notified().await;
    }

    // ---- Push events ----

    pub fn apply_event(&self, event: &PushEvent) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        if let PushEvent::AccountUpdate(u) = event {
            self.apply_account_update(u);
        }
        let cells: Vec<Arc<CallbackCell>> = self.inner.listeners.read().values().cloned().collect();
        for cell in cells {
            cell.invoke(event);
        }
    }

    /// Register a consumer. The account feed is requested from the channel
    /// when the first listener arrives and released when the last one goes.
    pub fn listen<F>(&self, callback: F) -> AccountListener
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        let callback: Callback = Arc::new(callback);
        let cell = Arc::new(CallbackCell {
            current: RwLock::new(callback),
        });
        let first = {
            let mut listeners = self.inner.listeners.write();
            listeners.insert(id, cell.clone());
            listeners.len() == 1
        };
        if first {
            let sent = self.inner.channel.send(OutboundMessage::SubscribeAccounts);
            log::debug!("live.feed.subscribe sent={}", sent);
        }
        AccountListener {
            id,
            cell,
            store: self.clone(),
            watched: None,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    pub fn wants_account_feed(&self) -> bool {
        !self.inner.listeners.read().is_empty()
    }

    pub fn watched_accounts(&self) -> Vec<AccountId> {
        let mut ids: Vec<AccountId> = self.inner.watched.lock().values().cloned().collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn request(&self, msg: OutboundMessage) {
        if !self.inner.channel.is_connected() {
            log::debug!("live.request.dropped event={} reason=disconnected", msg.event_name());
            return;
        }
        self.inner.channel.send(msg);
    }

    fn unregister(&self, id: &Uuid) {
        let last = {
            let mut listeners = self.inner.listeners.write();
            listeners.remove(id).is_some() && listeners.is_empty()
        };
        if last && !self.inner.closed.load(Ordering::Acquire) {
            self.inner.channel.send(OutboundMessage::UnsubscribeAccounts);
        }
    }

    // Drops every registration and stops reconciling.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let had_listeners = {
            let mut listeners = self.inner.listeners.write();
            let had = !listeners.is_empty();
            listeners.clear();
            had
        };
        self.inner.watched.lock().clear();
        if had_listeners {
            self.inner.channel.send(OutboundMessage::UnsubscribeAccounts);
        }
        log::info!("live.shutdown");
    }
}

/// A consumer's registration. Dropping it unregisters.
pub struct AccountListener {
    id: Uuid,
    cell: Arc<CallbackCell>,
    store: LiveStore,
    watched: Option<AccountId>,
}

impl AccountListener {
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        *self.cell.current.write() = callback;
    }

    pub fn watched_account(&self) -> Option<&AccountId> {
        self.watched.as_ref()
    }

    /// Narrow subscription to one account. Re-subscribes only when the id
    /// actually changes; requests made while disconnected are dropped.
    pub fn watch_account(&mut self, account_id: Option<AccountId>) {
        if self.watched == account_id {
            return;
        }
        if let Some(prev) = self.watched.take() {
            self.store.inner.watched.lock().remove(&self.id);
            self.store.request(OutboundMessage::UnsubscribeAccount(prev));
        }
        if let Some(next) = account_id {
            self.store.inner.watched.lock().insert(self.id, next.clone());
            self.store.request(OutboundMessage::SubscribeAccount(next.clone()));
            self.watched = Some(next);
        }
    }
}

impl Drop for AccountListener {
    fn drop(&mut self) {
        self.watch_account(None);
        self.store.unregister(&self.id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::account::ConnectionStatus;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    pub(crate) struct RecordingChannel {
        pub connected: AtomicBool,
        pub sent: Mutex<Vec<OutboundMessage>>,
    }

    impl RecordingChannel {
        pub fn connected() -> Arc<Self> {
            let c = Arc::new(Self::default());
            c.connected.store(true, Ordering::Release);
            c
        }

        pub fn take(&self) -> Vec<OutboundMessage> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl PushChannel for RecordingChannel {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Acquire)
        }

        fn send(&self, msg: OutboundMessage) -> bool {
            if !self.is_connected() {
                return false;
            }
            self.sent.lock().push(msg);
            true
        }
    }

    fn account(id: &str, balance: f64) -> Account {
        Account {
            balance: Some(balance),
            equity: Some(balance),
            connection_status: ConnectionStatus::Online,
            ..Account::new(id)
        }
    }

    fn seeded(chan: Arc<RecordingChannel>) -> LiveStore {
        let live = LiveStore::new(chan);
        let t = live.begin_accounts_fetch();
        live.complete_accounts_fetch(t, vec![account("A1", 100.0), account("B2", 50.0)]);
        live
    }

    #[test]
    fn push_patches_cached_account() {
        let live = seeded(RecordingChannel::connected());
        let u = AccountUpdate {
            equity: Some(150.0),
            ..AccountUpdate::new("A1")
        };
        live.apply_event(&PushEvent::AccountUpdate(u));

        let a = live.account(&AccountId::new("A1")).unwrap();
        assert_eq!(a.balance, Some(100.0));
        assert_eq!(a.equity, Some(150.0));
        assert_eq!(a.connection_status, ConnectionStatus::Online);
    }

    #[test]
    fn unmatched_push_leaves_cache_identical() {
        let live = seeded(RecordingChannel::connected());
        let before = live.accounts();
        assert!(!live.apply_account_update(&AccountUpdate {
            balance: Some(1.0),
            ..AccountUpdate::new("nope")
        }));
        assert!(Arc::ptr_eq(&before, &live.accounts()));
    }

    #[test]
    fn stale_fetch_does_not_erase_newer_push() {
        let live = seeded(RecordingChannel::connected());

        let ticket = live.begin_accounts_fetch();
        live.apply_account_update(&AccountUpdate {
            equity: Some(175.0),
            ..AccountUpdate::new("A1")
        });
        // Response was produced before the push above.
        let list = live.complete_accounts_fetch(ticket, vec![account("A1", 100.0), account("B2", 60.0)]);

        assert_eq!(list[0].equity, Some(175.0));
        assert_eq!(list[0].balance, Some(100.0));
        assert_eq!(list[1].balance, Some(60.0));
    }

    #[test]
    fn push_for_account_only_known_to_fetch_is_replayed() {
        let live = seeded(RecordingChannel::connected());
        let ticket = live.begin_accounts_fetch();
        assert!(!live.apply_account_update(&AccountUpdate {
            balance: Some(9.0),
            ..AccountUpdate::new("C3")
        }));
        let list = live.complete_accounts_fetch(ticket, vec![account("C3", 1.0)]);
        assert_eq!(list[0].balance, Some(9.0));
    }

    #[test]
    fn out_of_order_fetch_responses() {
        let live = seeded(RecordingChannel::connected());
        let older = live.begin_accounts_fetch();
        let newer = live.begin_accounts_fetch();
        live.complete_accounts_fetch(newer, vec![account("A1", 300.0)]);
        let list = live.complete_accounts_fetch(older, vec![account("A1", 200.0), account("B2", 1.0)]);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].balance, Some(300.0));
    }

    #[test]
    fn abandoned_fetch_releases_journal() {
        let live = seeded(RecordingChannel::connected());
        let t = live.begin_accounts_fetch();
        live.apply_account_update(&AccountUpdate {
            balance: Some(5.0),
            ..AccountUpdate::new("A1")
        });
        live.abandon_accounts_fetch(t);
        assert!(live.inner.accounts.read().journal.is_empty());
        assert_eq!(live.account(&AccountId::new("A1")).unwrap().balance, Some(5.0));
    }

    #[test]
    fn feed_subscribed_once_and_released_with_last_listener() {
        let chan = RecordingChannel::connected();
        let live = LiveStore::new(chan.clone());

        let a = live.listen(|_| {});
        let b = live.listen(|_| {});
        assert_eq!(chan.take(), vec![OutboundMessage::SubscribeAccounts]);
        assert!(live.wants_account_feed());

        drop(a);
        assert!(chan.take().is_empty());
        drop(b);
        assert_eq!(chan.take(), vec![OutboundMessage::UnsubscribeAccounts]);
        assert_eq!(live.listener_count(), 0);
    }

    #[test]
    fn callback_swap_keeps_registration() {
        let chan = RecordingChannel::connected();
        let live = seeded(chan.clone());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        let listener = live.listen(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        chan.take();

        let ev = PushEvent::AccountUpdate(AccountUpdate {
            balance: Some(1.0),
            ..AccountUpdate::new("A1")
        });
        live.apply_event(&ev);

        let s = second.clone();
        listener.set_callback(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        live.apply_event(&ev);
        live.apply_event(&ev);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert!(chan.take().is_empty());
        assert_eq!(live.listener_count(), 1);
    }

    #[test]
    fn listeners_see_passthrough_events() {
        let live = seeded(RecordingChannel::connected());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _l = live.listen(move |ev| s.lock().push(ev.name().to_string()));

        live.apply_event(&PushEvent::TradeUpdate(serde_json::json!({"ticket": 1})));
        live.apply_event(&PushEvent::CommandUpdate(serde_json::json!({"id": "c"})));
        assert_eq!(*seen.lock(), vec!["trade:update", "command:update"]);
    }

    #[test]
    fn scoped_subscription_follows_requested_id() {
        let chan = RecordingChannel::connected();
        let live = LiveStore::new(chan.clone());
        let mut l = live.listen(|_| {});
        chan.take();

        l.watch_account(Some(AccountId::new("A1")));
        l.watch_account(Some(AccountId::new("A1")));
        l.watch_account(Some(AccountId::new("B2")));
        l.watch_account(None);

        assert_eq!(
            chan.take(),
            vec![
                OutboundMessage::SubscribeAccount(AccountId::new("A1")),
                OutboundMessage::UnsubscribeAccount(AccountId::new("A1")),
                OutboundMessage::SubscribeAccount(AccountId::new("B2")),
                OutboundMessage::UnsubscribeAccount(AccountId::new("B2")),
            ]
        );
        assert_eq!(live.listener_count(), 1);
    }

    #[test]
    fn scoped_requests_dropped_while_disconnected() {
        let chan = Arc::new(RecordingChannel::default());
        let live = LiveStore::new(chan.clone());
        let mut l = live.listen(|_| {});

        l.watch_account(Some(AccountId::new("A1")));
        assert!(chan.take().is_empty());
        // Desired state is still tracked for the transport to restore.
        assert_eq!(live.watched_accounts(), vec![AccountId::new("A1")]);
        assert_eq!(l.watched_account(), Some(&AccountId::new("A1")));

        chan.connected.store(true, Ordering::Release);
        drop(l);
        assert_eq!(
            chan.take(),
            vec![
                OutboundMessage::UnsubscribeAccount(AccountId::new("A1")),
                OutboundMessage::UnsubscribeAccounts,
            ]
        );
        assert!(live.watched_accounts().is_empty());
    }

    #[test]
    fn shutdown_stops_reconciling() {
        let chan = RecordingChannel::connected();
        let live = seeded(chan.clone());
        let l = live.listen(|_| {});
        chan.take();

        live.shutdown();
        assert_eq!(chan.take(), vec![OutboundMessage::UnsubscribeAccounts]);
        live.apply_event(&PushEvent::AccountUpdate(AccountUpdate {
            balance: Some(0.0),
            ..AccountUpdate::new("A1")
        }));
        assert_eq!(live.account(&AccountId::new("A1")).unwrap().balance, Some(100.0));

        drop(l);
        assert!(chan.take().is_empty());
    }

    #[test]
    fn entitlements_derive_from_latest_snapshot() {
        use crate::subscription::Tier;
        let live = LiveStore::new(RecordingChannel::connected());
        assert!(live.entitlements(Utc::now()).is_none());

        live.set_subscription(SubscriptionSnapshot {
            subscription_tier: Tier::EaLicense,
            ..Default::default()
        });
        let e = live.entitlements(Utc::now()).unwrap();
        assert!(e.can_access_feature(Tier::EaLicense));
        assert!(!e.can_access_feature(Tier::FullAccess));
    }

    #[tokio::test]
    async fn invalidation_wakes_waiter() {
        let live = LiveStore::new(RecordingChannel::connected());
        live.invalidate_subscription();
        tokio::time::timeout(std::time::Duration::from_secs(1), live.subscription_invalidated())
            .await
            .expect("permit should be stored");
    }
}
