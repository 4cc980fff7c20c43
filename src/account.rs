use std::{fmt, sync::Arc};

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Canonical account identifier.
///
/// The backend and the push channel disagree on how ids are shaped: plain
/// strings, numbers, or objects wrapping the string (`{"$oid": ".."}`,
/// `{"_id": ".."}`). Everything is coerced to a trimmed string when it is
/// decoded so comparisons further in are plain value equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_value(v: &JsonValue) -> Option<Self> {
        match v {
            JsonValue::String(s) => {
                let s = s.trim();
                (!s.is_empty()).then(|| Self(s.to_string()))
            }
            JsonValue::Number(n) => Some(Self(number_id(n))),
            JsonValue::Object(m) => ["$oid", "_id", "id"]
                .iter()
                .find_map(|k| m.get(*k))
                .and_then(Self::from_value),
            _ => None,
        }
    }
}

// `12`, `12.0` and `"12"` all name the same account.
fn number_id(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 => format!("{f:.0}"),
        _ => n.to_string(),
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for AccountId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = JsonValue::deserialize(d)?;
        AccountId::from_value(&v)
            .ok_or_else(|| de::Error::custom(format!("unrecognized account id: {v}")))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl ConnectionStatus {
    /// `None` for an empty value, so it never overwrites a cached status.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        Some(match s.to_lowercase().as_str() {
            "online" | "connected" => ConnectionStatus::Online,
            "offline" | "disconnected" => ConnectionStatus::Offline,
            _ => ConnectionStatus::Unknown,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Online => "online",
            ConnectionStatus::Offline => "offline",
            ConnectionStatus::Unknown => "unknown",
        }
    }
}

// Id keys are tried in order; every one of them is consumed so a payload
// carrying both `id` and `_id` still decodes.
fn take_id(m: &mut Map<String, JsonValue>, keys: &[&str]) -> Option<AccountId> {
    keys.iter()
        .filter_map(|k| m.remove(*k))
        .collect::<Vec<_>>()
        .iter()
        .find_map(AccountId::from_value)
}

fn take_f64(m: &mut Map<String, JsonValue>, key: &str) -> Option<f64> {
    match m.remove(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn take_status(m: &mut Map<String, JsonValue>, key: &str) -> Option<ConnectionStatus> {
    m.remove(key)?.as_str().and_then(ConnectionStatus::parse)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub balance: Option<f64>,
    pub equity: Option<f64>,
    pub margin: Option<f64>,
    pub free_margin: Option<f64>,
    pub margin_level: Option<f64>,
    pub connection_status: ConnectionStatus,
    // name, login, server, role... carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Account {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self {
            id: AccountId::new(id),
            balance: None,
            equity: None,
            margin: None,
            free_margin: None,
            margin_level: None,
            connection_status: ConnectionStatus::Unknown,
            extra: Map::new(),
        }
    }

    /// Field-level merge: only values the delta actually carries replace
    /// the cached ones.
    pub fn merged(&self, u: &AccountUpdate) -> Account {
        let mut out = self.clone();
        if let Some(v) = u.balance {
            out.balance = Some(v);
        }
        if let Some(v) = u.equity {
            out.equity = Some(v);
        }
        if let Some(v) = u.margin {
            out.margin = Some(v);
        }
        if let Some(v) = u.free_margin {
            out.free_margin = Some(v);
        }
        if let Some(v) = u.margin_level {
            out.margin_level = Some(v);
        }
        if let Some(s) = u.connection_status {
            out.connection_status = s;
        }
        out
    }
}

impl<'de> Deserialize<'de> for Account {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let mut m = Map::<String, JsonValue>::deserialize(d)?;
        let id = take_id(&mut m, &["id", "_id", "accountId"])
            .ok_or_else(|| de::Error::custom("account without a usable id"))?;
        Ok(Account {
            id,
            balance: take_f64(&mut m, "balance"),
            equity: take_f64(&mut m, "equity"),
            margin: take_f64(&mut m, "margin"),
            free_margin: take_f64(&mut m, "freeMargin"),
            margin_level: take_f64(&mut m, "marginLevel"),
            connection_status: take_status(&mut m, "connectionStatus").unwrap_or_default(),
            extra: m,
        })
    }
}

/// Delta pushed on `account:update`. Absent and `null` fields both decode
/// to `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountUpdate {
    pub account_id: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_margin: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_status: Option<ConnectionStatus>,
}

impl<'de> Deserialize<'de> for AccountUpdate {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let mut m = Map::<String, JsonValue>::deserialize(d)?;
        let account_id = take_id(&mut m, &["accountId", "id", "_id"])
            .ok_or_else(|| de::Error::custom("account update without a usable id"))?;
        Ok(AccountUpdate {
            account_id,
            balance: take_f64(&mut m, "balance"),
            equity: take_f64(&mut m, "equity"),
            margin: take_f64(&mut m, "margin"),
            free_margin: take_f64(&mut m, "freeMargin"),
            margin_level: take_f64(&mut m, "marginLevel"),
            connection_status: take_status(&mut m, "connectionStatus"),
        })
    }
}

impl AccountUpdate {
    pub fn new(account_id: impl AsRef<str>) -> Self {
        Self {
            account_id: AccountId::new(account_id),
            balance: None,
            equity: None,
            margin: None,
            free_margin: None,
            margin_level: None,
            connection_status: None,
        }
    }
}

pub type AccountList = Arc<Vec<Arc<Account>>>;

/// Produces the patched list, or `None` when no cached account matches.
///
/// Entries that do not match are shared with the input list (same `Arc`).
pub fn apply_update(accounts: &AccountList, update: &AccountUpdate) -> Option<AccountList> {
    if !accounts.iter().any(|a| a.id == update.account_id) {
        return None;
    }
    let patched = accounts
        .iter()
        .map(|a| {
            if a.id == update.account_id {
                Arc::new(a.merged(update))
            } else {
                Arc::clone(a)
            }
        })
        .collect::<Vec<_>>();
    Some(Arc::new(patched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(accounts: Vec<Account>) -> AccountList {
        Arc::new(accounts.into_iter().map(Arc::new).collect())
    }

    fn a1() -> Account {
        serde_json::from_value(json!({
            "id": "A1",
            "balance": 100.0,
            "equity": 100.0,
            "connectionStatus": "online",
        }))
        .unwrap()
    }

    #[test]
    fn equity_patch_keeps_other_fields() {
        let accounts = cache(vec![a1()]);
        let update: AccountUpdate =
            serde_json::from_value(json!({"accountId": "A1", "equity": 150.0})).unwrap();

        let out = apply_update(&accounts, &update).unwrap();
        let a = &out[0];
        assert_eq!(a.id.as_str(), "A1");
        assert_eq!(a.balance, Some(100.0));
        assert_eq!(a.equity, Some(150.0));
        assert_eq!(a.connection_status, ConnectionStatus::Online);
    }

    #[test]
    fn null_fields_do_not_overwrite() {
        let mut acct = a1();
        acct.margin = Some(12.0);
        acct.free_margin = Some(88.0);
        acct.margin_level = Some(833.3);
        let accounts = cache(vec![acct.clone()]);

        let update: AccountUpdate = serde_json::from_value(json!({
            "accountId": "A1",
            "balance": null,
            "equity": null,
            "margin": null,
            "freeMargin": null,
            "marginLevel": null,
            "connectionStatus": null,
        }))
        .unwrap();

        let out = apply_update(&accounts, &update).unwrap();
        assert_eq!(*out[0], acct);
    }

    #[test]
    fn numeric_fields_replace() {
        let accounts = cache(vec![a1()]);
        let update: AccountUpdate = serde_json::from_value(json!({
            "accountId": "A1",
            "balance": 90.5,
            "equity": 0.0,
            "margin": 3.0,
            "freeMargin": 87.5,
            "marginLevel": 2916.6,
        }))
        .unwrap();

        let out = apply_update(&accounts, &update).unwrap();
        assert_eq!(out[0].balance, Some(90.5));
        assert_eq!(out[0].equity, Some(0.0));
        assert_eq!(out[0].margin, Some(3.0));
        assert_eq!(out[0].free_margin, Some(87.5));
        assert_eq!(out[0].margin_level, Some(2916.6));
    }

    #[test]
    fn empty_connection_status_is_ignored() {
        let accounts = cache(vec![a1()]);
        let update: AccountUpdate =
            serde_json::from_value(json!({"accountId": "A1", "connectionStatus": ""})).unwrap();
        let out = apply_update(&accounts, &update).unwrap();
        assert_eq!(out[0].connection_status, ConnectionStatus::Online);

        let update: AccountUpdate =
            serde_json::from_value(json!({"accountId": "A1", "connectionStatus": "offline"}))
                .unwrap();
        let out = apply_update(&accounts, &update).unwrap();
        assert_eq!(out[0].connection_status, ConnectionStatus::Offline);
    }

    #[test]
    fn unknown_id_is_a_noop() {
        let accounts = cache(vec![a1(), Account::new("B2")]);
        let update = AccountUpdate {
            balance: Some(1.0),
            ..AccountUpdate::new("ZZ")
        };
        assert!(apply_update(&accounts, &update).is_none());
    }

    #[test]
    fn unrelated_entries_are_shared() {
        let accounts = cache(vec![a1(), Account::new("B2")]);
        let update = AccountUpdate {
            equity: Some(5.0),
            ..AccountUpdate::new("A1")
        };
        let out = apply_update(&accounts, &update).unwrap();
        assert!(Arc::ptr_eq(&out[1], &accounts[1]));
        assert!(!Arc::ptr_eq(&out[0], &accounts[0]));
    }

    #[test]
    fn applying_twice_matches_applying_once() {
        let accounts = cache(vec![a1(), Account::new("B2")]);
        let update = AccountUpdate {
            balance: Some(42.0),
            connection_status: Some(ConnectionStatus::Offline),
            ..AccountUpdate::new("A1")
        };
        let once = apply_update(&accounts, &update).unwrap();
        let twice = apply_update(&once, &update).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn wrapped_and_plain_ids_match() {
        let accounts = cache(vec![serde_json::from_value(json!({"_id": "65f0c0ffee"})).unwrap()]);

        for raw in [
            json!("65f0c0ffee"),
            json!("  65f0c0ffee "),
            json!({"$oid": "65f0c0ffee"}),
            json!({"_id": "65f0c0ffee"}),
        ] {
            let update: AccountUpdate =
                serde_json::from_value(json!({"accountId": raw, "balance": 7.0})).unwrap();
            let out = apply_update(&accounts, &update).expect("id should match");
            assert_eq!(out[0].balance, Some(7.0));
        }
    }

    #[test]
    fn numeric_ids_normalize_to_strings() {
        assert_eq!(AccountId::from_value(&json!(1234567)), Some(AccountId::new("1234567")));
        assert_eq!(AccountId::from_value(&json!("   ")), None);
        assert_eq!(AccountId::from_value(&json!(null)), None);
    }

    #[test]
    fn integral_float_ids_match_integer_ids() {
        assert_eq!(AccountId::from_value(&json!(12.0)), AccountId::from_value(&json!("12")));
        assert_eq!(AccountId::from_value(&json!(12)), Some(AccountId::new("12")));
        assert_eq!(AccountId::from_value(&json!(12.5)), Some(AccountId::new("12.5")));

        let accounts = cache(vec![Account::new("12")]);
        let update: AccountUpdate =
            serde_json::from_value(json!({"accountId": 12.0, "equity": 3.0})).unwrap();
        assert_eq!(apply_update(&accounts, &update).unwrap()[0].equity, Some(3.0));
    }

    #[test]
    fn duplicate_id_keys_decode() {
        let acct: Account =
            serde_json::from_value(json!({"_id": "A1", "id": "A1", "balance": 10.0})).unwrap();
        assert_eq!(acct.id.as_str(), "A1");
        assert!(!acct.extra.contains_key("_id"));

        // `id` wins over a wrapped `_id` on accounts.
        let acct: Account =
            serde_json::from_value(json!({"_id": {"$oid": "65f0"}, "id": "A2"})).unwrap();
        assert_eq!(acct.id.as_str(), "A2");

        // `accountId` wins on deltas; the event's own `_id` is ignored.
        let update: AccountUpdate =
            serde_json::from_value(json!({"accountId": "A1", "_id": "evt-9", "equity": 5})).unwrap();
        assert_eq!(update.account_id.as_str(), "A1");
        assert_eq!(update.equity, Some(5.0));

        let update: AccountUpdate =
            serde_json::from_value(json!({"id": "", "_id": "A3"})).unwrap();
        assert_eq!(update.account_id.as_str(), "A3");

        assert!(serde_json::from_value::<AccountUpdate>(json!({"equity": 1.0})).is_err());
        assert!(serde_json::from_value::<Account>(json!({"id": null})).is_err());
    }

    #[test]
    fn extra_fields_round_trip() {
        let acct: Account = serde_json::from_value(json!({
            "id": "A1",
            "login": "5001234",
            "server": "Broker-Live",
            "role": "master",
        }))
        .unwrap();
        assert_eq!(acct.extra.get("login"), Some(&json!("5001234")));
        assert_eq!(acct.connection_status, ConnectionStatus::Unknown);

        let v = serde_json::to_value(&acct).unwrap();
        assert_eq!(v["role"], json!("master"));
        assert_eq!(v["connectionStatus"], json!("unknown"));
    }
}
