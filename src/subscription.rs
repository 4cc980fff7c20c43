use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

use crate::utils::days_remaining;

// Declaration order is the gating order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    #[default]
    Basic,
    EaLicense,
    FullAccess,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Basic => "BASIC",
            Tier::EaLicense => "EA_LICENSE",
            Tier::FullAccess => "FULL_ACCESS",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Tier::Basic => "Basic",
            Tier::EaLicense => "EA License",
            Tier::FullAccess => "Full Access",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().replace(['-', ' '], "_").as_str() {
            "BASIC" => Some(Tier::Basic),
            "EA_LICENSE" => Some(Tier::EaLicense),
            "FULL_ACCESS" => Some(Tier::FullAccess),
            _ => None,
        }
    }

    pub fn base_allotment(&self) -> Allotment {
        match self {
            Tier::Basic => Allotment { masters: 0, slaves: 0 },
            Tier::EaLicense => Allotment { masters: 1, slaves: 3 },
            Tier::FullAccess => Allotment { masters: 2, slaves: 10 },
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

impl<'de> Deserialize<'de> for Tier {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Tier::parse(&raw).ok_or_else(|| de::Error::custom(format!("unknown tier: {raw:?}")))
    }
}

// `null` decodes like a missing key.
fn de_null_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

// Counts and percentages: accepts floats and numeric strings, anything else is 0.
fn de_lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    let v = Option::<JsonValue>::deserialize(d)?;
    let n = match v {
        Some(JsonValue::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64),
        _ => None,
    };
    Ok(n.unwrap_or(0))
}

// Unknown or malformed tier names read as absent.
fn de_tier_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Tier>, D::Error> {
    let v = Option::<JsonValue>::deserialize(d)?;
    Ok(v.as_ref().and_then(|x| x.as_str()).and_then(Tier::parse))
}

fn de_tier<'de, D: Deserializer<'de>>(d: D) -> Result<Tier, D::Error> {
    Ok(de_tier_opt(d)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allotment {
    pub masters: u32,
    pub slaves: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    pub total_masters: u32,
    pub total_slaves: u32,
}

// Snapshot as returned by `GET /subscriptions/hybrid`. Read-only: nothing
// here moves a subscription between phases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionSnapshot {
    #[serde(deserialize_with = "de_tier")]
    pub subscription_tier: Tier,
    #[serde(deserialize_with = "de_tier_opt")]
    pub base_tier: Option<Tier>,
    #[serde(deserialize_with = "de_null_default")]
    pub is_expired: bool,
    #[serde(deserialize_with = "de_null_default")]
    pub trial_claimed: bool,
    pub trial_expiry_date: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "de_null_default")]
    pub trial_disabled: bool,
    pub grace_period_end_date: Option<DateTime<Utc>>,
    pub renewal_date: Option<DateTime<Utc>>,
    // Signed on purpose: a misbehaving backend has sent negatives.
    #[serde(deserialize_with = "de_lenient_i64")]
    pub additional_masters: i64,
    #[serde(deserialize_with = "de_lenient_i64")]
    pub additional_slaves: i64,
    #[serde(deserialize_with = "de_null_default")]
    pub is_client: bool,
    #[serde(deserialize_with = "de_lenient_i64")]
    pub client_discount_percentage: i64,
    #[serde(deserialize_with = "de_lenient_i64")]
    pub special_discount_percentage: i64,
    pub special_discount_expiry_date: Option<DateTime<Utc>>,
    pub special_discount_description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionPhase {
    TrialActive,
    TrialExpiredDisabled,
    PaidActive,
    PaidGrace,
    BasicNoEntitlement,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountSummary {
    // only when flagged as a client
    pub client_percentage: Option<u8>,
    pub special_percentage: u8,
    pub special_expiry_date: Option<DateTime<Utc>>,
    pub special_description: Option<String>,
    pub special_active: bool,
    pub special_days_remaining: Option<i64>,
}

fn clamp_percentage(p: i64) -> u8 {
    p.clamp(0, 100) as u8
}

impl SubscriptionSnapshot {
    pub fn allotment_tier(&self) -> Tier {
        self.base_tier.unwrap_or(self.subscription_tier)
    }

    pub fn limits(&self) -> Limits {
        let base = self.allotment_tier().base_allotment();
        let extra_m = self.additional_masters.clamp(0, u32::MAX as i64) as u32;
        let extra_s = self.additional_slaves.clamp(0, u32::MAX as i64) as u32;
        Limits {
            total_masters: base.masters.saturating_add(extra_m),
            total_slaves: base.slaves.saturating_add(extra_s),
        }
    }

    pub fn is_on_trial(&self, now: DateTime<Utc>) -> bool {
        self.trial_claimed && self.trial_expiry_date.is_some_and(|exp| exp > now)
    }

    pub fn in_grace_period(&self, now: DateTime<Utc>) -> bool {
        self.is_expired && self.grace_period_end_date.is_some_and(|end| end > now)
    }

    // An active trial lifts the user to EA License.
    pub fn gating_tier(&self, now: DateTime<Utc>) -> Tier {
        if self.is_on_trial(now) {
            self.subscription_tier.max(Tier::EaLicense)
        } else {
            self.subscription_tier
        }
    }

    // Expiry closes gated features, grace period or not.
    pub fn can_access_feature(&self, required: Tier, now: DateTime<Utc>) -> bool {
        if required == Tier::Basic {
            return true;
        }
        !self.is_expired && self.gating_tier(now) >= required
    }

    pub fn trial_days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.trial_expiry_date
            .filter(|_| self.trial_claimed)
            .map(|d| days_remaining(d, now))
    }

    pub fn grace_days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.grace_period_end_date
            .filter(|_| self.is_expired)
            .map(|d| days_remaining(d, now))
    }

    pub fn renewal_days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.renewal_date.map(|d| days_remaining(d, now))
    }

    pub fn phase(&self, now: DateTime<Utc>) -> SubscriptionPhase {
        if self.is_on_trial(now) {
            SubscriptionPhase::TrialActive
        } else if self.in_grace_period(now) {
            SubscriptionPhase::PaidGrace
        } else if !self.is_expired && self.subscription_tier > Tier::Basic {
            SubscriptionPhase::PaidActive
        } else if self.trial_claimed || self.trial_disabled {
            SubscriptionPhase::TrialExpiredDisabled
        } else {
            SubscriptionPhase::BasicNoEntitlement
        }
    }

    pub fn status_label(&self, now: DateTime<Utc>) -> String {
        if self.is_expired {
            if let Some(days) = self.grace_days_remaining(now).filter(|d| *d > 0) {
                return format!("Expired (Grace Period: {days} days left)");
            }
            if self.subscription_tier == Tier::Basic && self.base_tier.is_some() {
                return "Expired (Moved to Basic)".to_string();
            }
            return "Expired".to_string();
        }
        if self.is_on_trial(now) {
            let days = self.trial_days_remaining(now).unwrap_or(0);
            return format!("Trial ({days} days left)");
        }
        self.subscription_tier.display_name().to_string()
    }

    pub fn discounts(&self, now: DateTime<Utc>) -> DiscountSummary {
        let special_percentage = clamp_percentage(self.special_discount_percentage);
        let special_active = special_percentage > 0
            && self
                .special_discount_expiry_date
                .map_or(true, |exp| exp > now);
        DiscountSummary {
            client_percentage: self
                .is_client
                .then(|| clamp_percentage(self.client_discount_percentage)),
            special_percentage,
            special_expiry_date: self.special_discount_expiry_date,
            special_description: self.special_discount_description.clone(),
            special_active,
            special_days_remaining: self
                .special_discount_expiry_date
                .map(|d| days_remaining(d, now)),
        }
    }

    pub fn entitlements(&self, now: DateTime<Utc>) -> Entitlements {
        Entitlements {
            subscription_tier: self.subscription_tier,
            base_tier: self.base_tier,
            gating_tier: self.gating_tier(now),
            is_expired: self.is_expired,
            is_on_trial: self.is_on_trial(now),
            in_grace_period: self.in_grace_period(now),
            can_access_ea_license: self.can_access_feature(Tier::EaLicense, now),
            can_access_full_access: self.can_access_feature(Tier::FullAccess, now),
            limits: self.limits(),
            trial_days_remaining: self.trial_days_remaining(now),
            grace_days_remaining: self.grace_days_remaining(now),
            renewal_days_remaining: self.renewal_days_remaining(now),
            status_label: self.status_label(now),
            phase: self.phase(now),
            discounts: self.discounts(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlements {
    pub subscription_tier: Tier,
    pub base_tier: Option<Tier>,
    pub gating_tier: Tier,
    pub is_expired: bool,
    pub is_on_trial: bool,
    pub in_grace_period: bool,
    pub can_access_ea_license: bool,
    pub can_access_full_access: bool,
    pub limits: Limits,
    pub trial_days_remaining: Option<i64>,
    pub grace_days_remaining: Option<i64>,
    pub renewal_days_remaining: Option<i64>,
    pub status_label: String,
    pub phase: SubscriptionPhase,
    pub discounts: DiscountSummary,
}

impl Entitlements {
    pub fn can_access_feature(&self, required: Tier) -> bool {
        match required {
            Tier::Basic => true,
            Tier::EaLicense => self.can_access_ea_license,
            Tier::FullAccess => self.can_access_full_access,
        }
    }
}
