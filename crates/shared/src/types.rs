//! Subscription domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Error returned when a stored or provider string does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Subscription tier, ordered from lowest to highest
///
/// The derived ordering follows declaration order and is what the
/// reconciler uses to pick a winner among concurrent subscriptions.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Baby,
    Premium,
    Pro,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Baby => "baby",
            Tier::Premium => "premium",
            Tier::Pro => "pro",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "baby" => Ok(Tier::Baby),
            "premium" => Ok(Tier::Premium),
            "pro" => Ok(Tier::Pro),
            other => Err(ParseEnumError {
                kind: "tier",
                value: other.to_string(),
            }),
        }
    }
}

/// Provider subscription status, mirrored locally
///
/// `None` is the local marker for "no subscription at all".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    None,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    /// Statuses that count toward tier computation.
    ///
    /// Past-due subscriptions keep their tier while the provider retries payment.
    pub fn is_active_like(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(SubscriptionStatus::None),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            // the provider spells it both ways depending on API version
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Canceled),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "paused" => Ok(SubscriptionStatus::Paused),
            other => Err(ParseEnumError {
                kind: "subscription status",
                value: other.to_string(),
            }),
        }
    }
}

/// The single derived subscription state stored per user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSnapshot {
    pub status: SubscriptionStatus,
    pub tier: Tier,
    pub price_ref: Option<String>,
    pub subscription_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
}

impl CanonicalSnapshot {
    /// Snapshot for a user with no active-like subscription
    pub fn free() -> Self {
        Self {
            status: SubscriptionStatus::None,
            tier: Tier::Free,
            price_ref: None,
            subscription_ref: None,
            period_end: None,
        }
    }
}

impl Default for CanonicalSnapshot {
    fn default() -> Self {
        Self::free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_total_order() {
        assert!(Tier::Free < Tier::Baby);
        assert!(Tier::Baby < Tier::Premium);
        assert!(Tier::Premium < Tier::Pro);
        assert_eq!(
            [Tier::Premium, Tier::Free, Tier::Pro, Tier::Baby].iter().max(),
            Some(&Tier::Pro)
        );
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("premium".parse::<Tier>(), Ok(Tier::Premium));
        assert_eq!(" PRO ".parse::<Tier>(), Ok(Tier::Pro));
        assert!("enterprise".parse::<Tier>().is_err());
        assert_eq!(Tier::Baby.to_string(), "baby");
    }

    #[test]
    fn test_active_like_statuses() {
        assert!(SubscriptionStatus::Active.is_active_like());
        assert!(SubscriptionStatus::Trialing.is_active_like());
        assert!(SubscriptionStatus::PastDue.is_active_like());
        assert!(!SubscriptionStatus::Canceled.is_active_like());
        assert!(!SubscriptionStatus::Incomplete.is_active_like());
        assert!(!SubscriptionStatus::None.is_active_like());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            SubscriptionStatus::None,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::IncompleteExpired,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>(), Ok(status));
        }
        assert_eq!(
            "cancelled".parse::<SubscriptionStatus>(),
            Ok(SubscriptionStatus::Canceled)
        );
    }

    #[test]
    fn test_free_snapshot_serialization() {
        let json = serde_json::to_value(CanonicalSnapshot::free()).unwrap();
        assert_eq!(json["status"], "none");
        assert_eq!(json["tier"], "free");
        assert!(json["price_ref"].is_null());
        assert!(json["period_end"].is_null());
    }
}
