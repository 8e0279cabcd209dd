use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
    SuperAdmin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Admin => "admin",
            UserRole::SuperAdmin => "superadmin",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "admin" => UserRole::Admin,
            "superadmin" => UserRole::SuperAdmin,
            _ => UserRole::User,
        }
    }
}

/// A proxy tenant. Owns one listening port, one miner-facing login,
/// a set of upstream modes and a set of schedules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,

    /// Stable external identity used by all admin calls.
    pub tg_id: i64,

    pub username: Option<String>,
    pub role: UserRole,

    /// Dedicated listening port, unique across users.
    pub port: u16,

    /// Miner-facing account name (the part before the dot in `login.worker`).
    pub login: String,

    /// IANA timezone name, e.g. "Europe/Moscow".
    pub timezone: String,

    pub subscription_until: DateTime<Utc>,
}

impl User {
    pub fn is_subscription_active(&self, now: DateTime<Utc>) -> bool {
        now <= self.subscription_until
    }
}

/// A named upstream configuration. `host == "sleep"` with port 0 is the
/// sentinel "no upstream" mode every fresh user starts with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mode {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,

    /// Pool-account login presented upstream in place of the user's login.
    pub alias: String,

    pub is_active: bool,
}

pub const SLEEP_HOST: &str = "sleep";

impl Mode {
    pub fn is_sleep(&self) -> bool {
        self.host.eq_ignore_ascii_case(SLEEP_HOST) || self.port == 0
    }
}

/// A local-time window that selects a mode while it matches.
/// `start_time`/`end_time` are "HH:MM" strings in the owner's timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub user_id: i64,
    pub mode_id: i64,
    pub start_time: String,
    pub end_time: String,
}

/// One mining device of a user, keyed by the worker suffix of the
/// credential it authorizes with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub user_id: i64,
    pub worker: String,

    /// Numeric suffix parsed from the worker name, when present ("rig07" -> 7).
    pub suffix: Option<i64>,

    pub name: String,
    pub last_connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_online: bool,
}

/// Trailing digit run of a worker name, used to order devices naturally.
pub fn worker_suffix(worker: &str) -> Option<i64> {
    let digits: String = worker
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() || digits.len() == worker.len() {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Bep20,
    Trc20,
    Card,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Bep20 => "bep20",
            PaymentMethod::Trc20 => "trc20",
            PaymentMethod::Card => "card",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bep20" => Some(PaymentMethod::Bep20),
            "trc20" => Some(PaymentMethod::Trc20),
            "card" => Some(PaymentMethod::Card),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Approved => "approved",
            PaymentStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "approved" => PaymentStatus::Approved,
            "rejected" => PaymentStatus::Rejected,
            _ => PaymentStatus::Pending,
        }
    }
}

/// A subscription payment submitted by a user; the proxy only stores it
/// for the admin to approve or reject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub id: i64,
    pub user_id: i64,
    pub method: PaymentMethod,

    /// Opaque reference to the uploaded receipt; never interpreted here.
    pub file_id: String,

    pub created_at: DateTime<Utc>,
    pub status: PaymentStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_detection() {
        let m = Mode {
            id: 1,
            user_id: 1,
            name: "Sleep".to_string(),
            host: "sleep".to_string(),
            port: 0,
            alias: String::new(),
            is_active: true,
        };
        assert!(m.is_sleep());

        let live = Mode { host: "etc.2miners.com".to_string(), port: 1010, ..m };
        assert!(!live.is_sleep());
    }

    #[test]
    fn test_worker_suffix() {
        assert_eq!(worker_suffix("rig01"), Some(1));
        assert_eq!(worker_suffix("s19-7"), Some(7));
        assert_eq!(worker_suffix("rig"), None);
        assert_eq!(worker_suffix("123"), None);
        assert_eq!(worker_suffix(""), None);
    }
}
