use serde::{Deserialize, Serialize};

/// A trading account. Credentials and proxy assignments hang off it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub user: Option<String>,
    pub active: bool,
    /// Admin accounts may run without an egress proxy; nobody else may.
    pub is_admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    Active,
    Standby,
    Burned,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Active => "active",
            ProxyStatus::Standby => "standby",
            ProxyStatus::Burned => "burned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ProxyStatus::Active),
            "standby" => Some(ProxyStatus::Standby),
            "burned" => Some(ProxyStatus::Burned),
            _ => None,
        }
    }
}

/// Binding of one egress proxy to one account. Proxies are never shared
/// across accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAssignment {
    pub account: String,
    pub proxy_url: String,
    pub priority: i64,
    pub status: ProxyStatus,
}
