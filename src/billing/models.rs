use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// key: billing-models -> invoice items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BillingStatus {
    Pending,
    Paid,
    Active,
    Suspended,
    Terminated,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Pending => "Pending",
            BillingStatus::Paid => "Paid",
            BillingStatus::Active => "Active",
            BillingStatus::Suspended => "Suspended",
            BillingStatus::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" | "unpaid" => Ok(BillingStatus::Pending),
            "paid" => Ok(BillingStatus::Paid),
            "active" => Ok(BillingStatus::Active),
            "suspended" => Ok(BillingStatus::Suspended),
            "terminated" | "cancelled" => Ok(BillingStatus::Terminated),
            other => Err(format!("unknown billing status '{other}'")),
        }
    }
}

/// Line item as the billing system stores it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingItem {
    pub id: i32,
    pub invoice_id: i32,
    pub client_id: i32,
    pub description: String,
    pub status: BillingStatus,
    pub notes: String,
    pub ip_address: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The only fields this service may write on a billing item.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingItemUpdate {
    pub status: BillingStatus,
    pub notes: Option<String>,
    pub ip_address: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl BillingItemUpdate {
    pub fn status(status: BillingStatus, at: DateTime<Utc>) -> Self {
        Self {
            status,
            notes: None,
            ip_address: None,
            updated_at: at,
        }
    }

    pub fn with_ip_address(mut self, ip_address: Option<String>) -> Self {
        self.ip_address = ip_address;
        self
    }
}
