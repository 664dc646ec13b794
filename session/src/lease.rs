use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseStatus {
    Active,
    /// Written to the store by a clean shutdown. Treated as expired.
    Stale,
    /// Removed by the reaper. Only ever seen on copies handed back to callers.
    Reclaimed,
}

impl LeaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseStatus::Active => "active",
            LeaseStatus::Stale => "stale",
            LeaseStatus::Reclaimed => "reclaimed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(LeaseStatus::Active),
            "stale" => Some(LeaseStatus::Stale),
            "reclaimed" => Some(LeaseStatus::Reclaimed),
            _ => None,
        }
    }
}

/// An exclusive, time-bounded grant on one file path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub path: String,
    pub session_id: String,
    pub token: String,
    pub client_ip: String,
    pub lease_time_us: i64,
    pub tolerance_time_us: i64,
    /// Creation time, moved forward on every renewal.
    pub create_time_us: i64,
    pub status: LeaseStatus,
}

impl Lease {
    /// Fresh grant with new session id and owner token.
    pub fn new(
        path: &str,
        client_ip: &str,
        lease_time_us: i64,
        tolerance_time_us: i64,
        now_us: i64,
    ) -> Self {
        Self {
            path: path.to_string(),
            session_id: Uuid::new_v4().to_string(),
            token: Uuid::new_v4().simple().to_string(),
            client_ip: client_ip.to_string(),
            lease_time_us,
            tolerance_time_us,
            create_time_us: now_us,
            status: LeaseStatus::Active,
        }
    }

    pub fn elapsed_us(&self, now_us: i64) -> i64 {
        now_us.saturating_sub(self.create_time_us)
    }

    /// Past the lease window, so a new grant may supersede it.
    pub fn is_expired(&self, now_us: i64) -> bool {
        self.status != LeaseStatus::Active || self.elapsed_us(now_us) >= self.lease_time_us
    }

    /// Past the lease window plus tolerance, so the reaper may delete it.
    pub fn is_reclaimable(&self, now_us: i64) -> bool {
        self.status != LeaseStatus::Active
            || self.elapsed_us(now_us) > self.lease_time_us.saturating_add(self.tolerance_time_us)
    }

    /// Moves the create time to `now_us`, never backwards.
    pub fn refresh(&mut self, now_us: i64) {
        self.create_time_us = self.create_time_us.max(now_us);
        self.status = LeaseStatus::Active;
    }
}
