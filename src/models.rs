//! Domain payload models
//!
//! The entity collections the app caches and displays: directory members,
//! events, and announcements. Shapes mirror the REST API's JSON (snake_case
//! fields, trailing-slash collection endpoints).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Entity Kinds
// ============================================================================

/// The cached entity collections, one per REST resource.
///
/// Each kind names its persisted cache key and the endpoint serving the full
/// collection; the cache layer attaches a freshness window per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Members,
    Events,
    Announcements,
}

impl EntityKind {
    /// Every kind, in refresh order.
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Members,
        EntityKind::Events,
        EntityKind::Announcements,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Members => "members",
            EntityKind::Events => "events",
            EntityKind::Announcements => "announcements",
        }
    }

    /// Key the cached envelope is persisted under.
    pub fn cache_key(&self) -> &'static str {
        match self {
            EntityKind::Members => "cache:members",
            EntityKind::Events => "cache:events",
            EntityKind::Announcements => "cache:announcements",
        }
    }

    /// REST endpoint serving the full collection.
    pub fn endpoint(&self) -> &'static str {
        match self {
            EntityKind::Members => "/members/",
            EntityKind::Events => "/events/",
            EntityKind::Announcements => "/announcements/",
        }
    }
}

// ============================================================================
// Directory
// ============================================================================

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub birthday: Option<NaiveDate>,

    /// Ministry groups the member serves in ("choir", "ushers", ...)
    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Member {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

// ============================================================================
// Events
// ============================================================================

/// A scheduled service, rehearsal, or gathering members can register for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub title: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    pub starts_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,

    /// Maximum registrations; None means unlimited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,

    #[serde(default)]
    pub registered_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Whether another registration still fits.
    pub fn has_capacity(&self) -> bool {
        match self.capacity {
            Some(cap) => self.registered_count < cap,
            None => true,
        }
    }
}

// ============================================================================
// Announcements
// ============================================================================

/// A parish-wide announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: i64,
    pub title: String,
    pub body: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    pub published_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Announcement {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |t| t <= now)
    }
}
