use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Booking status. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Pending,
        Status::Confirmed,
        Status::Completed,
        Status::Cancelled,
    ];

    /// Statuses that occupy the provider's calendar.
    pub const ACTIVE: [Status; 2] = [Status::Pending, Status::Confirmed];

    pub fn is_terminal(self) -> bool {
        match self {
            Status::Completed | Status::Cancelled => true,
            Status::Pending | Status::Confirmed => false,
        }
    }

    pub fn is_active(self) -> bool {
        match self {
            Status::Pending | Status::Confirmed => true,
            Status::Completed | Status::Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Confirmed => "confirmed",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "confirmed" => Ok(Status::Confirmed),
            "completed" => Ok(Status::Completed),
            "cancelled" => Ok(Status::Cancelled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Who is acting on a booking, relative to that booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Provider,
    Requester,
    /// Automatic trigger (e.g. auto-completion after `end_time`).
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Provider => "provider",
            Role::Requester => "requester",
            Role::System => "system",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub requester_id: Ulid,
    pub span: Span,
    pub status: Status,
    pub message: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    /// Role of `actor` relative to this booking, if they are a party to it.
    pub fn role_of(&self, actor: Ulid) -> Option<Role> {
        if actor == self.provider_id {
            Some(Role::Provider)
        } else if actor == self.requester_id {
            Some(Role::Requester)
        } else {
            None
        }
    }
}

/// Everything needed to insert a new booking; the store assigns `Pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDraft {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub requester_id: Ulid,
    pub span: Span,
    pub message: Option<String>,
    pub created_at: Ms,
}

impl BookingDraft {
    pub fn into_booking(self) -> Booking {
        Booking {
            id: self.id,
            provider_id: self.provider_id,
            requester_id: self.requester_id,
            span: self.span,
            status: Status::Pending,
            message: self.message,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// A colliding booking, reported back to the requester for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictingBooking {
    pub id: Ulid,
    pub span: Span,
    pub status: Status,
}

impl From<&Booking> for ConflictingBooking {
    fn from(b: &Booking) -> Self {
        Self {
            id: b.id,
            span: b.span,
            status: b.status,
        }
    }
}

/// A provider's calendar: active bookings only, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct ProviderSchedule {
    pub entries: Vec<ConflictingBooking>,
}

impl ProviderSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert entry maintaining sort order by span.start.
    pub fn insert(&mut self, entry: ConflictingBooking) {
        let pos = self
            .entries
            .binary_search_by_key(&entry.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<ConflictingBooking> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    pub fn set_status(&mut self, id: Ulid, status: Status) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.id == id) {
            e.status = status;
        }
    }

    /// Return only entries whose span overlaps the query window.
    /// Uses binary search to skip entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ConflictingBooking> {
        let right_bound = self.entries.partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Lifecycle events ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "booking.created")]
    Created,
    #[serde(rename = "booking.confirmed")]
    Confirmed,
    #[serde(rename = "booking.cancelled")]
    Cancelled,
    #[serde(rename = "booking.completed")]
    Completed,
}

impl EventKind {
    /// Event emitted when a booking enters `status`. `Pending` is only ever
    /// entered on creation.
    pub fn for_status(status: Status) -> Self {
        match status {
            Status::Pending => EventKind::Created,
            Status::Confirmed => EventKind::Confirmed,
            Status::Cancelled => EventKind::Cancelled,
            Status::Completed => EventKind::Completed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Created => "booking.created",
            EventKind::Confirmed => "booking.confirmed",
            EventKind::Cancelled => "booking.cancelled",
            EventKind::Completed => "booking.completed",
        }
    }
}

/// What the notification bridge, unread counter and audit log consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingEvent {
    pub kind: EventKind,
    pub booking_id: Ulid,
    pub provider_id: Ulid,
    pub requester_id: Ulid,
    pub timestamp: Ms,
}

impl BookingEvent {
    pub fn new(kind: EventKind, booking: &Booking, timestamp: Ms) -> Self {
        Self {
            kind,
            booking_id: booking.id,
            provider_id: booking.provider_id,
            requester_id: booking.requester_id,
            timestamp,
        }
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// The WAL record format, flat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Created(Booking),
    StatusChanged {
        id: Ulid,
        provider_id: Ulid,
        status: Status,
        /// `None` for system-driven changes (auto-completion).
        actor_id: Option<Ulid>,
        updated_at: Ms,
    },
}

impl Record {
    pub fn booking_id(&self) -> Ulid {
        match self {
            Record::Created(b) => b.id,
            Record::StatusChanged { id, .. } => *id,
        }
    }

    pub fn provider_id(&self) -> Ulid {
        match self {
            Record::Created(b) => b.provider_id,
            Record::StatusChanged { provider_id, .. } => *provider_id,
        }
    }
}
