use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

/// Identity of one granted lease. Ids increase monotonically per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HolderId(u64);

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub holder: HolderId,
    pub granted_at: Instant,
    pub ttl: Duration,
}

impl Lease {
    pub fn expires_at(&self) -> Instant {
        self.granted_at + self.ttl
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.expires_at().saturating_duration_since(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted {
        lease: Lease,
        /// Holder whose expired lease was reclaimed to make room, if any.
        reclaimed: Option<HolderId>,
    },
    Denied {
        holder: HolderId,
        remaining: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The holder no longer owns the permit (its lease expired and was
    /// reclaimed, or it was already released).
    Stale,
}

#[derive(Debug, Default)]
struct PermitSlot {
    current: Option<Lease>,
    last_holder: u64,
}

/// The single binary permit, held as a lease with a holder id and a ttl.
///
/// Contested acquires are denied, never queued.
#[derive(Debug)]
pub struct PermitTable {
    ttl: Duration,
    slot: Mutex<PermitSlot>,
}

impl PermitTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(PermitSlot::default()),
        }
    }

    pub fn try_acquire(&self) -> AcquireOutcome {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> AcquireOutcome {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let mut reclaimed = None;
        if let Some(current) = slot.current {
            if !current.is_expired_at(now) {
                return AcquireOutcome::Denied {
                    holder: current.holder,
                    remaining: current.remaining_at(now),
                };
            }
            reclaimed = Some(current.holder);
        }
        slot.last_holder += 1;
        let lease = Lease {
            holder: HolderId(slot.last_holder),
            granted_at: now,
            ttl: self.ttl,
        };
        slot.current = Some(lease);
        AcquireOutcome::Granted { lease, reclaimed }
    }

    pub fn release(&self, holder: HolderId) -> ReleaseOutcome {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.current {
            Some(current) if current.holder == holder => {
                slot.current = None;
                ReleaseOutcome::Released
            }
            _ => ReleaseOutcome::Stale,
        }
    }

    pub fn current(&self) -> Option<Lease> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
    }

    pub fn is_held_at(&self, now: Instant) -> bool {
        self.current()
            .is_some_and(|lease| !lease.is_expired_at(now))
    }
}
