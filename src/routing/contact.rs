use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::id::Identifier;

/// Maximum wait period before a contact becomes questionable.
const MAX_LAST_SEEN_MINS: u64 = 15;

/// Maximum number of unanswered requests before a contact becomes bad.
const MAX_FAILED_REQUESTS: usize = 2;

/// Status of the contact.
/// Ordering of the enumerations is important, variants higher
/// up are considered to be less than those further down.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Ord, PartialOrd)]
pub enum ContactStatus {
    Bad,
    Questionable,
    Good,
}

/// Identity and address of a peer, as carried on the wire and handed out to callers.
///
/// Equality and hashing only consider the identifier: the same peer reachable on another address
/// is still the same peer.
#[derive(Clone, Serialize, Deserialize)]
pub struct ContactInfo {
    pub id: Identifier,
    pub machine_id: String,
    pub addr: SocketAddr,
}

impl ContactInfo {
    pub fn new(id: Identifier, machine_id: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            id,
            machine_id: machine_id.into(),
            addr,
        }
    }
}

impl Eq for ContactInfo {}

impl PartialEq for ContactInfo {
    fn eq(&self, other: &ContactInfo) -> bool {
        self.id == other.id
    }
}

impl Hash for ContactInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for ContactInfo {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}@{}({})", self.id, self.addr, self.machine_id)
    }
}

/// A known peer together with its liveness metadata.
#[derive(Clone)]
pub struct Contact {
    info: ContactInfo,
    last_active: Option<Instant>,
    failed_requests: usize,
}

impl Contact {
    /// Create a contact that has just talked to us (handshake, request or response).
    pub fn as_good(info: ContactInfo) -> Contact {
        Contact {
            info,
            last_active: Some(Instant::now()),
            failed_requests: 0,
        }
    }

    /// Create a contact we only heard about from another peer.
    pub fn as_questionable(info: ContactInfo) -> Contact {
        Contact {
            info,
            last_active: None,
            failed_requests: 0,
        }
    }

    /// Create a contact that is known not to answer.
    pub fn as_bad(info: ContactInfo) -> Contact {
        Contact {
            info,
            last_active: None,
            failed_requests: MAX_FAILED_REQUESTS,
        }
    }

    /// Record that a message arrived from the contact, possibly over a new network path.
    pub fn touch(&mut self, addr: SocketAddr) {
        self.info.addr = addr;
        self.last_active = Some(Instant::now());
        self.failed_requests = 0;
    }

    /// Record that a request we sent to the contact went unanswered.
    pub fn request_failed(&mut self) {
        self.failed_requests = self.failed_requests.saturating_add(1);
    }

    /// Merge what we learned from `other` (the same peer) into this entry without losing the
    /// liveness we already observed.
    pub fn update(&mut self, other: Contact) {
        if other.last_active.is_some() {
            self.info = other.info;
            self.last_active = other.last_active;
            self.failed_requests = 0;
        } else if self.last_active.is_none() {
            // Only hearsay on both sides: take the fresher address.
            self.info.addr = other.info.addr;
        }
    }

    pub fn id(&self) -> Identifier {
        self.info.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.info.addr
    }

    pub fn machine_id(&self) -> &str {
        &self.info.machine_id
    }

    pub fn info(&self) -> &ContactInfo {
        &self.info
    }

    pub fn last_active(&self) -> Option<Instant> {
        self.last_active
    }

    /// Current status of the contact.
    pub fn status(&self) -> ContactStatus {
        if self.failed_requests >= MAX_FAILED_REQUESTS {
            return ContactStatus::Bad;
        }

        match self.last_active {
            Some(time) if time.elapsed() < Duration::from_secs(MAX_LAST_SEEN_MINS * 60) => {
                ContactStatus::Good
            }
            _ => ContactStatus::Questionable,
        }
    }

    /// Is contact good or questionable?
    pub fn is_online(&self) -> bool {
        self.status() != ContactStatus::Bad
    }

    #[cfg(test)]
    pub(crate) fn set_last_active(&mut self, time: Option<Instant>) {
        self.last_active = time;
    }
}

impl Eq for Contact {}

impl PartialEq<Contact> for Contact {
    fn eq(&self, other: &Contact) -> bool {
        self.info == other.info
    }
}

impl Hash for Contact {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.info.hash(state);
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Contact")
            .field("id", &self.info.id)
            .field("machine_id", &self.info.machine_id)
            .field("addr", &self.info.addr)
            .field("last_active", &self.last_active)
            .field("failed_requests", &self.failed_requests)
            .finish()
    }
}
