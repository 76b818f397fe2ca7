use std::slice::Iter;

use crate::id::Identifier;
use crate::routing::contact::{Contact, ContactStatus};

/// Default maximum number of contacts that should reside in any bucket.
pub const DEFAULT_BUCKET_SIZE: usize = 20;

/// Result of offering a contact to a bucket.
#[derive(Debug)]
pub enum InsertOutcome {
    /// The contact took a free (or bad) slot.
    Inserted,
    /// The contact was already present and its metadata got refreshed.
    Updated,
    /// The bucket is full of live contacts. The caller should ping `oldest` and only replace it
    /// if it does not answer.
    Full { oldest: Contact },
}

/// Bucket containing contacts with identical bit prefixes, least recently seen first.
pub struct Bucket {
    contacts: Vec<Contact>,
    capacity: usize,
}

impl Bucket {
    /// Create a new empty bucket holding at most `capacity` contacts.
    pub fn new(capacity: usize) -> Bucket {
        Bucket {
            contacts: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Iterator over all good and questionable contacts in the bucket.
    pub fn online_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter().filter(|contact| contact.is_online())
    }

    /// Iterator over each contact within the bucket, least recently seen first.
    pub fn iter(&self) -> Iter<Contact> {
        self.contacts.iter()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn find_mut(&mut self, id: &Identifier) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|contact| contact.id() == *id)
    }

    /// Indicates if the bucket has not heard from any of its contacts recently.
    pub fn needs_refresh(&self) -> bool {
        self.contacts
            .iter()
            .all(|contact| contact.status() != ContactStatus::Good)
    }

    /// Offer a contact to the bucket.
    pub fn add_contact(&mut self, new_contact: Contact) -> InsertOutcome {
        // Known peer: refresh it in place, and move it to the tail if it has just been seen.
        if let Some(index) = self.contacts.iter().position(|c| *c == new_contact) {
            let seen = new_contact.last_active().is_some();
            self.contacts[index].update(new_contact);

            if seen {
                let contact = self.contacts.remove(index);
                self.contacts.push(contact);
            }

            return InsertOutcome::Updated;
        }

        if self.contacts.len() < self.capacity {
            self.contacts.push(new_contact);
            return InsertOutcome::Inserted;
        }

        // Bad contacts are replaced without asking.
        if let Some(index) = self
            .contacts
            .iter()
            .position(|c| c.status() == ContactStatus::Bad)
        {
            self.contacts.remove(index);
            self.contacts.push(new_contact);
            return InsertOutcome::Inserted;
        }

        InsertOutcome::Full {
            oldest: self.contacts[0].clone(),
        }
    }

    /// Evict `oldest` (which failed to answer a ping) in favour of `new_contact`.
    ///
    /// Returns false if `oldest` is no longer in the bucket and there is no room, in which case
    /// the new contact is dropped. A contact that made it into the bucket in the meantime is only
    /// refreshed.
    pub fn replace(&mut self, oldest: &Identifier, new_contact: Contact) -> bool {
        if let Some(contact) = self.contacts.iter_mut().find(|c| **c == new_contact) {
            contact.update(new_contact);
            return true;
        }

        if let Some(index) = self.contacts.iter().position(|c| c.id() == *oldest) {
            self.contacts.remove(index);
        }

        if self.contacts.len() < self.capacity {
            self.contacts.push(new_contact);
            true
        } else {
            false
        }
    }

    /// Mark a contact as just seen, moving it to the most recently seen end.
    pub fn mark_seen(&mut self, id: &Identifier) {
        if let Some(index) = self.contacts.iter().position(|c| c.id() == *id) {
            let mut contact = self.contacts.remove(index);
            let addr = contact.addr();
            contact.touch(addr);
            self.contacts.push(contact);
        }
    }
}

// ----------------------------------------------------------------------------//
