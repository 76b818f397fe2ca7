use super::{
    bucket::{Bucket, InsertOutcome},
    contact::{Contact, ContactInfo, ContactStatus},
};
use crate::id::{Identifier, ID_LEN};

pub const MAX_BUCKETS: usize = ID_LEN * 8;

/// Routing table holding every known contact, bucketed by the length of the identifier prefix it
/// shares with the local identifier.
pub struct RoutingTable {
    // Index `i` holds contacts sharing exactly `i` leading bits with `local_id`.
    buckets: Vec<Bucket>,
    local_id: Identifier,
}

impl RoutingTable {
    /// Create a new RoutingTable with the given identifier as our id.
    pub fn new(local_id: Identifier, bucket_size: usize) -> RoutingTable {
        let buckets = (0..MAX_BUCKETS).map(|_| Bucket::new(bucket_size)).collect();

        RoutingTable { buckets, local_id }
    }

    /// Return the local identifier of the RoutingTable.
    pub fn local_id(&self) -> Identifier {
        self.local_id
    }

    /// Iterator over all buckets in the routing table.
    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> + ExactSizeIterator {
        self.buckets.iter()
    }

    /// Index of the bucket `id` belongs to, or `None` for our own identifier.
    pub fn bucket_index(&self, id: &Identifier) -> Option<usize> {
        let prefix = self.local_id.distance(id).common_prefix_len();

        if prefix == MAX_BUCKETS {
            None
        } else {
            Some(prefix)
        }
    }

    /// Offer the contact to its bucket. Returns `None` if the contact is ourselves.
    pub fn add_contact(&mut self, contact: Contact) -> Option<InsertOutcome> {
        let index = self.bucket_index(&contact.id())?;
        Some(self.buckets[index].add_contact(contact))
    }

    /// Replace `oldest` by `new_contact` after `oldest` failed a liveness check.
    pub fn replace(&mut self, oldest: &Identifier, new_contact: Contact) -> bool {
        match self.bucket_index(&new_contact.id()) {
            Some(index) => self.buckets[index].replace(oldest, new_contact),
            None => false,
        }
    }

    /// Record that the contact answered us.
    pub fn mark_seen(&mut self, id: &Identifier) {
        if let Some(index) = self.bucket_index(id) {
            self.buckets[index].mark_seen(id);
        }
    }

    /// Record that the contact did not answer a request.
    pub fn request_failed(&mut self, id: &Identifier) {
        if let Some(contact) = self.find_contact_mut(id) {
            contact.request_failed();
        }
    }

    /// Find a mutable reference to the contact with the given identifier, if it exists.
    pub fn find_contact_mut(&mut self, id: &Identifier) -> Option<&mut Contact> {
        let index = self.bucket_index(id)?;
        self.buckets[index].find_mut(id)
    }

    /// Up to `count` online contacts closest to `target`, closest first.
    ///
    /// Linear scan over every bucket; tables on a LAN are small.
    pub fn closest_contacts(&self, target: &Identifier, count: usize) -> Vec<ContactInfo> {
        let mut contacts: Vec<&Contact> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.online_contacts())
            .collect();

        contacts.sort_by_key(|contact| target.distance(&contact.id()));

        contacts
            .into_iter()
            .take(count)
            .map(|contact| contact.info().clone())
            .collect()
    }

    /// Every online (good or questionable) contact.
    pub fn online_contacts(&self) -> Vec<ContactInfo> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.online_contacts())
            .map(|contact| contact.info().clone())
            .collect()
    }

    /// Number of good contacts in the RoutingTable.
    pub fn num_good_contacts(&self) -> usize {
        self.count_status(ContactStatus::Good)
    }

    /// Number of questionable contacts in the RoutingTable.
    pub fn num_questionable_contacts(&self) -> usize {
        self.count_status(ContactStatus::Questionable)
    }

    /// Indices of non-empty buckets that have not heard from any contact recently.
    pub fn stale_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.is_empty() && bucket.needs_refresh())
            .map(|(index, _)| index)
            .collect()
    }

    fn count_status(&self, status: ContactStatus) -> usize {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .filter(|contact| contact.status() == status)
            .count()
    }
}

// ----------------------------------------------------------------------------//
