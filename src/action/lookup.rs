use crate::{
    id::{Distance, Identifier},
    message::FindValueResult,
    routing::contact::ContactInfo,
    rpc::{Rpc, RpcError},
};
use futures_util::future;
use std::collections::{BTreeMap, HashSet};

/// What a lookup ended with.
#[derive(Debug)]
pub(crate) enum LookupOutcome {
    /// The closest contacts that answered, closest first.
    Contacts(Vec<ContactInfo>),
    /// A peer had the value stored.
    Value(Vec<u8>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mode {
    Node,
    Value,
}

/// Iterative Kademlia lookup that queries up to `alpha` contacts at a time and waits for the
/// whole round to answer before choosing the next one.
pub(crate) struct ParallelRouter<'a> {
    rpc: &'a Rpc,
    alpha: usize,
    max_rounds: usize,
}

impl<'a> ParallelRouter<'a> {
    pub fn new(rpc: &'a Rpc, alpha: usize, max_rounds: usize) -> Self {
        Self {
            rpc,
            alpha: alpha.max(1),
            max_rounds,
        }
    }

    /// Closest contacts to `target` that answered, starting from our own closest contacts.
    pub async fn find_node(&self, target: Identifier) -> Vec<ContactInfo> {
        let seeds = self.seeds(&target);
        self.find_node_from(target, seeds).await
    }

    pub async fn find_node_from(
        &self,
        target: Identifier,
        seeds: Vec<ContactInfo>,
    ) -> Vec<ContactInfo> {
        match self.lookup(target, seeds, Mode::Node).await {
            LookupOutcome::Contacts(contacts) => contacts,
            LookupOutcome::Value(_) => Vec::new(),
        }
    }

    pub async fn find_value(&self, key: Identifier) -> LookupOutcome {
        let seeds = self.seeds(&key);
        self.lookup(key, seeds, Mode::Value).await
    }

    /// Store the value on the closest contacts to `key`. Returns how many accepted it.
    pub async fn store(&self, key: Identifier, value: Vec<u8>) -> usize {
        let closest = self.find_node(key).await;

        future::join_all(
            closest
                .iter()
                .map(|contact| self.rpc.store(contact, key, value.clone())),
        )
        .await
        .into_iter()
        .filter(|result| matches!(result, Ok(true)))
        .count()
    }

    fn seeds(&self, target: &Identifier) -> Vec<ContactInfo> {
        self.rpc
            .table()
            .lock()
            .unwrap()
            .closest_contacts(target, self.rpc.k())
    }

    async fn lookup(
        &self,
        target: Identifier,
        seeds: Vec<ContactInfo>,
        mode: Mode,
    ) -> LookupOutcome {
        let local_id = self.rpc.local_id();
        let k = self.rpc.k();

        let mut seen: HashSet<Identifier> = HashSet::new();
        let mut candidates: BTreeMap<Distance, ContactInfo> = BTreeMap::new();
        let mut responded: BTreeMap<Distance, ContactInfo> = BTreeMap::new();
        let mut queried: HashSet<Identifier> = HashSet::new();

        for contact in seeds {
            if contact.id != local_id && seen.insert(contact.id) {
                candidates.insert(target.distance(&contact.id), contact);
            }
        }

        let mut closest = candidates.keys().next().copied();

        for round in 0..self.max_rounds {
            let batch: Vec<ContactInfo> = candidates
                .values()
                .filter(|contact| !queried.contains(&contact.id))
                .take(self.alpha)
                .cloned()
                .collect();

            if batch.is_empty() {
                break;
            }

            queried.extend(batch.iter().map(|contact| contact.id));

            let results = future::join_all(
                batch
                    .iter()
                    .map(|contact| self.query(contact, target, mode)),
            )
            .await;

            let mut value = None;

            for (contact, result) in batch.into_iter().zip(results) {
                match result {
                    Ok(FindValueResult::Contacts(contacts)) => {
                        responded.insert(target.distance(&contact.id), contact);

                        for found in contacts {
                            if found.id != local_id && seen.insert(found.id) {
                                candidates.insert(target.distance(&found.id), found);
                            }
                        }
                    }
                    Ok(FindValueResult::Value(found)) => value = Some(found),
                    Err(_) => {
                        candidates.remove(&target.distance(&contact.id));
                    }
                }
            }

            if let Some(value) = value {
                log::debug!("Found value for {} in round {}", target, round);
                return LookupOutcome::Value(value);
            }

            let round_closest = candidates.keys().next().copied();

            log::trace!(
                "Lookup {} round {}: {} candidates, {} answered",
                target,
                round,
                candidates.len(),
                responded.len()
            );

            // Stop once a round brings nothing closer than what we already had.
            if round_closest >= closest && round > 0 {
                let pending = candidates
                    .values()
                    .take(k)
                    .any(|contact| !queried.contains(&contact.id));

                if !pending {
                    break;
                }
            }

            closest = match (closest, round_closest) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }

        LookupOutcome::Contacts(responded.into_values().take(k).collect())
    }

    async fn query(
        &self,
        contact: &ContactInfo,
        target: Identifier,
        mode: Mode,
    ) -> Result<FindValueResult, RpcError> {
        match mode {
            Mode::Node => self
                .rpc
                .find_node(contact, target)
                .await
                .map(FindValueResult::Contacts),
            Mode::Value => self.rpc.find_value(contact, target).await,
        }
    }
}
