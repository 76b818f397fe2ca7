use super::lookup::ParallelRouter;
use crate::{
    routing::contact::ContactInfo,
    rpc::{Rpc, RpcError},
};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub enum State {
    /// No peer known yet.
    AwaitContact,
    Bootstrapping,
    /// At least one bootstrap completed. Stays so for the lifetime of the service.
    Bootstrapped,
}

/// Populates the routing table from a single known contact.
pub(crate) struct TableBootstrap {
    rpc: Arc<Rpc>,
    alpha: usize,
    max_rounds: usize,
    state_tx: watch::Sender<State>,
}

impl TableBootstrap {
    pub fn new(rpc: Arc<Rpc>, alpha: usize, max_rounds: usize) -> Self {
        let (state_tx, _) = watch::channel(State::AwaitContact);

        Self {
            rpc,
            alpha,
            max_rounds,
            state_tx,
        }
    }

    pub fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state_tx.subscribe()
    }

    /// Ask `contact` for the contacts closest to our own identifier, then keep walking towards
    /// it until no closer contact turns up. Returns the number of online contacts afterwards.
    pub async fn bootstrap(&self, contact: ContactInfo) -> Result<usize, RpcError> {
        let local_id = self.rpc.local_id();

        self.set_state(State::Bootstrapping);
        log::debug!("Bootstrapping against {:?}", contact);

        let mut seeds = match self.rpc.find_node(&contact, local_id).await {
            Ok(contacts) => contacts,
            Err(error) => {
                log::debug!("Bootstrap against {:?} failed: {}", contact, error);
                self.set_state(self.settled_state());
                return Err(error);
            }
        };
        seeds.push(contact);

        let found = ParallelRouter::new(&self.rpc, self.alpha, self.max_rounds)
            .find_node_from(local_id, seeds)
            .await;

        let online = self.rpc.table().lock().unwrap().online_contacts().len();

        log::info!(
            "Bootstrap completed: {} closest contacts answered, {} contacts online",
            found.len(),
            online
        );

        self.set_state(State::Bootstrapped);

        Ok(online)
    }

    // State to fall back to after a failed attempt.
    fn settled_state(&self) -> State {
        if self.state() == State::Bootstrapped
            || !self.rpc.table().lock().unwrap().online_contacts().is_empty()
        {
            State::Bootstrapped
        } else {
            State::AwaitContact
        }
    }

    fn set_state(&self, new_state: State) {
        let old_state = self.state();

        // Once bootstrapped, further attempts only add contacts.
        if old_state == new_state || old_state == State::Bootstrapped {
            return;
        }

        self.state_tx.send_replace(new_state);

        log::info!("TableBootstrap state change {:?} -> {:?}", old_state, new_state);
    }
}
