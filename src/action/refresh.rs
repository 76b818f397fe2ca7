use super::lookup::ParallelRouter;
use crate::rpc::Rpc;
use std::sync::Arc;

/// Keeps quiet buckets alive by looking up a random identifier that would fall into them.
pub(crate) struct TableRefresh {
    rpc: Arc<Rpc>,
    alpha: usize,
    max_rounds: usize,
}

impl TableRefresh {
    pub fn new(rpc: Arc<Rpc>, alpha: usize, max_rounds: usize) -> TableRefresh {
        TableRefresh {
            rpc,
            alpha,
            max_rounds,
        }
    }

    /// Refresh every non-empty bucket without a recently seen contact. Returns the number of
    /// buckets refreshed.
    pub async fn continue_refresh(&self) -> usize {
        let (local_id, stale, num_good_contacts, num_questionable_contacts) = {
            let table = self.rpc.table().lock().unwrap();

            (
                table.local_id(),
                table.stale_buckets(),
                table.num_good_contacts(),
                table.num_questionable_contacts(),
            )
        };

        let router = ParallelRouter::new(&self.rpc, self.alpha, self.max_rounds);

        for index in &stale {
            log::debug!(
                "Performing a refresh for bucket {} (table total: num_good_contacts={}, num_questionable_contacts={})",
                index,
                num_good_contacts,
                num_questionable_contacts,
            );

            let target = local_id.random_with_prefix(*index);
            router.find_node(target).await;
        }

        stale.len()
    }
}
