use crate::range::ByteRange;

/// Split the `pending` ranges into pieces for `contacts` peers.
///
/// Pieces are `max(total / contacts, max_chunk)` bytes long, except the last piece of every
/// pending range which also takes whatever is left when less than one more share remains. Pieces
/// are handed out round-robin in offset order. The result has one (possibly empty) entry per
/// contact and the pieces of each entry are in increasing offset order.
pub(super) fn partition(pending: &[ByteRange], contacts: usize, max_chunk: u64) -> Vec<Vec<ByteRange>> {
    let mut assignments = vec![Vec::new(); contacts];

    if contacts == 0 {
        return assignments;
    }

    let total: u64 = pending.iter().map(ByteRange::len).sum();
    let share = (total / contacts as u64).max(max_chunk).max(1);
    let mut next = 0;

    for range in pending {
        let mut start = range.start;

        loop {
            let left = range.end - start + 1;
            let take = if left >= share.saturating_mul(2) {
                share
            } else {
                left
            };

            let piece = ByteRange::new(start, start + take - 1);
            assignments[next % contacts].push(piece);
            next += 1;

            if piece.end == range.end {
                break;
            }

            start = piece.end + 1;
        }
    }

    assignments
}
