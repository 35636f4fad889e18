use std::collections::BTreeMap;

use tokio::sync::mpsc;

/// Re-sequences items that complete out of order.
///
/// Producers send `(sequence, item)` pairs where sequences start at zero and
/// are contiguous; `next` yields them strictly in sequence order.
pub struct OrderedStream<T> {
    // sequence -> item
    buffer: BTreeMap<u64, T>,
    next_seq: u64,
    rx: mpsc::UnboundedReceiver<(u64, T)>,
}

impl<T> OrderedStream<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<(u64, T)>) -> Self {
        Self {
            buffer: BTreeMap::new(),
            next_seq: 0,
            rx,
        }
    }

    /// Number of completed items waiting for an earlier sequence.
    #[cfg(test)]
    fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub async fn next(&mut self) -> Option<(u64, T)> {
        loop {
            if let Some(item) = self.buffer.remove(&self.next_seq) {
                return Some(self.advance(item));
            }

            match self.rx.recv().await {
                Some((seq, item)) if seq == self.next_seq => return Some(self.advance(item)),
                Some((seq, item)) => {
                    self.buffer.insert(seq, item);
                }
                // Senders are gone: whatever is still buffered can never be completed
                // by the missing sequence, so it is dropped.
                None => return None,
            }
        }
    }

    fn advance(&mut self, item: T) -> (u64, T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        (seq, item)
    }
}
