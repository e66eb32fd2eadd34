//! Background index maintenance for [`IndexingPolicy::Asynchronous`].
//!
//! [`IndexingPolicy::Asynchronous`]: crate::IndexingPolicy::Asynchronous

use parking_lot::{Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// An index update, applied in the order the store accepted the writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexOp {
    Insert(u64),
    Delete(u64),
}

/// Count of queued-but-unapplied ops.
#[derive(Default)]
pub(crate) struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Pending {
    pub(crate) fn add(&self) {
        *self.count.lock() += 1;
    }

    pub(crate) fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    pub(crate) fn get(&self) -> usize {
        *self.count.lock()
    }

    /// Blocks until every queued op has been applied.
    pub(crate) fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.drained.wait(&mut count);
        }
    }
}

pub(crate) fn channel() -> (UnboundedSender<IndexOp>, UnboundedReceiver<IndexOp>) {
    mpsc::unbounded_channel()
}

/// Runs `apply` for every op until all senders are dropped.
pub(crate) fn spawn_worker<F>(
    mut rx: UnboundedReceiver<IndexOp>,
    apply: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: Fn(IndexOp) + Send + 'static,
{
    thread::Builder::new()
        .name("ember-indexer".into())
        .spawn(move || {
            tracing::debug!("Index worker started");
            while let Some(op) = rx.blocking_recv() {
                apply(op);
            }
            tracing::debug!("Index worker stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_worker_applies_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pending = Arc::new(Pending::default());
        let (tx, rx) = channel();

        let handle = {
            let seen = seen.clone();
            let pending = pending.clone();
            spawn_worker(rx, move |op| {
                seen.lock().push(op);
                pending.done();
            })
            .unwrap()
        };

        for id in 1..=5 {
            pending.add();
            tx.send(IndexOp::Insert(id)).unwrap();
        }
        pending.add();
        tx.send(IndexOp::Delete(3)).unwrap();

        pending.wait();
        assert_eq!(pending.get(), 0);

        drop(tx);
        handle.join().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[5], IndexOp::Delete(3));
        assert_eq!(seen[0], IndexOp::Insert(1));
    }
}
