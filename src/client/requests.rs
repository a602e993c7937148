use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::subscription::SubscriptionKey;
use crate::utils::{ClientError, Result};

/// Who is waiting for a broker reply.
#[derive(Debug)]
pub(crate) enum Waiter {
    Caller(oneshot::Sender<Result<()>>),
    /// A re-subscription issued by the client itself after a restart.
    Background,
}

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub operation: &'static str,
    pub key: SubscriptionKey,
    pub waiter: Waiter,
}

/// Subscribe/unsubscribe requests awaiting a broker reply, by request id.
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    next_id: u64,
    waiting: HashMap<u64, PendingRequest>,
}

impl PendingRequests {
    pub(crate) fn register(
        &mut self,
        operation: &'static str,
        key: SubscriptionKey,
    ) -> (u64, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.insert(operation, key, Waiter::Caller(tx));
        (id, rx)
    }

    pub(crate) fn register_background(&mut self, operation: &'static str, key: SubscriptionKey) -> u64 {
        self.insert(operation, key, Waiter::Background)
    }

    fn insert(&mut self, operation: &'static str, key: SubscriptionKey, waiter: Waiter) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.waiting.insert(
            id,
            PendingRequest {
                operation,
                key,
                waiter,
            },
        );
        id
    }

    pub(crate) fn take(&mut self, id: u64) -> Option<PendingRequest> {
        self.waiting.remove(&id)
    }

    /// Resolves every caller still waiting with the error built by `error`.
    pub(crate) fn fail_all(&mut self, error: impl Fn(&PendingRequest) -> ClientError) -> usize {
        let failed = self.waiting.len();
        for (_, request) in self.waiting.drain() {
            let err = error(&request);
            if let Waiter::Caller(tx) = request.waiter {
                let _ = tx.send(Err(err));
            }
        }
        failed
    }
}
