//! Correlation table matching a pending dial to the data link the relay
//! later opens for it.
//!
//! The table is the one piece of shared mutable state in the gateway. Both
//! orderings are valid: `claim` before `register` parks a waiter, `register`
//! before `claim` parks the link. Either way exactly one claimant receives
//! the link, and abandoned links are dropped (closed) rather than leaked.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PendingError {
    #[error("timed out waiting for data link {0}")]
    Timeout(u32),
    #[error("connection id {0} is already registered")]
    Duplicate(u32),
    #[error("connection id {0} already has a waiter")]
    Contended(u32),
    #[error("data link {0} was abandoned")]
    Abandoned(u32),
}

enum Slot<T> {
    /// A claimant is blocked waiting for the link.
    Waiting(oneshot::Sender<T>),
    /// The link arrived before anyone asked for it.
    Ready(T),
}

pub struct PendingTable<T> {
    slots: Mutex<HashMap<u32, Slot<T>>>,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Store the data link announced for `id` and wake its claimant, if any.
    /// Registering an id that already holds a live link is a protocol
    /// violation; the new link is dropped and the original kept.
    pub async fn register(&self, id: u32, link: T) -> Result<(), PendingError> {
        let mut slots = self.slots.lock().await;
        match slots.remove(&id) {
            Some(Slot::Waiting(tx)) => {
                // If the claimant gave up between its timeout firing and the
                // slot being released, the link is dropped here.
                let _ = tx.send(link);
                Ok(())
            }
            Some(Slot::Ready(prev)) => {
                slots.insert(id, Slot::Ready(prev));
                Err(PendingError::Duplicate(id))
            }
            None => {
                slots.insert(id, Slot::Ready(link));
                Ok(())
            }
        }
    }

    /// Block until `register` is called for `id` or `timeout` elapses.
    /// The entry is removed on every exit path.
    pub async fn claim(&self, id: u32, timeout: Duration) -> Result<T, PendingError> {
        let rx = {
            let mut slots = self.slots.lock().await;
            match slots.remove(&id) {
                Some(Slot::Ready(link)) => return Ok(link),
                Some(Slot::Waiting(prev)) => {
                    slots.insert(id, Slot::Waiting(prev));
                    return Err(PendingError::Contended(id));
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    slots.insert(id, Slot::Waiting(tx));
                    rx
                }
            }
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(link)) => Ok(link),
            Ok(Err(_)) => {
                self.release(id).await;
                Err(PendingError::Abandoned(id))
            }
            Err(_) => {
                self.release(id).await;
                Err(PendingError::Timeout(id))
            }
        }
    }

    /// Drop the entry for `id`, closing a parked link or waking a parked
    /// claimant with [`PendingError::Abandoned`].
    pub async fn release(&self, id: u32) {
        self.slots.lock().await.remove(&id);
    }

    /// Drop every entry. Used when the control link is replaced: connection
    /// ids are only unique per control link, so leftovers from the previous
    /// one must not collide with the new id sequence.
    pub async fn clear(&self) {
        self.slots.lock().await.clear();
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn register_then_claim() {
        let t: PendingTable<&'static str> = PendingTable::new();
        t.register(1, "link-1").await.unwrap();
        let got = t.claim(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, "link-1");
        assert!(t.is_empty().await);
    }

    #[tokio::test]
    async fn claim_then_register_wakes_waiter() {
        let t = Arc::new(PendingTable::<&'static str>::new());
        let waiter = {
            let t = t.clone();
            tokio::spawn(async move { t.claim(9, Duration::from_secs(5)).await })
        };

        // Give the claimant a chance to park.
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.register(9, "link-9").await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), "link-9");
        assert!(t.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_register_keeps_the_original() {
        let t: PendingTable<&'static str> = PendingTable::new();
        t.register(4, "first").await.unwrap();
        assert_eq!(
            t.register(4, "second").await.unwrap_err(),
            PendingError::Duplicate(4)
        );
        assert_eq!(t.claim(4, Duration::from_secs(1)).await.unwrap(), "first");
    }

    #[tokio::test]
    async fn claim_times_out_and_releases_the_slot() {
        let t: PendingTable<&'static str> = PendingTable::new();
        let err = t.claim(2, Duration::from_millis(30)).await.unwrap_err();
        assert_eq!(err, PendingError::Timeout(2));
        assert!(t.is_empty().await);

        // A late register parks the link instead of erroring.
        t.register(2, "late").await.unwrap();
        assert_eq!(t.claim(2, Duration::from_secs(1)).await.unwrap(), "late");
    }

    #[tokio::test]
    async fn release_wakes_a_parked_claimant() {
        let t = Arc::new(PendingTable::<&'static str>::new());
        let waiter = {
            let t = t.clone();
            tokio::spawn(async move { t.claim(5, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.release(5).await;
        assert_eq!(waiter.await.unwrap().unwrap_err(), PendingError::Abandoned(5));
    }

    #[tokio::test]
    async fn second_claim_on_same_id_is_rejected() {
        let t = Arc::new(PendingTable::<&'static str>::new());
        let first = {
            let t = t.clone();
            tokio::spawn(async move { t.claim(3, Duration::from_millis(200)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            t.claim(3, Duration::from_millis(10)).await.unwrap_err(),
            PendingError::Contended(3)
        );
        // The original claimant is unaffected by the rejected one.
        t.register(3, "link-3").await.unwrap();
        assert_eq!(first.await.unwrap().unwrap(), "link-3");
    }

    #[tokio::test]
    async fn concurrent_claims_each_get_their_own_link() {
        let t = Arc::new(PendingTable::<String>::new());
        let mut waiters = Vec::new();
        for id in 0u32..16 {
            let t = t.clone();
            waiters.push(tokio::spawn(async move {
                (id, t.claim(id, Duration::from_secs(5)).await)
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Register in reverse order to shake out ordering assumptions.
        for id in (0u32..16).rev() {
            t.register(id, format!("link-{id}")).await.unwrap();
        }
        for w in waiters {
            let (id, got) = w.await.unwrap();
            assert_eq!(got.unwrap(), format!("link-{id}"));
        }
        assert!(t.is_empty().await);
    }
}
