//! Control channel: the gateway's end of the single long-lived link to the
//! relay node.
//!
//! Every `dial:` request carries a sequence tag and every `done:` response
//! echoes it, so concurrent dials never depend on response ordering. The
//! write half is serialized behind a mutex; one reader task per installed
//! link dispatches responses to per-sequence waiters. Installing a new link
//! replaces the old one and fails everything pending on it.

use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicU64, Ordering},
};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{Mutex, oneshot};

use crate::wicket::tunnel::pending::{PendingError, PendingTable};
use crate::wicket::tunnel::protocol::{self, DialRequest};

#[derive(Debug, Error)]
pub enum DialError {
    #[error("control link is down")]
    LinkLost,
    #[error("dial timed out")]
    Timeout,
    #[error("dial failed: {0}")]
    Failed(String),
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct ControlChannel<L> {
    seq: AtomicU32,
    /// Bumped on every install; a reader task only tears state down if it
    /// still belongs to the current link.
    generation: AtomicU64,
    writer: Mutex<Option<BoxedWriter>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<u32>>>,
    table: Arc<PendingTable<L>>,
    dial_timeout: Duration,
}

impl<L> std::fmt::Debug for ControlChannel<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel").finish_non_exhaustive()
    }
}

impl<L: Send + 'static> ControlChannel<L> {
    pub fn new(table: Arc<PendingTable<L>>, dial_timeout: Duration) -> Self {
        Self {
            seq: AtomicU32::new(1),
            generation: AtomicU64::new(0),
            writer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            table,
            dial_timeout,
        }
    }

    pub async fn is_installed(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Adopt `link` as the control link, replacing any previous one. Dials
    /// pending on the replaced link fail with [`DialError::LinkLost`].
    pub async fn install<S>(self: &Arc<Self>, link: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rd, wr) = tokio::io::split(link);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut w = self.writer.lock().await;
            if w.is_some() {
                tracing::info!("control: replacing existing control link");
            }
            *w = Some(Box::new(wr));
        }
        self.fail_pending().await;

        let this = self.clone();
        tokio::spawn(async move {
            let mut r = BufReader::new(rd);
            loop {
                match protocol::read_dial_response(&mut r).await {
                    Ok(rsp) => this.dispatch(rsp.seq, rsp.conn_id).await,
                    Err(err) => {
                        if this.generation.load(Ordering::SeqCst) == generation {
                            tracing::warn!(err = %err, "control: link lost");
                        } else {
                            tracing::debug!(err = %err, "control: stale link reader exiting");
                        }
                        break;
                    }
                }
            }
            this.teardown(generation).await;
        });
    }

    /// Request a tunnel to `target` and wait for its data link.
    pub async fn dial(&self, target: &str) -> Result<L, DialError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        {
            let mut guard = self.writer.lock().await;
            let Some(w) = guard.as_mut() else {
                self.pending.lock().await.remove(&seq);
                return Err(DialError::LinkLost);
            };
            let req = DialRequest {
                seq,
                target: target.to_string(),
            };
            if let Err(err) = protocol::write_dial_request(w, &req).await {
                *guard = None;
                drop(guard);
                self.pending.lock().await.remove(&seq);
                tracing::warn!(err = %err, "control: write failed; dropping link");
                return Err(DialError::LinkLost);
            }
        }
        tracing::debug!(seq, target, "control: dial sent");

        let conn_id = match tokio::time::timeout(self.dial_timeout, rx).await {
            Ok(Ok(id)) => id,
            // Sender dropped: the link died or was replaced under us.
            Ok(Err(_)) => return Err(DialError::LinkLost),
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                return Err(DialError::Timeout);
            }
        };
        tracing::debug!(seq, conn_id, "control: dial resolved");

        match self.table.claim(conn_id, self.dial_timeout).await {
            Ok(link) => Ok(link),
            Err(PendingError::Timeout(_)) => Err(DialError::Timeout),
            Err(err) => Err(DialError::Failed(err.to_string())),
        }
    }

    async fn dispatch(&self, seq: u32, conn_id: u32) {
        match self.pending.lock().await.remove(&seq) {
            Some(tx) => {
                let _ = tx.send(conn_id);
            }
            None => {
                // The dialer already timed out or the link was replaced. The
                // relay registers the data link before responding, so that
                // link is now orphaned; drop it or it sits in the table
                // forever (connection ids are never reused).
                tracing::debug!(seq, conn_id, "control: response for unknown dial; dropping data link");
                self.table.release(conn_id).await;
            }
        }
    }

    async fn teardown(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        *self.writer.lock().await = None;
        self.fail_pending().await;
    }

    /// Drop all pending waiters; their receivers resolve to `LinkLost`.
    async fn fail_pending(&self) {
        self.pending.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

    use crate::wicket::tunnel::protocol::DialResponse;

    fn channel(
        dial_timeout: Duration,
    ) -> (Arc<ControlChannel<&'static str>>, Arc<PendingTable<&'static str>>) {
        let table = Arc::new(PendingTable::new());
        let chan = Arc::new(ControlChannel::new(table.clone(), dial_timeout));
        (chan, table)
    }

    async fn read_request(r: &mut BufReader<&mut DuplexStream>) -> DialRequest {
        protocol::read_dial_request(r).await.unwrap()
    }

    #[tokio::test]
    async fn dial_without_link_fails_fast() {
        let (chan, _table) = channel(Duration::from_secs(1));
        assert!(matches!(
            chan.dial("example.org:80").await,
            Err(DialError::LinkLost)
        ));
    }

    #[tokio::test]
    async fn concurrent_dials_resolve_out_of_order() {
        let (chan, table) = channel(Duration::from_secs(5));
        let (local, mut peer) = duplex(4096);
        chan.install(local).await;

        let d1 = {
            let chan = chan.clone();
            tokio::spawn(async move { chan.dial("a.example:80").await })
        };
        let d2 = {
            let chan = chan.clone();
            tokio::spawn(async move { chan.dial("b.example:80").await })
        };

        // Fake relay: collect both requests, answer in reverse order.
        let mut r = BufReader::new(&mut peer);
        let first = read_request(&mut r).await;
        let second = read_request(&mut r).await;
        drop(r);

        let (a_seq, b_seq) = if first.target == "a.example:80" {
            (first.seq, second.seq)
        } else {
            (second.seq, first.seq)
        };

        table.register(101, "link-a").await.unwrap();
        table.register(102, "link-b").await.unwrap();

        protocol::write_dial_response(&mut peer, DialResponse { seq: b_seq, conn_id: 102 })
            .await
            .unwrap();
        protocol::write_dial_response(&mut peer, DialResponse { seq: a_seq, conn_id: 101 })
            .await
            .unwrap();

        assert_eq!(d1.await.unwrap().unwrap(), "link-a");
        assert_eq!(d2.await.unwrap().unwrap(), "link-b");
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (chan, _table) = channel(Duration::from_millis(50));
        let (local, mut peer) = duplex(256);
        chan.install(local).await;

        // Peer reads the request but never answers.
        let dial = {
            let chan = chan.clone();
            tokio::spawn(async move { chan.dial("example.org:80").await })
        };
        let mut r = BufReader::new(&mut peer);
        let _req = read_request(&mut r).await;

        assert!(matches!(dial.await.unwrap(), Err(DialError::Timeout)));
    }

    #[tokio::test]
    async fn peer_disconnect_fails_pending_dials() {
        let (chan, _table) = channel(Duration::from_secs(5));
        let (local, mut peer) = duplex(256);
        chan.install(local).await;

        let dial = {
            let chan = chan.clone();
            tokio::spawn(async move { chan.dial("example.org:80").await })
        };
        {
            let mut r = BufReader::new(&mut peer);
            let _req = read_request(&mut r).await;
        }
        drop(peer);

        assert!(matches!(dial.await.unwrap(), Err(DialError::LinkLost)));
        assert!(!chan.is_installed().await);
    }

    #[tokio::test]
    async fn response_without_registered_link_times_out() {
        let (chan, _table) = channel(Duration::from_millis(80));
        let (local, mut peer) = duplex(256);
        chan.install(local).await;

        let dial = {
            let chan = chan.clone();
            tokio::spawn(async move { chan.dial("example.org:80").await })
        };
        let req = {
            let mut r = BufReader::new(&mut peer);
            read_request(&mut r).await
        };
        // Answer the dial but never open the data link.
        protocol::write_dial_response(&mut peer, DialResponse { seq: req.seq, conn_id: 9 })
            .await
            .unwrap();

        assert!(matches!(dial.await.unwrap(), Err(DialError::Timeout)));
    }

    #[tokio::test]
    async fn replacement_link_fails_old_dials_and_serves_new_ones() {
        let (chan, table) = channel(Duration::from_secs(5));
        let (local1, mut peer1) = duplex(256);
        chan.install(local1).await;

        let stale = {
            let chan = chan.clone();
            tokio::spawn(async move { chan.dial("old.example:80").await })
        };
        let _req = {
            let mut r = BufReader::new(&mut peer1);
            read_request(&mut r).await
        };

        let (local2, mut peer2) = duplex(256);
        chan.install(local2).await;
        assert!(matches!(stale.await.unwrap(), Err(DialError::LinkLost)));

        let dial = {
            let chan = chan.clone();
            tokio::spawn(async move { chan.dial("new.example:80").await })
        };
        let req = {
            let mut r = BufReader::new(&mut peer2);
            read_request(&mut r).await
        };
        table.register(7, "link-new").await.unwrap();
        protocol::write_dial_response(&mut peer2, DialResponse { seq: req.seq, conn_id: 7 })
            .await
            .unwrap();

        assert_eq!(dial.await.unwrap().unwrap(), "link-new");
    }

    #[tokio::test]
    async fn late_response_releases_the_orphaned_data_link() {
        let (chan, table) = channel(Duration::from_millis(50));
        let (local, mut peer) = duplex(256);
        chan.install(local).await;

        let dial = {
            let chan = chan.clone();
            tokio::spawn(async move { chan.dial("example.org:80").await })
        };
        let req = {
            let mut r = BufReader::new(&mut peer);
            read_request(&mut r).await
        };
        assert!(matches!(dial.await.unwrap(), Err(DialError::Timeout)));

        // The relay finishes the handshake anyway: data link registered,
        // then the response. Nobody will ever claim it.
        table.register(1, "late-link").await.unwrap();
        protocol::write_dial_response(&mut peer, DialResponse { seq: req.seq, conn_id: 1 })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn malformed_response_terminates_the_link() {
        let (chan, _table) = channel(Duration::from_secs(5));
        let (local, mut peer) = duplex(256);
        chan.install(local).await;

        peer.write_all(b"garbage\n").await.unwrap();

        // The reader tears the link down; subsequent dials fail fast.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!chan.is_installed().await);
        assert!(matches!(
            chan.dial("example.org:80").await,
            Err(DialError::LinkLost)
        ));
    }
}
