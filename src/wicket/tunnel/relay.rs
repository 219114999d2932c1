//! Relay node: dials out to the gateway's rendezvous port, holds the
//! control link, and answers each dial request with a fresh data link wired
//! to the requested target.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, watch};

use crate::wicket::tunnel::pipe;
use crate::wicket::tunnel::protocol::{self, DialRequest, DialResponse, LinkRole};

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// The gateway's rendezvous address; both the control link and every
    /// data link dial out to it.
    pub rendezvous_addr: String,
    /// Bounds outbound connects and the data-link ack read.
    pub dial_timeout: Duration,
    /// Caps a tunnel's lifetime; zero means unbounded.
    pub idle_timeout: Duration,
    pub buffer_size: usize,
    /// Initial reconnect backoff; doubles per failure up to 10s.
    pub reconnect_backoff: Duration,
}

pub struct Relay {
    opts: RelayOptions,
}

/// Per-control-link state shared with spawned dial handlers. Connection ids
/// are only unique within one control link, so the counter lives here.
struct LinkState {
    opts: RelayOptions,
    conn_seq: AtomicU32,
}

impl LinkState {
    fn next_conn_id(&self) -> anyhow::Result<u32> {
        self.conn_seq
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_add(1))
            .map_err(|_| anyhow::anyhow!("relay: connection id space exhausted"))
    }
}

impl Relay {
    pub fn new(opts: RelayOptions) -> Self {
        Self { opts }
    }

    /// Re-dial the gateway whenever the control link drops; never hold more
    /// than one control link at a time.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut backoff = self.opts.reconnect_backoff.max(Duration::from_millis(100));
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        gateway = %self.opts.rendezvous_addr,
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "relay: control link lost; retrying"
                    );
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    // A closed channel means the app is gone; stop too.
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(Duration::from_secs(10));
        }
    }

    async fn run_once(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let conn = dial_tcp(&self.opts.rendezvous_addr, self.opts.dial_timeout)
            .await
            .context("relay: connect to rendezvous")?;
        let (rd, mut wr) = conn.into_split();
        protocol::write_link_role(&mut wr, LinkRole::Control)
            .await
            .context("relay: announce control role")?;

        tracing::info!(gateway = %self.opts.rendezvous_addr, "relay: control link established");

        let writer = Arc::new(Mutex::new(wr));
        let state = Arc::new(LinkState {
            opts: self.opts.clone(),
            conn_seq: AtomicU32::new(1),
        });

        let mut reader = BufReader::new(rd);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // Err means the sender is gone: stop rather than spin,
                    // repeatedly cancelling the (not cancel-safe) line read.
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                req = protocol::read_dial_request(&mut reader) => {
                    match req {
                        Ok(req) => {
                            let state = state.clone();
                            let writer = writer.clone();
                            tokio::spawn(async move {
                                handle_dial(state, writer, req).await;
                            });
                        }
                        // A complete-but-malformed line fails that request
                        // only; the control link keeps serving.
                        Err(err) if err.is_malformed_line() => {
                            tracing::warn!(err = %err, "relay: malformed dial request; skipping");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
    }
}

async fn handle_dial(
    state: Arc<LinkState>,
    control_writer: Arc<Mutex<OwnedWriteHalf>>,
    req: DialRequest,
) {
    let seq = req.seq;
    let target = req.target.clone();
    // An abandoned request sends nothing back on the control link; the
    // gateway's claim deadline handles the rest.
    if let Err(err) = serve_dial(state, control_writer, req).await {
        tracing::warn!(seq, target = %target, err = %err, "relay: dial abandoned");
    }
}

async fn serve_dial(
    state: Arc<LinkState>,
    control_writer: Arc<Mutex<OwnedWriteHalf>>,
    req: DialRequest,
) -> anyhow::Result<()> {
    let data = dial_tcp(&state.opts.rendezvous_addr, state.opts.dial_timeout)
        .await
        .context("open data link")?;
    let target = dial_tcp(&req.target, state.opts.dial_timeout)
        .await
        .context("open target link")?;

    let conn_id = state.next_conn_id()?;

    // Keep the data link wrapped for its whole life: the gateway may start
    // pushing payload right after its ack, and those bytes can land in the
    // read buffer alongside the `ok` line.
    let mut data = BufReader::new(data);
    protocol::write_link_role(&mut data, LinkRole::Data { conn_id })
        .await
        .context("announce data link")?;
    tokio::time::timeout(state.opts.dial_timeout, protocol::read_ack(&mut data))
        .await
        .context("data link ack timed out")?
        .context("data link ack")?;

    {
        let mut w = control_writer.lock().await;
        protocol::write_dial_response(&mut *w, DialResponse { seq: req.seq, conn_id })
            .await
            .context("write dial response")?;
    }
    tracing::info!(conn_id, seq = req.seq, target = %req.target, "relay: tunnel established");

    match pipe::run(data, target, state.opts.idle_timeout, state.opts.buffer_size).await {
        Ok((from_gateway, from_target)) => {
            tracing::debug!(conn_id, from_gateway, from_target, "relay: tunnel closed");
        }
        Err(err) => {
            tracing::debug!(conn_id, err = %err, "relay: tunnel ended with error");
        }
    }
    Ok(())
}

async fn dial_tcp(addr: &str, timeout: Duration) -> anyhow::Result<TcpStream> {
    let conn = if timeout > Duration::ZERO {
        tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("connect {addr} timed out"))?
    } else {
        TcpStream::connect(addr).await
    };
    conn.with_context(|| format!("connect {addr}"))
}
