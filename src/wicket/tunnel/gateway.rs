//! Gateway node: accepts application connections on the local port and
//! relay connections on the rendezvous port, and glues them together
//! through the control channel and the correlation table.
//!
//! Rendezvous connections classify themselves with an explicit role line
//! rather than by arrival order, so a reconnecting relay can replace a lost
//! control link instead of being mistaken for a data link.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::wicket::net;
use crate::wicket::tunnel::control::ControlChannel;
use crate::wicket::tunnel::pending::PendingTable;
use crate::wicket::tunnel::pipe;
use crate::wicket::tunnel::protocol::{self, LinkRole};

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Where local applications connect.
    pub listen_addr: String,
    /// Where the relay node dials in.
    pub rendezvous_addr: String,
    /// The single upstream every application connection is tunneled to.
    pub target_addr: String,
    pub dial_timeout: Duration,
    /// Caps a tunnel's lifetime; zero means unbounded.
    pub idle_timeout: Duration,
    pub buffer_size: usize,
}

pub struct Gateway {
    opts: GatewayOptions,
    local: TcpListener,
    rendezvous: TcpListener,
    control: Arc<ControlChannel<TcpStream>>,
    table: Arc<PendingTable<TcpStream>>,
}

impl Gateway {
    /// Bind both listeners. Failure here is fatal to the process; every
    /// later error is scoped to a single connection.
    pub async fn bind(opts: GatewayOptions) -> anyhow::Result<Self> {
        let laddr = net::normalize_bind_addr(&opts.listen_addr);
        let local = TcpListener::bind(laddr.as_ref())
            .await
            .with_context(|| format!("gateway: bind local listener {laddr}"))?;

        let paddr = net::normalize_bind_addr(&opts.rendezvous_addr);
        let rendezvous = TcpListener::bind(paddr.as_ref())
            .await
            .with_context(|| format!("gateway: bind rendezvous listener {paddr}"))?;

        let table = Arc::new(PendingTable::new());
        let control = Arc::new(ControlChannel::new(table.clone(), opts.dial_timeout));

        Ok(Self {
            opts,
            local,
            rendezvous,
            control,
            table,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.local.local_addr()
    }

    pub fn rendezvous_addr(&self) -> std::io::Result<SocketAddr> {
        self.rendezvous.local_addr()
    }

    /// Whether a relay currently holds the control link.
    pub async fn has_control_link(&self) -> bool {
        self.control.is_installed().await
    }

    pub async fn serve(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            local = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            rendezvous = %self.rendezvous_addr().map(|a| a.to_string()).unwrap_or_default(),
            target = %self.opts.target_addr,
            "gateway: listening"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A closed channel means the app is gone; stop too.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = self.local.accept() => {
                    match res {
                        Ok((conn, peer)) => {
                            let this = self.clone();
                            tokio::spawn(async move { this.handle_local(conn, peer).await });
                        }
                        Err(err) => tracing::warn!(err = %err, "gateway: local accept failed"),
                    }
                }
                res = self.rendezvous.accept() => {
                    match res {
                        Ok((conn, peer)) => {
                            let this = self.clone();
                            tokio::spawn(async move { this.handle_rendezvous(conn, peer).await });
                        }
                        Err(err) => tracing::warn!(err = %err, "gateway: rendezvous accept failed"),
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_rendezvous(&self, conn: TcpStream, peer: SocketAddr) {
        if let Err(err) = self.classify_rendezvous(conn, peer).await {
            tracing::warn!(peer = %peer, err = %err, "gateway: rendezvous connection rejected");
        }
    }

    async fn classify_rendezvous(&self, conn: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let mut reader = BufReader::new(conn);
        let role = tokio::time::timeout(
            self.opts.dial_timeout,
            protocol::read_link_role(&mut reader),
        )
        .await
        .context("role line timed out")??;

        // The relay stays silent between its role line and our next message,
        // so nothing sits in the read buffer we discard here.
        let mut conn = reader.into_inner();

        match role {
            LinkRole::Control => {
                // Connection ids restart with the new link; stale data links
                // from the previous relay must not collide with them.
                self.table.clear().await;
                self.control.install(conn).await;
                tracing::info!(peer = %peer, "gateway: control link installed");
            }
            LinkRole::Data { conn_id } => {
                // Ack first: the table takes ownership of the stream, and
                // claim tolerates registration landing after the `done`
                // response is dispatched.
                protocol::write_ack(&mut conn).await?;
                self.table
                    .register(conn_id, conn)
                    .await
                    .context("register data link")?;
                tracing::debug!(peer = %peer, conn_id, "gateway: data link registered");
            }
        }
        Ok(())
    }

    async fn handle_local(&self, conn: TcpStream, peer: SocketAddr) {
        tracing::debug!(peer = %peer, "gateway: application connection");
        match self.control.dial(&self.opts.target_addr).await {
            Ok(link) => {
                match pipe::run(conn, link, self.opts.idle_timeout, self.opts.buffer_size).await {
                    Ok((sent, received)) => {
                        tracing::debug!(peer = %peer, sent, received, "gateway: tunnel closed");
                    }
                    Err(err) => {
                        tracing::debug!(peer = %peer, err = %err, "gateway: tunnel ended with error");
                    }
                }
            }
            Err(err) => {
                // Dropping the application connection is the failure signal.
                tracing::warn!(
                    peer = %peer,
                    target = %self.opts.target_addr,
                    err = %err,
                    "gateway: dial failed"
                );
            }
        }
    }
}
