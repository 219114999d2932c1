use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::wicket::{config, logging, tunnel};

pub async fn run(config_path: Option<PathBuf>, overrides: config::Overrides) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let cfg = config::load_config(resolved.path.as_deref(), &overrides).with_context(|| {
        match &resolved.path {
            Some(p) => format!("load config: {}", p.display()),
            None => "load config".to_string(),
        }
    })?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if let Some(p) = &resolved.path {
        tracing::info!(path = %p.display(), source = %resolved.source, "config: loaded");
    }

    tracing::info!(
        mode = %cfg.mode,
        laddr = %cfg.listen_addr,
        paddr = %cfg.rendezvous_addr,
        raddr = %cfg.target_addr,
        dial_timeout = %humantime::format_duration(cfg.timeouts.dial_timeout),
        "wicket: starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    match cfg.mode {
        config::Mode::Client => {
            // Bind failures are the only fatal errors after startup config.
            let gateway = tunnel::gateway::Gateway::bind(tunnel::gateway::GatewayOptions {
                listen_addr: cfg.listen_addr.clone(),
                rendezvous_addr: cfg.rendezvous_addr.clone(),
                target_addr: cfg.target_addr.clone(),
                dial_timeout: cfg.timeouts.dial_timeout,
                idle_timeout: cfg.timeouts.idle_timeout,
                buffer_size: cfg.buffer_size,
            })
            .await?;

            let gateway = Arc::new(gateway);
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { gateway.serve(shutdown).await });
        }
        config::Mode::Proxy => {
            let relay = Arc::new(tunnel::relay::Relay::new(tunnel::relay::RelayOptions {
                rendezvous_addr: cfg.rendezvous_addr.clone(),
                dial_timeout: cfg.timeouts.dial_timeout,
                idle_timeout: cfg.timeouts.idle_timeout,
                buffer_size: cfg.buffer_size,
                reconnect_backoff: cfg.reconnect_backoff,
            }));

            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { relay.run(shutdown).await });
        }
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks: exit as soon as they complete; only enforce a timeout if
    // something hangs.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };

    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
