mod wicket;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "wicket",
    version,
    about = "Wicket - rendezvous TCP tunnel (gateway/relay pair)"
)]
struct Cli {
    /// Path to Wicket config file (.toml/.yaml/.yml). If omitted, uses WICKET_CONFIG; then auto-detects wicket.toml > wicket.yaml > wicket.yml from CWD; then falls back to the OS default path (Linux: /etc/wicket/wicket.toml; others: user config dir).
    #[arg(long, env = "WICKET_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Worker mode: "client" runs the gateway node, "proxy" runs the relay node.
    #[arg(long)]
    mode: Option<String>,

    /// Local address the gateway listens on for application connections.
    #[arg(long)]
    laddr: Option<String>,

    /// Rendezvous address (gateway listens, relay dials out).
    #[arg(long)]
    paddr: Option<String>,

    /// Real target address gateway-initiated tunnels connect to.
    #[arg(long)]
    raddr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let overrides = wicket::config::Overrides {
        mode: cli.mode,
        listen_addr: cli.laddr,
        rendezvous_addr: cli.paddr,
        target_addr: cli.raddr,
    };
    wicket::run(cli.config, overrides).await
}
