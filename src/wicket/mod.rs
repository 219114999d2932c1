pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod tunnel;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    overrides: config::Overrides,
) -> anyhow::Result<()> {
    app::run(config_path, overrides).await
}
