use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

/// Worker mode, named after the original flag values: `client` runs the
/// gateway node, `proxy` runs the relay node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Proxy,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Client => write!(f, "client"),
            Mode::Proxy => write!(f, "proxy"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Mode::Client),
            "proxy" => Ok(Mode::Proxy),
            other => anyhow::bail!("invalid mode {other:?} (expected \"client\" or \"proxy\")"),
        }
    }
}

/// Command-line overrides; each takes precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub mode: Option<String>,
    pub listen_addr: Option<String>,
    pub rendezvous_addr: Option<String>,
    pub target_addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub listen_addr: String,
    pub rendezvous_addr: String,
    pub target_addr: String,
    pub buffer_size: usize,
    pub reconnect_backoff: Duration,
    pub timeouts: Timeouts,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Deadline for one dial: the control-link response and the matching
    /// data link each get this long.
    pub dial_timeout: Duration,
    /// Caps a tunnel's lifetime; zero means unbounded.
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: Option<PathBuf>,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(ResolvedConfigPath {
            path: Some(p),
            source: ConfigPathSource::Flag,
        });
    }

    // clap already maps WICKET_CONFIG into the flag value when unset, but keep
    // the precedence clear by treating it as "env" when present.
    if let Some(p) = std::env::var_os("WICKET_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: Some(PathBuf::from(p)),
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: Some(p),
            source: ConfigPathSource::Cwd,
        });
    }

    // The default path may not exist; running on flag defaults alone is fine.
    let default = default_config_path()?;
    Ok(ResolvedConfigPath {
        path: fs::metadata(&default).is_ok().then_some(default),
        source: ConfigPathSource::Default,
    })
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    let candidates = ["wicket.toml", "wicket.yaml", "wicket.yml"];
    for c in candidates {
        let p = dir.join(c);
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Some(p);
        }
    }
    None
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    // Linux: system-wide default.
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/wicket/wicket.toml"))
    }

    // Other OSes: per-user config dir.
    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("dev", "wicket", "wicket")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("wicket.toml"))
    }
}

pub fn load_config(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<Config> {
    let mut fc = match path {
        Some(path) => {
            let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
            let s = String::from_utf8_lossy(&data);

            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_ascii_lowercase();

            match ext.as_str() {
                "toml" => {
                    toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?
                }
                "yaml" | "yml" => serde_yaml::from_str(&s)
                    .with_context(|| format!("parse yaml {}", path.display()))?,
                _ => anyhow::bail!("config: unsupported config extension {ext:?}"),
            }
        }
        None => FileConfig::default(),
    };

    Config::from_file_config(&mut fc, overrides)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    mode: Option<String>,

    #[serde(default)]
    listen_addr: String,

    #[serde(default)]
    rendezvous_addr: String,

    #[serde(default)]
    target_addr: String,

    #[serde(default)]
    buffer_size: i64,

    #[serde(default)]
    reconnect_backoff_ms: i64,

    timeouts: Option<FileTimeouts>,

    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
struct FileTimeouts {
    dial_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

impl Config {
    fn from_file_config(fc: &mut FileConfig, overrides: &Overrides) -> anyhow::Result<Config> {
        let mode = overrides
            .mode
            .as_deref()
            .or(fc.mode.as_deref())
            .unwrap_or("client")
            .parse::<Mode>()?;

        let mut cfg = Config {
            mode,
            listen_addr: pick(&overrides.listen_addr, &fc.listen_addr, "127.0.0.1:7001"),
            rendezvous_addr: pick(
                &overrides.rendezvous_addr,
                &fc.rendezvous_addr,
                "127.0.0.1:7002",
            ),
            target_addr: pick(&overrides.target_addr, &fc.target_addr, "www.qq.com:80"),
            buffer_size: fc.buffer_size.max(0) as usize,
            reconnect_backoff: Duration::from_millis(fc.reconnect_backoff_ms.max(0) as u64),
            timeouts: Timeouts {
                dial_timeout: Duration::from_millis(
                    fc.timeouts
                        .as_ref()
                        .and_then(|t| t.dial_timeout_ms)
                        .unwrap_or(10_000)
                        .max(0) as u64,
                ),
                idle_timeout: Duration::from_millis(
                    fc.timeouts
                        .as_ref()
                        .and_then(|t| t.idle_timeout_ms)
                        .unwrap_or(0)
                        .max(0) as u64,
                ),
            },
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        if cfg.buffer_size == 0 {
            cfg.buffer_size = 32 * 1024;
        }
        if cfg.reconnect_backoff == Duration::ZERO {
            cfg.reconnect_backoff = Duration::from_secs(1);
        }
        if cfg.timeouts.dial_timeout == Duration::ZERO {
            cfg.timeouts.dial_timeout = Duration::from_secs(10);
        }

        if let Some(l) = &fc.logging {
            if let Some(v) = &l.level {
                cfg.logging.level = v.clone();
            }
            if let Some(v) = &l.format {
                cfg.logging.format = v.clone();
            }
            if let Some(v) = &l.output {
                cfg.logging.output = v.clone();
            }
            cfg.logging.add_source = l.add_source;
        }

        Ok(cfg)
    }
}

fn pick(override_val: &Option<String>, file_val: &str, default: &str) -> String {
    if let Some(v) = override_val {
        if !v.trim().is_empty() {
            return v.trim().to_string();
        }
    }
    if !file_val.trim().is_empty() {
        return file_val.trim().to_string();
    }
    default.to_string()
}
