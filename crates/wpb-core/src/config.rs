use std::{
    env, fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    commands::DEFAULT_PREFIX,
    errors::Error,
    registry::{BotConfig, SessionDefaults, DEFAULT_REACT_EMOJI},
    retry::RetryPolicy,
    Result,
};

const DEFAULT_BRIDGE_BINARY: &str = "wpb-bridge-node";

/// Typed configuration for the pairing service.
#[derive(Clone, Debug)]
pub struct Config {
    // Storage
    pub session_dir: PathBuf,

    // HTTP
    pub host: IpAddr,
    pub port: u16,

    // Protocol bridge
    pub bridge_path: PathBuf,
    pub bridge_args: Vec<String>,

    // Bot behavior
    pub command_prefix: char,
    pub default_react_emoji: String,

    // Pairing
    pub pairing_min_interval: Duration,
    pub pairing_timeout: Duration,
    pub pairing_linger: Duration,
    pub pairing_initial_delay: Duration,
    pub pairing_max_attempts: u32,
    pub pairing_backoff_base: Duration,
    pub pairing_backoff_factor: f64,
    pub pairing_jitter: Duration,

    // Anti-delete cache
    pub message_cache_ttl: Duration,
    pub message_cache_max: usize,

    // Reconnect
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let session_dir = match env_path("SESSION_DIR") {
            Some(p) => p,
            None => env::current_dir()?.join("sessions"),
        };

        let host = match env_str("HOST").and_then(non_empty) {
            Some(h) => h
                .trim()
                .parse::<IpAddr>()
                .map_err(|e| Error::Config(format!("HOST is not an IP address: {e}")))?,
            None => IpAddr::from([0, 0, 0, 0]),
        };
        let port = env_parse::<u16>("PORT")?.unwrap_or(3000);

        let bridge_path = env_path("BRIDGE_PATH")
            .or_else(|| which_in_path(DEFAULT_BRIDGE_BINARY))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BRIDGE_BINARY));
        let bridge_args = parse_csv(env_str("BRIDGE_ARGS"));

        let command_prefix = match env_str("COMMAND_PREFIX") {
            Some(raw) => parse_prefix(&raw)?,
            None => DEFAULT_PREFIX,
        };
        let default_react_emoji = env_str("DEFAULT_REACT_EMOJI")
            .and_then(non_empty)
            .unwrap_or_else(|| DEFAULT_REACT_EMOJI.to_string());

        // Pairing
        let pairing_min_interval =
            env_millis("PAIRING_MIN_INTERVAL_MS")?.unwrap_or(Duration::from_secs(12));
        let pairing_timeout =
            env_millis("PAIRING_TIMEOUT_MS")?.unwrap_or(Duration::from_secs(25));
        let pairing_linger =
            Duration::from_secs(env_parse::<u64>("PAIRING_LINGER_SECS")?.unwrap_or(180));
        let pairing_initial_delay =
            env_millis("PAIRING_INITIAL_DELAY_MS")?.unwrap_or(Duration::from_millis(400));
        let pairing_max_attempts = positive(
            "PAIRING_MAX_ATTEMPTS",
            env_parse::<u32>("PAIRING_MAX_ATTEMPTS")?.unwrap_or(5),
        )?;
        let pairing_backoff_base =
            env_millis("PAIRING_BACKOFF_BASE_MS")?.unwrap_or(Duration::from_millis(1200));
        let pairing_backoff_factor = env_parse::<f64>("PAIRING_BACKOFF_FACTOR")?.unwrap_or(1.8);
        if !pairing_backoff_factor.is_finite() || pairing_backoff_factor < 1.0 {
            return Err(Error::Config(format!(
                "PAIRING_BACKOFF_FACTOR must be >= 1.0, got {pairing_backoff_factor}"
            )));
        }
        let pairing_jitter =
            env_millis("PAIRING_JITTER_MS")?.unwrap_or(Duration::from_millis(400));
        if pairing_timeout.is_zero() {
            return Err(Error::Config("PAIRING_TIMEOUT_MS must be > 0".to_string()));
        }

        // Anti-delete cache
        let message_cache_ttl =
            Duration::from_secs(env_parse::<u64>("MESSAGE_CACHE_TTL_SECS")?.unwrap_or(300));
        let message_cache_max = env_parse::<usize>("MESSAGE_CACHE_MAX")?.unwrap_or(1000);
        if message_cache_max == 0 {
            return Err(Error::Config("MESSAGE_CACHE_MAX must be > 0".to_string()));
        }

        // Reconnect
        let reconnect_max_attempts = positive(
            "RECONNECT_MAX_ATTEMPTS",
            env_parse::<u32>("RECONNECT_MAX_ATTEMPTS")?.unwrap_or(5),
        )?;
        let reconnect_base_delay =
            env_millis("RECONNECT_BASE_DELAY_MS")?.unwrap_or(Duration::from_millis(2000));

        Ok(Self {
            session_dir,
            host,
            port,
            bridge_path,
            bridge_args,
            command_prefix,
            default_react_emoji,
            pairing_min_interval,
            pairing_timeout,
            pairing_linger,
            pairing_initial_delay,
            pairing_max_attempts,
            pairing_backoff_base,
            pairing_backoff_factor,
            pairing_jitter,
            message_cache_ttl,
            message_cache_max,
            reconnect_max_attempts,
            reconnect_base_delay,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: self.pairing_initial_delay,
            max_attempts: self.pairing_max_attempts,
            base_backoff: self.pairing_backoff_base,
            backoff_factor: self.pairing_backoff_factor,
            max_jitter: self.pairing_jitter,
        }
    }

    pub fn session_defaults(&self) -> SessionDefaults {
        SessionDefaults {
            config: BotConfig {
                react_emoji: self.default_react_emoji.clone(),
                ..BotConfig::default()
            },
            cache_ttl: self.message_cache_ttl,
            cache_max_entries: self.message_cache_max,
        }
    }
}

fn parse_prefix(raw: &str) -> Result<char> {
    let mut chars = raw.trim().chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        (None, _) => Err(Error::Config("COMMAND_PREFIX must not be empty".to_string())),
        _ => Err(Error::Config(format!(
            "COMMAND_PREFIX must be a single character, got {raw:?}"
        ))),
    }
}

fn positive(key: &str, v: u32) -> Result<u32> {
    if v == 0 {
        return Err(Error::Config(format!("{key} must be > 0")));
    }
    Ok(v)
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

/// Parse an optional env var. Present but unparsable is an error, not a
/// silent fallback to the default.
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = env_str(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}")))
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
