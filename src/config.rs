use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::processing::timer::TimerCadence;

const USER_ID_ENV: &str = "CYCLEKEEPER_USER_ID";

/// Remote status endpoints, in the order they may be probed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, ValueEnum)]
pub enum StatusEndpoint {
    /// GET /processing/status/{userId}
    Countdown,
    /// POST /processing/status
    Legacy,
}

impl StatusEndpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Countdown => "countdown",
            Self::Legacy => "legacy",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Subcommand)]
pub enum Command {
    /// Credit the previous cycle and start a new 24h cycle.
    Start {
        /// Return right after starting instead of watching the countdown.
        #[arg(long, default_value_t = false)]
        detach: bool,
    },
    /// Follow the running cycle until it completes or Ctrl-C.
    Watch,
    /// Print one authoritative status snapshot.
    Status,
    /// Stop tracking and forget the locally stored session.
    Logout,
}

#[derive(Debug, Parser)]
#[command(name = "cyclekeeper", version, about = "Tracks 24h processing reward cycles")]
struct Cli {
    /// API base URL of the processing server.
    #[arg(long = "api-url", default_value = "http://127.0.0.1:3000/api")]
    api_url: String,

    /// User the session belongs to (falls back to CYCLEKEEPER_USER_ID).
    #[arg(long)]
    user_id: Option<String>,

    /// Bearer token sent with every request.
    #[arg(long)]
    token: Option<String>,

    /// File holding the bearer token, read when --token is unset.
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Directory for the persisted session files.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Timeout for start/complete/save requests.
    #[arg(long, default_value_t = 15)]
    request_timeout_secs: u64,

    /// Timeout for each status probe.
    #[arg(long, default_value_t = 4_000)]
    sync_timeout_ms: u64,

    /// Countdown tick period.
    #[arg(long, default_value_t = 1_000)]
    tick_ms: u64,

    /// Seconds between authoritative status syncs.
    #[arg(long, default_value_t = 30)]
    sync_secs: u64,

    /// Seconds between reward refreshes from the accumulated endpoint while
    /// watching. 0 turns the refresh off.
    #[arg(long, default_value_t = 10)]
    accumulated_secs: u64,

    /// Seconds between printed countdown lines while watching.
    #[arg(long, default_value_t = 10)]
    render_secs: u64,

    /// Remote status endpoints in probe order. Repeat the flag or pass
    /// comma-separated values; the local estimate always comes last.
    #[arg(
        long = "status-source",
        value_enum,
        value_delimiter = ',',
        num_args = 1..,
        default_value = "countdown,legacy"
    )]
    status_sources: Vec<StatusEndpoint>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub user_id: String,
    pub token: Option<String>,
    pub data_dir: PathBuf,
    pub request_timeout: Duration,
    pub sync_timeout: Duration,
    pub cadence: TimerCadence,
    pub render_interval: Duration,
    pub accumulated_every: Option<Duration>,
    pub status_sources: Vec<StatusEndpoint>,
    pub command: Command,
}

impl Config {
    pub fn parse() -> Result<Self> {
        Self::from_cli(Cli::parse(), std::env::var(USER_ID_ENV).ok())
    }

    fn from_cli(cli: Cli, env_user_id: Option<String>) -> Result<Self> {
        if cli.tick_ms == 0 {
            bail!("tick-ms must be >= 1");
        }
        if cli.sync_secs == 0 {
            bail!("sync-secs must be >= 1");
        }
        if cli.sync_timeout_ms == 0 {
            bail!("sync-timeout-ms must be >= 1");
        }
        if cli.request_timeout_secs == 0 {
            bail!("request-timeout-secs must be >= 1");
        }

        let status_sources = dedupe_sources(&cli.status_sources);
        let user_id = resolve_user_id(cli.user_id.as_deref(), env_user_id.as_deref())?;
        let token = resolve_token(&cli)?;

        Ok(Self {
            api_url: normalize_api_url(&cli.api_url),
            user_id,
            token,
            data_dir: cli.data_dir,
            request_timeout: Duration::from_secs(cli.request_timeout_secs),
            sync_timeout: Duration::from_millis(cli.sync_timeout_ms),
            cadence: TimerCadence {
                tick: Duration::from_millis(cli.tick_ms),
                sync: Duration::from_secs(cli.sync_secs),
            },
            render_interval: Duration::from_secs(cli.render_secs.max(1)),
            accumulated_every: (cli.accumulated_secs > 0)
                .then(|| Duration::from_secs(cli.accumulated_secs)),
            status_sources,
            command: cli.command,
        })
    }
}

fn resolve_user_id(flag: Option<&str>, env: Option<&str>) -> Result<String> {
    let Some(raw) = flag.or(env) else {
        bail!("missing user id: pass --user-id or set {USER_ID_ENV}");
    };
    let user_id = raw.trim();
    if user_id.is_empty() {
        bail!("user id is empty");
    }
    if user_id.contains('/') {
        bail!("user id must not contain '/': {user_id}");
    }
    Ok(user_id.to_string())
}

fn resolve_token(cli: &Cli) -> Result<Option<String>> {
    if let Some(token) = &cli.token {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            bail!("--token is empty");
        }
        return Ok(Some(trimmed.to_string()));
    }

    let Some(path) = &cli.token_file else {
        return Ok(None);
    };
    let token = fs::read_to_string(path)
        .with_context(|| format!("failed to read token file at {}", path.display()))?;
    let trimmed = token.trim();
    if trimmed.is_empty() {
        bail!("token file is empty: {}", path.display());
    }
    Ok(Some(trimmed.to_string()))
}

fn normalize_api_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return trimmed.to_string();
    }
    format!("http://{trimmed}")
}

fn dedupe_sources(sources: &[StatusEndpoint]) -> Vec<StatusEndpoint> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::with_capacity(sources.len());
    for source in sources {
        if seen.insert(*source) {
            ordered.push(*source);
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn parse(args: &[&str]) -> Cli {
        let argv = std::iter::once("cyclekeeper").chain(args.iter().copied());
        Cli::try_parse_from(argv).expect("arguments should parse")
    }

    #[test]
    fn defaults_fill_in_cadence_and_sources() {
        let cfg = Config::from_cli(parse(&["--user-id", "42", "watch"]), None)
            .expect("config should build");
        assert_eq!(cfg.user_id, "42");
        assert_eq!(cfg.command, Command::Watch);
        assert_eq!(
            cfg.status_sources,
            vec![StatusEndpoint::Countdown, StatusEndpoint::Legacy]
        );
        assert_eq!(cfg.cadence.tick, Duration::from_secs(1));
        assert_eq!(cfg.cadence.sync, Duration::from_secs(30));
        assert_eq!(cfg.sync_timeout, Duration::from_millis(4_000));
        assert_eq!(cfg.accumulated_every, Some(Duration::from_secs(10)));
        assert_eq!(cfg.token, None);
    }

    #[test]
    fn zero_accumulated_secs_turns_refresh_off() {
        let cfg = Config::from_cli(
            parse(&["--user-id", "42", "--accumulated-secs", "0", "watch"]),
            None,
        )
        .expect("config should build");
        assert_eq!(cfg.accumulated_every, None);
    }

    #[test]
    fn start_detach_and_source_order_parse() {
        let cfg = Config::from_cli(
            parse(&[
                "--status-source",
                "legacy,countdown,legacy",
                "start",
                "--detach",
            ]),
            Some("7".to_string()),
        )
        .expect("config should build");
        assert_eq!(cfg.command, Command::Start { detach: true });
        assert_eq!(cfg.user_id, "7");
        assert_eq!(
            cfg.status_sources,
            vec![StatusEndpoint::Legacy, StatusEndpoint::Countdown]
        );
    }

    #[test]
    fn flag_user_id_wins_over_env() {
        assert_eq!(
            resolve_user_id(Some(" 42 "), Some("7")).expect("user id should resolve"),
            "42"
        );
    }

    #[test]
    fn user_id_is_validated() {
        assert!(resolve_user_id(None, None).is_err());
        assert!(resolve_user_id(Some("  "), None).is_err());
        assert!(resolve_user_id(Some("a/b"), None).is_err());
    }

    #[test]
    fn zero_tick_is_rejected() {
        let err = Config::from_cli(parse(&["--user-id", "42", "--tick-ms", "0", "status"]), None)
            .expect_err("zero tick should be rejected");
        assert!(err.to_string().contains("tick-ms"));
    }

    #[test]
    fn normalize_api_url_adds_scheme() {
        assert_eq!(
            normalize_api_url("localhost:3000/api/"),
            "http://localhost:3000/api"
        );
        assert_eq!(
            normalize_api_url("https://app.example.com/api"),
            "https://app.example.com/api"
        );
    }

    #[test]
    fn token_file_is_read_and_trimmed() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be >= unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "cyclekeeper-token-{}-{nanos}",
            std::process::id()
        ));
        fs::write(&path, "secret\n").expect("token file should be written");

        let path_arg = path.display().to_string();
        let cli = parse(&["--user-id", "42", "--token-file", &path_arg, "status"]);
        assert_eq!(
            resolve_token(&cli).expect("token should be read"),
            Some("secret".to_string())
        );
        let _ = fs::remove_file(path);
    }
}
