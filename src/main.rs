// ═══════════════════════════════════════════════════════════════════════════════
// PROVIDENCE DAILY - CHECK-IN + QUEST RUNNER
// Multi-account daily check-in and daily link quests with sticky proxies
// ═══════════════════════════════════════════════════════════════════════════════

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine;
use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use clap::Parser;
use colored::{ColoredString, Colorize};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, COOKIE, ORIGIN, REFERER, USER_AGENT,
};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Number, Value};
use tokio::time::sleep;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

// ═══════════════════════════════════════════════════════════════════════════════
// CLI ARGUMENTS
// ═══════════════════════════════════════════════════════════════════════════════
#[derive(Parser, Debug)]
#[command(name = "providence-daily")]
#[command(version)]
#[command(about = "Daily check-in and quest runner for Providence hub accounts", long_about = None)]
struct Args {
    /// Session token file (one token per line)
    #[arg(short, long)]
    tokens: Option<PathBuf>,

    /// Proxy list file (one proxy per line)
    #[arg(short, long)]
    proxies: Option<PathBuf>,

    /// Connect directly even when a proxy file exists
    #[arg(long, default_value_t = false, conflicts_with = "proxy")]
    no_proxy: bool,

    /// Use the proxy file even when the config file sets `no_proxy`
    #[arg(long, default_value_t = false)]
    proxy: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Skip an account after this many failed proxy probes (0 = keep rotating)
    #[arg(long)]
    max_probe_attempts: Option<u32>,

    /// Only print results and failures
    #[arg(short, long, default_value_t = false)]
    quiet: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    tokens_file: Option<PathBuf>,
    proxy_file: Option<PathBuf>,
    no_proxy: Option<bool>,
    api_base: Option<String>,
    probe_url: Option<String>,
    max_probe_attempts: Option<u32>,
    quest_delay_ms: Option<u64>,
    account_delay_ms: Option<u64>,
    cycle_wait_secs: Option<u64>,
    utc_offset_hours: Option<i32>,
}

async fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    if let Some(p) = path {
        let content = tokio::fs::read_to_string(p)
            .await
            .with_context(|| format!("Failed to read config {}", p.display()))?;
        return parse_config(&content, p);
    }

    // Try default locations
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let default_paths = [
        PathBuf::from("providence.toml"),
        PathBuf::from(format!("{}/.config/providence/config.toml", home)),
    ];

    for p in default_paths {
        if let Ok(content) = tokio::fs::read_to_string(&p).await {
            return parse_config(&content, &p);
        }
    }

    Ok(FileConfig::default())
}

fn parse_config(content: &str, path: &Path) -> Result<FileConfig> {
    let cfg = toml::from_str(content)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    println!("{}", format!("[✓] Config loaded from {}", path.display()).green());
    Ok(cfg)
}

/// Settings after merging CLI flags over the config file over built-in defaults.
#[derive(Debug, Clone)]
struct RuntimeConfig {
    tokens_file: PathBuf,
    proxy_file: PathBuf,
    use_proxy: bool,
    api_base: String,
    site_origin: String,
    probe_url: String,
    probe_policy: ProbePolicy,
    api_timeout: Duration,
    probe_timeout: Duration,
    quest_delay: Duration,
    account_delay: Duration,
    cycle_wait: Duration,
    utc_offset: FixedOffset,
    quiet: bool,
}

impl RuntimeConfig {
    fn resolve(args: &Args, file: &FileConfig) -> Result<Self> {
        let api_base = file
            .api_base
            .clone()
            .unwrap_or_else(|| API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        let site_origin = Url::parse(&api_base)
            .with_context(|| format!("api_base {} is not a valid URL", api_base))?
            .origin()
            .ascii_serialization();

        let hours = file.utc_offset_hours.unwrap_or(DEFAULT_UTC_OFFSET_HOURS);
        let utc_offset = FixedOffset::east_opt(hours * 3600)
            .with_context(|| format!("utc_offset_hours {} is out of range", hours))?;

        let use_proxy = if args.proxy {
            true
        } else if args.no_proxy {
            false
        } else {
            !file.no_proxy.unwrap_or(false)
        };

        let max_probe_attempts = args
            .max_probe_attempts
            .or(file.max_probe_attempts)
            .filter(|n| *n > 0);

        Ok(Self {
            tokens_file: args
                .tokens
                .clone()
                .or_else(|| file.tokens_file.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKENS_FILE)),
            proxy_file: args
                .proxies
                .clone()
                .or_else(|| file.proxy_file.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PROXY_FILE)),
            use_proxy,
            api_base,
            site_origin,
            probe_url: file.probe_url.clone().unwrap_or_else(|| PROBE_URL.to_string()),
            probe_policy: ProbePolicy { max_attempts: max_probe_attempts },
            api_timeout: Duration::from_secs(API_TIMEOUT_SECS),
            probe_timeout: Duration::from_secs(PROBE_TIMEOUT_SECS),
            quest_delay: Duration::from_millis(file.quest_delay_ms.unwrap_or(QUEST_DELAY_MS)),
            account_delay: Duration::from_millis(
                file.account_delay_ms.unwrap_or(ACCOUNT_DELAY_MS),
            ),
            cycle_wait: Duration::from_secs(file.cycle_wait_secs.unwrap_or(CYCLE_WAIT_SECS)),
            utc_offset,
            quiet: args.quiet,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════
const API_BASE: &str = "https://hub.playprovidence.io/api";
const PROBE_URL: &str = "https://api.ipify.org?format=json";
const SESSION_COOKIE: &str = "__Secure-authjs.session-token";
const ACCEPT_LANGUAGE_VALUE: &str = "en-US,en;q=0.9";

const STATS_PATH: &str = "/user/stats";
const CHECKIN_STATUS_PATH: &str = "/daily-checkin/status";
const CHECKIN_CLAIM_PATH: &str = "/daily-checkin/checkin";
const DAILY_QUESTS_PATH: &str = "/quests/daily-link/today";
const QUEST_COMPLETE_PATH: &str = "/quests/daily-link/complete";

const API_TIMEOUT_SECS: u64 = 60;
const PROBE_TIMEOUT_SECS: u64 = 30;
const QUEST_DELAY_MS: u64 = 1500;
const ACCOUNT_DELAY_MS: u64 = 3000;
const CYCLE_WAIT_SECS: u64 = 12 * 3600;
// WIB (Asia/Jakarta) has no DST, so a fixed offset is exact.
const DEFAULT_UTC_OFFSET_HOURS: i32 = 7;

const DEFAULT_TOKENS_FILE: &str = "tokens.txt";
const DEFAULT_PROXY_FILE: &str = "proxy.txt";
const UNKNOWN_EMAIL: &str = "unknown";
const MASK: &str = "***";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2.1 Safari/605.1.15",
];

// ═══════════════════════════════════════════════════════════════════════════════
// DATA STRUCTURES
// ═══════════════════════════════════════════════════════════════════════════════

/// `{ data: ... }` wrapper every read endpoint uses.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct UserStats {
    user_email: Option<String>,
    level: Option<Number>,
    total_xp: Option<Number>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckinStatus {
    #[serde(default, deserialize_with = "null_as_default")]
    can_checkin_today: bool,
    /// Milliseconds until the next check-in opens.
    next_checkin_in: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckinReward {
    xp_earned: Option<Number>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Quest {
    id: Value,
    #[serde(default, deserialize_with = "null_as_default")]
    title: String,
    xp: Option<Number>,
    #[serde(default, deserialize_with = "null_as_default")]
    is_completed: bool,
}

impl Quest {
    fn label(&self) -> String {
        if self.title.trim().is_empty() {
            match self.id.as_str() {
                Some(id) => format!("quest {}", id),
                None => format!("quest {}", self.id),
            }
        } else {
            self.title.clone()
        }
    }
}

/// `#[serde(default)]` only covers a missing key; the API also sends explicit nulls.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error("invalid proxy: {0}")]
    InvalidProxy(String),

    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyType {
    Http,
    Https,
    Socks4,
    Socks4a,
    Socks5,
    /// Hostnames resolved by the proxy, not locally.
    Socks5h,
}

impl ProxyType {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "socks4" => Some(Self::Socks4),
            "socks4a" => Some(Self::Socks4a),
            "socks5" => Some(Self::Socks5),
            "socks5h" => Some(Self::Socks5h),
            _ => None,
        }
    }

    fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks4 => "socks4",
            Self::Socks4a => "socks4a",
            Self::Socks5 => "socks5",
            Self::Socks5h => "socks5h",
        }
    }

    fn is_socks(self) -> bool {
        matches!(
            self,
            Self::Socks4 | Self::Socks4a | Self::Socks5 | Self::Socks5h
        )
    }
}

/// One line of the proxy file, normalized. Display never includes credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProxyEndpoint {
    proxy_type: ProxyType,
    addr: String,
    credentials: Option<(String, String)>,
}

impl ProxyEndpoint {
    /// Bare `host:port` is treated as an HTTP proxy.
    fn parse(line: &str) -> Result<Self, RequestError> {
        let line = line.trim();
        let normalized = if line.starts_with("http") || line.starts_with("socks") {
            line.to_string()
        } else {
            format!("http://{}", line)
        };

        let url = Url::parse(&normalized).map_err(|e| RequestError::InvalidProxy(e.to_string()))?;
        let proxy_type = ProxyType::from_scheme(url.scheme()).ok_or_else(|| {
            RequestError::InvalidProxy(format!("unsupported scheme {}", url.scheme()))
        })?;
        let host = url
            .host_str()
            .ok_or_else(|| RequestError::InvalidProxy("missing host".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| RequestError::InvalidProxy(format!("missing port for {}", host)))?;

        let credentials = if url.username().is_empty() {
            None
        } else {
            Some((
                url.username().to_string(),
                url.password().unwrap_or_default().to_string(),
            ))
        };

        Ok(Self {
            proxy_type,
            addr: format!("{}:{}", host, port),
            credentials,
        })
    }

    /// URL handed to the connector. HTTP(S) credentials move to a header instead.
    fn connection_url(&self) -> String {
        match &self.credentials {
            Some((user, pass)) if self.proxy_type.is_socks() => {
                format!("{}://{}:{}@{}", self.proxy_type.scheme(), user, pass, self.addr)
            }
            _ => format!("{}://{}", self.proxy_type.scheme(), self.addr),
        }
    }

    fn authorization(&self) -> Option<String> {
        if self.proxy_type.is_socks() {
            return None;
        }
        let (user, pass) = self.credentials.as_ref()?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        Some(format!("Basic {}", encoded))
    }

    fn to_reqwest(&self) -> Result<reqwest::Proxy, RequestError> {
        let mut proxy = reqwest::Proxy::all(self.connection_url())
            .map_err(|e| RequestError::InvalidProxy(e.to_string()))?;
        if let Some(auth) = self.authorization() {
            proxy = proxy.custom_http_auth(header_value(&auth)?);
        }
        Ok(proxy)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.proxy_type.scheme(), self.addr)
    }
}

/// How many failed connectivity probes an account tolerates before it is skipped.
/// `None` keeps rotating forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ProbePolicy {
    max_attempts: Option<u32>,
}

impl ProbePolicy {
    fn allows_retry(&self, failed_attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| failed_attempts < max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckinOutcome {
    Claimed,
    NotDue,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct AccountReport {
    skipped: bool,
    stats_ok: bool,
    checkin: Option<CheckinOutcome>,
    quests_completed: usize,
    quests_failed: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONSOLE
// ═══════════════════════════════════════════════════════════════════════════════
struct Console {
    offset: FixedOffset,
    quiet: bool,
    #[cfg(test)]
    transcript: std::sync::Mutex<Vec<String>>,
}

impl Console {
    fn new(offset: FixedOffset, quiet: bool) -> Self {
        Self {
            offset,
            quiet,
            #[cfg(test)]
            transcript: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn timestamp(&self) -> String {
        Utc::now()
            .with_timezone(&self.offset)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    fn emit(&self, msg: &str, styled: ColoredString) {
        #[cfg(test)]
        if let Ok(mut lines) = self.transcript.lock() {
            lines.push(msg.to_string());
        }
        println!("{} {}", format!("[{}]", self.timestamp()).cyan(), styled);
    }

    fn plain(&self, msg: impl AsRef<str>) {
        if !self.quiet {
            self.emit(msg.as_ref(), msg.as_ref().normal());
        }
    }

    fn info(&self, msg: impl AsRef<str>) {
        if !self.quiet {
            self.emit(msg.as_ref(), msg.as_ref().cyan());
        }
    }

    fn success(&self, msg: impl AsRef<str>) {
        self.emit(msg.as_ref(), msg.as_ref().green());
    }

    fn notice(&self, msg: impl AsRef<str>) {
        self.emit(msg.as_ref(), msg.as_ref().yellow());
    }

    fn fail(&self, msg: impl AsRef<str>) {
        self.emit(msg.as_ref(), msg.as_ref().red());
    }

    fn banner(&self) {
        if self.quiet {
            return;
        }
        print!("\x1b[H\x1b[2J");
        println!(
            "{}",
            "=== PROVIDENCE DAILY - check-in + daily quests ===\n".green().bold()
        );
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

// ═══════════════════════════════════════════════════════════════════════════════
// FORMATTING HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// `johnsmith@example.com` -> `joh***th@example.com`
fn mask_email(email: &str) -> String {
    let Some((local, domain)) = email.split_once('@') else {
        return UNKNOWN_EMAIL.to_string();
    };
    let chars: Vec<char> = local.chars().collect();
    let head: String = chars.iter().take(3).collect();
    let tail: String = chars[chars.len().saturating_sub(2)..].iter().collect();
    format!("{}{}{}@{}", head, MASK, tail, domain)
}

fn next_eligible_at(now: DateTime<Utc>, remaining_ms: f64, offset: &FixedOffset) -> String {
    let delta = TimeDelta::try_milliseconds(remaining_ms.max(0.0) as i64).unwrap_or(TimeDelta::zero());
    now.checked_add_signed(delta)
        .unwrap_or(now)
        .with_timezone(offset)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn format_countdown(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

fn number_or_zero(n: &Option<Number>) -> String {
    n.as_ref().map_or_else(|| "0".to_string(), Number::to_string)
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > 120 {
        format!("{}...", trimmed.chars().take(120).collect::<String>())
    } else {
        trimmed.to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// INPUT FILES
// ═══════════════════════════════════════════════════════════════════════════════
fn parse_tokens(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

async fn load_tokens(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Token file {} not found or unreadable", path.display()))?;
    let tokens = parse_tokens(&content);
    if tokens.is_empty() {
        bail!("Token file {} is empty", path.display());
    }
    Ok(tokens)
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROXY POOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered proxy list with sticky account bindings. The round-robin cursor is
/// shared by every account and only moves forward (wrapping).
#[derive(Debug, Default)]
struct ProxyPool {
    entries: Vec<ProxyEndpoint>,
    cursor: usize,
    bindings: HashMap<String, usize>,
}

impl ProxyPool {
    fn new(entries: Vec<ProxyEndpoint>) -> Self {
        Self {
            entries,
            ..Default::default()
        }
    }

    /// Returns the usable entries plus `(line number, error)` for rejected lines.
    fn parse(content: &str) -> (Vec<ProxyEndpoint>, Vec<(usize, RequestError)>) {
        let mut entries = Vec::new();
        let mut rejected = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match ProxyEndpoint::parse(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => rejected.push((idx + 1, e)),
            }
        }

        (entries, rejected)
    }

    async fn load(path: &Path, console: &Console) -> Self {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(_) => {
                console.notice(format!("{} not found, connecting directly", path.display()));
                return Self::default();
            }
        };

        let (entries, rejected) = Self::parse(&content);
        for (line_no, err) in &rejected {
            console.notice(format!("Skipping {} line {}: {}", path.display(), line_no, err));
        }

        if entries.is_empty() {
            console.notice(format!("{} is empty, connecting directly", path.display()));
        } else {
            console.success(format!("Loaded {} proxies", entries.len()));
        }
        Self::new(entries)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn advance(&mut self) -> usize {
        let idx = self.cursor;
        self.cursor = (self.cursor + 1) % self.entries.len();
        idx
    }

    /// Binds on first use; later calls return the same entry until `rotate`.
    fn assign(&mut self, account: &str) -> Option<ProxyEndpoint> {
        if self.is_empty() {
            return None;
        }
        let idx = match self.bindings.get(account) {
            Some(&idx) => idx,
            None => {
                let idx = self.advance();
                self.bindings.insert(account.to_string(), idx);
                idx
            }
        };
        Some(self.entries[idx].clone())
    }

    fn rotate(&mut self, account: &str) -> Option<ProxyEndpoint> {
        if self.is_empty() {
            return None;
        }
        let idx = self.advance();
        self.bindings.insert(account.to_string(), idx);
        Some(self.entries[idx].clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REQUEST EXECUTOR
// ═══════════════════════════════════════════════════════════════════════════════
#[derive(Debug, Clone)]
struct ApiCall {
    method: Method,
    path: &'static str,
    body: Option<Value>,
}

impl ApiCall {
    fn get(path: &'static str) -> Self {
        Self {
            method: Method::GET,
            path,
            body: None,
        }
    }

    fn post(path: &'static str, body: Option<Value>) -> Self {
        Self {
            method: Method::POST,
            path,
            body,
        }
    }

    fn user_stats() -> Self {
        Self::get(STATS_PATH)
    }

    fn checkin_status() -> Self {
        Self::get(CHECKIN_STATUS_PATH)
    }

    fn claim_checkin() -> Self {
        Self::post(CHECKIN_CLAIM_PATH, None)
    }

    fn daily_quests() -> Self {
        Self::get(DAILY_QUESTS_PATH)
    }

    fn complete_quest(id: &Value) -> Self {
        Self::post(QUEST_COMPLETE_PATH, Some(json!({ "questId": id })))
    }
}

/// Outbound side of the pipeline. No implementation retries on its own.
trait Transport {
    async fn call(
        &self,
        call: &ApiCall,
        token: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Value, RequestError>;

    async fn probe(&self, proxy: &ProxyEndpoint) -> Result<(), RequestError>;
}

struct HttpTransport {
    api_base: String,
    site_origin: String,
    probe_url: String,
    api_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpTransport {
    fn new(config: &RuntimeConfig) -> Self {
        Self {
            api_base: config.api_base.clone(),
            site_origin: config.site_origin.clone(),
            probe_url: config.probe_url.clone(),
            api_timeout: config.api_timeout,
            probe_timeout: config.probe_timeout,
        }
    }

    fn client(
        &self,
        proxy: Option<&ProxyEndpoint>,
        timeout: Duration,
    ) -> Result<reqwest::Client, RequestError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        builder = match proxy {
            Some(proxy) => builder.proxy(proxy.to_reqwest()?),
            // direct mode ignores HTTP(S)_PROXY from the environment
            None => builder.no_proxy(),
        };
        Ok(builder.build()?)
    }

    fn browser_headers(&self, token: &str) -> Result<HeaderMap, RequestError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGE_VALUE));
        headers.insert(ORIGIN, header_value(&self.site_origin)?);
        headers.insert(REFERER, header_value(&format!("{}/", self.site_origin))?);
        headers.insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
        headers.insert(
            COOKIE,
            header_value(&format!("{}={}", SESSION_COOKIE, token.trim()))?,
        );
        Ok(headers)
    }
}

impl Transport for HttpTransport {
    async fn call(
        &self,
        call: &ApiCall,
        token: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Value, RequestError> {
        let url = format!("{}{}", self.api_base, call.path);
        debug!(method = %call.method, path = call.path, proxy = ?proxy.map(|p| p.to_string()), "api request");

        let client = self.client(proxy, self.api_timeout)?;
        let mut request = client
            .request(call.method.clone(), &url)
            .headers(self.browser_headers(token)?);
        if let Some(body) = &call.body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(RequestError::Status {
                code: status.as_u16(),
                body: excerpt(&text),
            });
        }

        serde_json::from_str(&text).map_err(|e| RequestError::Decode(e.to_string()))
    }

    async fn probe(&self, proxy: &ProxyEndpoint) -> Result<(), RequestError> {
        let client = self.client(Some(proxy), self.probe_timeout)?;
        let response = client
            .get(&self.probe_url)
            .header(USER_AGENT, random_user_agent())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RequestError::Status {
                code: status.as_u16(),
                body: String::new(),
            })
        }
    }
}

fn random_user_agent() -> &'static str {
    let mut rng = rand::thread_rng();
    USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())]
}

fn header_value(value: &str) -> Result<HeaderValue, RequestError> {
    HeaderValue::from_str(value).map_err(|e| RequestError::InvalidHeader(e.to_string()))
}

fn payload<T: DeserializeOwned>(value: Value) -> Result<T, RequestError> {
    let envelope: Envelope<T> =
        serde_json::from_value(value).map_err(|e| RequestError::Decode(e.to_string()))?;
    envelope
        .data
        .ok_or_else(|| RequestError::Decode("response has no data".to_string()))
}

/// Write endpoints answer `{ success: bool, ... }`; anything but `true` is a rejection.
fn ensure_success(value: Value) -> Result<Value, RequestError> {
    if value.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(value);
    }
    let reason = ["message", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .unwrap_or("server did not confirm")
        .to_string();
    Err(RequestError::Rejected(reason))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ACCOUNT PIPELINE
// ═══════════════════════════════════════════════════════════════════════════════
struct AccountPipeline<'a, T: Transport> {
    transport: &'a T,
    config: &'a RuntimeConfig,
    console: &'a Console,
}

impl<'a, T: Transport> AccountPipeline<'a, T> {
    /// Every step runs regardless of how the previous one went. Only a bounded
    /// probe policy running out skips the account.
    async fn run(&self, token: &str, pool: &mut ProxyPool) -> AccountReport {
        let mut report = AccountReport::default();

        let proxy = if self.config.use_proxy {
            match self.connect(token, pool).await {
                Ok(proxy) => proxy,
                Err(attempts) => {
                    self.console.fail(format!(
                        "✗ No working proxy after {} probes, skipping account this cycle",
                        attempts
                    ));
                    report.skipped = true;
                    return report;
                }
            }
        } else {
            None
        };
        let proxy = proxy.as_ref();

        report.stats_ok = self.report_stats(token, proxy).await;
        report.checkin = Some(self.check_in(token, proxy).await);
        let (completed, failed) = self.sweep_quests(token, proxy).await;
        report.quests_completed = completed;
        report.quests_failed = failed;
        report
    }

    /// Probes the bound proxy, rotating on failure. `Ok(None)` means direct.
    async fn connect(&self, token: &str, pool: &mut ProxyPool) -> Result<Option<ProxyEndpoint>, u32> {
        let Some(mut proxy) = pool.assign(token) else {
            return Ok(None);
        };
        let mut failed = 0;

        loop {
            match self.transport.probe(&proxy).await {
                Ok(()) => {
                    self.console.info(format!("Proxy {} is reachable", proxy));
                    return Ok(Some(proxy));
                }
                Err(e) => {
                    failed += 1;
                    warn!(proxy = %proxy, attempt = failed, error = %e, "proxy probe failed");
                    if !self.config.probe_policy.allows_retry(failed) {
                        self.console.notice(format!("Proxy {} unreachable ({})", proxy, e));
                        return Err(failed);
                    }
                    self.console.notice(format!("Proxy {} unreachable ({}), rotating", proxy, e));
                    proxy = match pool.rotate(token) {
                        Some(next) => next,
                        None => return Ok(None),
                    };
                }
            }
        }
    }

    async fn report_stats(&self, token: &str, proxy: Option<&ProxyEndpoint>) -> bool {
        let result = self
            .transport
            .call(&ApiCall::user_stats(), token, proxy)
            .await
            .and_then(payload::<UserStats>);

        match result {
            Ok(stats) => {
                let email = stats
                    .user_email
                    .as_deref()
                    .map_or_else(|| UNKNOWN_EMAIL.to_string(), mask_email);
                self.console.info(format!(
                    "Account: {} | level {} | total {} XP",
                    email,
                    number_or_zero(&stats.level),
                    number_or_zero(&stats.total_xp)
                ));
                true
            }
            Err(e) => {
                self.console.fail(format!("✗ Stats unavailable: {}", e));
                false
            }
        }
    }

    async fn check_in(&self, token: &str, proxy: Option<&ProxyEndpoint>) -> CheckinOutcome {
        let status = match self
            .transport
            .call(&ApiCall::checkin_status(), token, proxy)
            .await
            .and_then(payload::<CheckinStatus>)
        {
            Ok(status) => status,
            Err(e) => {
                self.console.fail(format!("✗ Check-in status unavailable: {}", e));
                return CheckinOutcome::Failed;
            }
        };

        if !status.can_checkin_today {
            match status.next_checkin_in {
                Some(ms) => self.console.notice(format!(
                    "Already checked in, next check-in at {}",
                    next_eligible_at(Utc::now(), ms, &self.config.utc_offset)
                )),
                None => self.console.notice("Already checked in today"),
            }
            return CheckinOutcome::NotDue;
        }

        let claimed = self
            .transport
            .call(&ApiCall::claim_checkin(), token, proxy)
            .await
            .and_then(ensure_success);

        match claimed {
            Ok(value) => {
                let xp = payload::<CheckinReward>(value)
                    .map(|reward| number_or_zero(&reward.xp_earned))
                    .unwrap_or_else(|_| "0".to_string());
                self.console.success(format!("✓ Daily check-in +{} XP", xp));
                CheckinOutcome::Claimed
            }
            Err(e) => {
                self.console.fail(format!("✗ Daily check-in failed: {}", e));
                CheckinOutcome::Failed
            }
        }
    }

    /// Returns `(completed, failed)` for the quests this sweep attempted.
    async fn sweep_quests(&self, token: &str, proxy: Option<&ProxyEndpoint>) -> (usize, usize) {
        let quests = match self
            .transport
            .call(&ApiCall::daily_quests(), token, proxy)
            .await
            .and_then(payload::<Vec<Quest>>)
        {
            Ok(quests) => quests,
            Err(e) => {
                self.console.fail(format!("✗ Daily quests unavailable: {}", e));
                return (0, 0);
            }
        };

        if quests.is_empty() {
            self.console.info("No daily quests");
            return (0, 0);
        }

        let already = quests.iter().filter(|q| q.is_completed).count();
        self.console.plain(format!(
            "Found {} daily quests ({} completed)",
            quests.len(),
            already
        ));

        let mut completed = 0;
        let mut failed = 0;
        let mut first_request = true;

        for quest in &quests {
            if quest.is_completed {
                self.console.plain(format!("   ✓ {} already completed", quest.label()));
                continue;
            }

            if !first_request {
                sleep(self.config.quest_delay).await;
            }
            first_request = false;

            let result = self
                .transport
                .call(&ApiCall::complete_quest(&quest.id), token, proxy)
                .await
                .and_then(ensure_success);

            match result {
                Ok(_) => {
                    completed += 1;
                    self.console.success(format!(
                        "   ✓ {} +{} XP",
                        quest.label(),
                        number_or_zero(&quest.xp)
                    ));
                }
                Err(e) => {
                    failed += 1;
                    self.console.fail(format!("   ✗ {} failed: {}", quest.label(), e));
                }
            }
        }

        (completed, failed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUN LOOP
// ═══════════════════════════════════════════════════════════════════════════════
async fn run_cycle<T: Transport>(
    transport: &T,
    config: &RuntimeConfig,
    console: &Console,
    tokens: &[String],
    pool: &mut ProxyPool,
) -> Vec<AccountReport> {
    let pipeline = AccountPipeline {
        transport,
        config,
        console,
    };

    console.info(format!("Processing {} accounts", tokens.len()));
    let mut reports = Vec::with_capacity(tokens.len());

    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            sleep(config.account_delay).await;
        }
        console.plain(format!(
            "{} account {}/{} {}",
            "─".repeat(20),
            i + 1,
            tokens.len(),
            "─".repeat(20)
        ));
        reports.push(pipeline.run(token, pool).await);
    }

    let answered = reports.iter().filter(|r| r.stats_ok).count();
    let claimed = reports
        .iter()
        .filter(|r| r.checkin == Some(CheckinOutcome::Claimed))
        .count();
    let completed: usize = reports.iter().map(|r| r.quests_completed).sum();
    let failed: usize = reports.iter().map(|r| r.quests_failed).sum();
    let skipped = reports.iter().filter(|r| r.skipped).count();
    console.success(format!(
        "Cycle finished: {}/{} accounts answered, {} check-ins claimed, {} quests completed ({} failed), {} accounts skipped",
        answered,
        reports.len(),
        claimed,
        completed,
        failed,
        skipped
    ));

    reports
}

async fn countdown(wait: Duration, quiet: bool) {
    let total = wait.as_secs();
    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(total)
    };
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.cyan} next cycle in {msg} [{bar:40.cyan/blue}]")
    {
        bar.set_style(style.progress_chars("█▓░"));
    }

    let mut remaining = total;
    while remaining > 0 {
        bar.set_message(format_countdown(remaining));
        sleep(Duration::from_secs(1)).await;
        remaining -= 1;
        bar.inc(1);
    }
    bar.finish_and_clear();
}

async fn run_forever<T: Transport>(
    transport: &T,
    config: &RuntimeConfig,
    console: &Console,
    tokens: &[String],
    pool: &mut ProxyPool,
) {
    loop {
        run_cycle(transport, config, console, tokens, pool).await;
        console.success(format!(
            "All accounts done, waiting {} before the next cycle",
            format_countdown(config.cycle_wait.as_secs())
        ));
        countdown(config.cycle_wait, config.quiet).await;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MAIN
// ═══════════════════════════════════════════════════════════════════════════════
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    // Parse CLI arguments
    let args = Args::parse();

    // Load config file
    let file_config = load_config(args.config.as_deref()).await?;
    let config = RuntimeConfig::resolve(&args, &file_config)?;

    let console = Console::new(config.utc_offset, config.quiet);
    console.banner();

    let tokens = load_tokens(&config.tokens_file).await?;
    console.info(format!("Loaded {} accounts", tokens.len()));

    let mut pool = if config.use_proxy {
        ProxyPool::load(&config.proxy_file, &console).await
    } else {
        console.notice("Proxy disabled by config, connecting directly");
        ProxyPool::default()
    };
    if !pool.is_empty() {
        console.info(format!("Proxy mode on, {} proxies in rotation", pool.len()));
    }

    let transport = HttpTransport::new(&config);

    tokio::select! {
        _ = run_forever(&transport, &config, &console, &tokens, &mut pool) => Ok(()),
        _ = tokio::signal::ctrl_c() => {
            println!("\n{}", "Stopped manually".red());
            std::process::exit(0);
        }
    }
}
