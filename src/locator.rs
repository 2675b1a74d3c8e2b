use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, NaiveDate, NaiveTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Configuration problems detected while activating the sink.
///
/// These are raised once at startup; no send is ever attempted with a
/// descriptor that failed to parse.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("connection string is empty")]
    EmptyConnectionString,

    #[error("malformed connection string segment `{0}`, expected Key=Value")]
    MalformedPair(String),

    #[error("connection string is missing required key `{0}`")]
    MissingKey(&'static str),

    #[error("invalid BufferSize `{0}`, expected a non-negative integer")]
    InvalidBufferSize(String),

    #[error("invalid value `{value}` for key `{key}`")]
    InvalidValue { key: &'static str, value: String },

    #[error("invalid rolling index date format `{0}`")]
    InvalidDateFormat(String),
}

/// Recognized connection string keys.
pub mod keys {
    pub const SCHEME: &str = "Scheme";
    pub const USER: &str = "User";
    pub const PASSWORD: &str = "Pwd";
    pub const SERVER: &str = "Server";
    pub const PORT: &str = "Port";
    pub const INDEX: &str = "Index";
    pub const ROLLING: &str = "Rolling";
    pub const BUFFER_SIZE: &str = "BufferSize";
    pub const ROUTING: &str = "Routing";
}

/// Parsed `Key=Value;Key=Value` connection string.
///
/// Keys are case-insensitive and a repeated key overwrites the earlier
/// value, so a `BufferSize` appended by the host wins over one typed by
/// the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    parts: BTreeMap<String, String>,
}

impl ConnectionDescriptor {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Err(ConfigError::EmptyConnectionString);
        }

        let mut parts = BTreeMap::new();
        for segment in input.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedPair(segment.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::MalformedPair(segment.to_string()));
            }
            parts.insert(key.to_ascii_lowercase(), value.trim().to_string());
        }

        Ok(ConnectionDescriptor { parts })
    }

    /// Value for `key`, `None` when absent or blank.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.parts
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &'static str) -> Result<&str, ConfigError> {
        self.get(key).ok_or(ConfigError::MissingKey(key))
    }

    /// Buffer size threshold; absent means 0.
    pub fn buffer_size(&self) -> Result<usize, ConfigError> {
        match self.get(keys::BUFFER_SIZE) {
            None => Ok(0),
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidBufferSize(raw.to_string())),
        }
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectionDescriptor::parse(s)
    }
}

/// Wire shape of a flush: one request per event, or one `_bulk` request.
///
/// This is the only place the buffer-size threshold is compared; both the
/// endpoint path and the repository's dispatch derive from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Single,
    Bulk,
}

impl WriteMode {
    pub fn from_buffer_size(buffer_size: usize) -> Self {
        if buffer_size > 1 {
            WriteMode::Bulk
        } else {
            WriteMode::Single
        }
    }

    pub fn endpoint(self) -> &'static str {
        match self {
            WriteMode::Single => "_doc",
            WriteMode::Bulk => "_bulk",
        }
    }
}

/// Source of "today" for rolling index names.
pub trait Clock: Send + Sync + fmt::Debug {
    fn today(&self) -> NaiveDate;
}

/// Current UTC date.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

/// Clock pinned to a settable date, for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    days_from_ce: AtomicI32,
}

impl FixedClock {
    pub fn new(date: NaiveDate) -> Self {
        FixedClock {
            days_from_ce: AtomicI32::new(date.num_days_from_ce()),
        }
    }

    pub fn set(&self, date: NaiveDate) {
        self.days_from_ce.store(date.num_days_from_ce(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        let days = self.days_from_ce.load(Ordering::SeqCst);
        NaiveDate::from_num_days_from_ce_opt(days).unwrap_or(NaiveDate::MIN)
    }
}

/// Rolling index date pattern written with `yyyy`/`MM`/`dd` style tokens.
///
/// Supported tokens: `yyyy`, `yy`, `y`, `MMMM`, `MMM`, `MM`, `M`, `dddd`,
/// `ddd`, `dd`, `d`, `HH`, `H`, `hh`, `h`, `mm`, `m`, `ss`, `s`. Text inside
/// single quotes and any character after a backslash is copied literally,
/// as is every other non-letter character. Time-of-day tokens always
/// render midnight since the index rolls per day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatePattern {
    source: String,
    strftime: String,
}

pub const DEFAULT_DATE_FORMAT: &str = "yyyy.MM.dd";

impl Default for DatePattern {
    fn default() -> Self {
        DatePattern {
            source: DEFAULT_DATE_FORMAT.to_string(),
            strftime: "%Y.%m.%d".to_string(),
        }
    }
}

impl DatePattern {
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidDateFormat(pattern.to_string());
        if pattern.is_empty() {
            return Err(invalid());
        }

        let chars: Vec<char> = pattern.chars().collect();
        let mut out = String::new();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            match c {
                '\'' => {
                    let close = chars[i + 1..]
                        .iter()
                        .position(|&ch| ch == '\'')
                        .ok_or_else(invalid)?;
                    for &ch in &chars[i + 1..i + 1 + close] {
                        push_literal(&mut out, ch);
                    }
                    i += close + 2;
                }
                '\\' => {
                    let next = *chars.get(i + 1).ok_or_else(invalid)?;
                    push_literal(&mut out, next);
                    i += 2;
                }
                'y' | 'M' | 'd' | 'H' | 'h' | 'm' | 's' => {
                    let run = chars[i..].iter().take_while(|&&ch| ch == c).count();
                    let token = match (c, run) {
                        ('y', 4) => "%Y",
                        ('y', 2) => "%y",
                        ('y', 1) => "%-y",
                        ('M', 4) => "%B",
                        ('M', 3) => "%b",
                        ('M', 2) => "%m",
                        ('M', 1) => "%-m",
                        ('d', 4) => "%A",
                        ('d', 3) => "%a",
                        ('d', 2) => "%d",
                        ('d', 1) => "%-d",
                        ('H', 2) => "%H",
                        ('H', 1) => "%-H",
                        ('h', 2) => "%I",
                        ('h', 1) => "%-I",
                        ('m', 2) => "%M",
                        ('m', 1) => "%-M",
                        ('s', 2) => "%S",
                        ('s', 1) => "%-S",
                        _ => return Err(invalid()),
                    };
                    out.push_str(token);
                    i += run;
                }
                c if c.is_ascii_alphabetic() => return Err(invalid()),
                c => {
                    push_literal(&mut out, c);
                    i += 1;
                }
            }
        }

        if StrftimeItems::new(&out).any(|item| matches!(item, Item::Error)) {
            return Err(invalid());
        }

        Ok(DatePattern {
            source: pattern.to_string(),
            strftime: out,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn format(&self, date: NaiveDate) -> String {
        date.and_time(NaiveTime::MIN).format(&self.strftime).to_string()
    }
}

fn push_literal(out: &mut String, ch: char) {
    if ch == '%' {
        out.push_str("%%");
    } else {
        out.push(ch);
    }
}

/// Destination of one flush, computed fresh on every resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub scheme: String,
    pub server: String,
    pub port: Option<u16>,
    /// Percent-encoded `user:password`, when credentials are configured.
    pub user_info: Option<String>,
    pub index: String,
    pub routing: Option<String>,
    pub mode: WriteMode,
}

impl ResolvedTarget {
    /// `scheme://[userinfo@]server[:port]`
    pub fn base_url(&self) -> String {
        let mut base = format!("{}://", self.scheme);
        if let Some(user_info) = &self.user_info {
            base.push_str(user_info);
            base.push('@');
        }
        base.push_str(&self.server);
        if let Some(port) = self.port {
            base.push_str(&format!(":{}", port));
        }
        base
    }

    pub fn endpoint(&self) -> &'static str {
        self.mode.endpoint()
    }

    /// Full write URL including the endpoint path and routing query.
    pub fn url(&self) -> String {
        let mut url = format!("{}/{}/{}", self.base_url(), self.index, self.endpoint());
        if let Some(routing) = &self.routing {
            url.push_str("?routing=");
            url.push_str(&urlencoding::encode(routing));
        }
        url
    }
}

impl fmt::Display for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print credentials.
        write!(f, "{}://{}", self.scheme, self.server)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "/{}/{}", self.index, self.endpoint())
    }
}

/// Resolves the destination URL and index name for each flush.
#[derive(Debug, Clone)]
pub struct TargetLocator {
    scheme: String,
    server: String,
    port: Option<u16>,
    user_info: Option<String>,
    index: String,
    rolling: bool,
    routing: Option<String>,
    buffer_size: usize,
    date_pattern: DatePattern,
    clock: Arc<dyn Clock>,
}

impl TargetLocator {
    /// Validate a descriptor and build a locator.
    ///
    /// **Errors**
    /// - missing `Server` or `Index`
    /// - unparseable `BufferSize`, `Port` or `Rolling`
    pub fn new(
        descriptor: &ConnectionDescriptor,
        date_pattern: DatePattern,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let server = descriptor.require(keys::SERVER)?.to_string();
        let index = descriptor.require(keys::INDEX)?.to_string();
        let buffer_size = descriptor.buffer_size()?;

        let port = descriptor
            .get(keys::PORT)
            .map(|raw| {
                raw.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                    key: keys::PORT,
                    value: raw.to_string(),
                })
            })
            .transpose()?;

        let rolling = match descriptor.get(keys::ROLLING) {
            None => false,
            Some(raw) if raw.eq_ignore_ascii_case("true") => true,
            Some(raw) if raw.eq_ignore_ascii_case("false") => false,
            Some(raw) => {
                return Err(ConfigError::InvalidValue {
                    key: keys::ROLLING,
                    value: raw.to_string(),
                })
            }
        };

        let user_info = match (descriptor.get(keys::USER), descriptor.get(keys::PASSWORD)) {
            (Some(user), Some(password)) => Some(format!(
                "{}:{}",
                urlencoding::encode(user),
                urlencoding::encode(password)
            )),
            _ => None,
        };

        Ok(TargetLocator {
            scheme: descriptor.get(keys::SCHEME).unwrap_or("http").to_string(),
            server,
            port,
            user_info,
            index,
            rolling,
            routing: descriptor.get(keys::ROUTING).map(str::to_string),
            buffer_size,
            date_pattern,
            clock,
        })
    }

    /// Parse a connection string with the default date pattern and system clock.
    pub fn from_connection_string(connection_string: &str) -> Result<Self, ConfigError> {
        let descriptor = ConnectionDescriptor::parse(connection_string)?;
        TargetLocator::new(&descriptor, DatePattern::default(), Arc::new(SystemClock))
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn write_mode(&self) -> WriteMode {
        WriteMode::from_buffer_size(self.buffer_size)
    }

    pub fn is_rolling(&self) -> bool {
        self.rolling
    }

    /// Index name as of today.
    pub fn index_name(&self) -> String {
        if self.rolling {
            format!("{}-{}", self.index, self.date_pattern.format(self.clock.today()))
        } else {
            self.index.clone()
        }
    }

    pub fn resolve(&self) -> ResolvedTarget {
        ResolvedTarget {
            scheme: self.scheme.clone(),
            server: self.server.clone(),
            port: self.port,
            user_info: self.user_info.clone(),
            index: self.index_name(),
            routing: self.routing.clone(),
            mode: self.write_mode(),
        }
    }
}
