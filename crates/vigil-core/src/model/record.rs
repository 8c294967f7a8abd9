//! Access-log record and its line parser.
//!
//! The file source feeds lines in the extended combined format: the
//! standard combined fields followed by optional `key=value` pairs.
//!
//! ```text
//! 1.2.3.4 - - [10/Oct/2025:13:55:36 +0000] "GET /a?q=1 HTTP/1.1" 200 2326
//!   "http://ref" "Mozilla/5.0 ..." host=example.com cc=US rid=abc|gzip
//!   rt=0.123 urt=0.100
//! ```
//!
//! Recognized extensions: `host`, `cc` (country code), `rid`
//! (`request_id` or `request_id|accept_encoding`), `rt` (request time,
//! seconds), `urt` (upstream time, seconds), `ae` (accept-encoding).

use chrono::DateTime;

/// HTTP methods as a closed enumeration plus an `Unknown` bucket.
/// `index()` is stable and below 16, so the per-session method
/// histogram can be a fixed array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Unknown,
}

impl HttpMethod {
    pub fn parse(s: &str) -> Self {
        match s {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "CONNECT" => Self::Connect,
            "OPTIONS" => Self::Options,
            "TRACE" => Self::Trace,
            "PATCH" => Self::Patch,
            _ => Self::Unknown,
        }
    }

    /// Histogram slot, always `< 16`.
    pub fn index(self) -> usize {
        match self {
            Self::Get => 0,
            Self::Head => 1,
            Self::Post => 2,
            Self::Put => 3,
            Self::Delete => 4,
            Self::Connect => 5,
            Self::Options => 6,
            Self::Trace => 7,
            Self::Patch => 8,
            Self::Unknown => 9,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Patch => "PATCH",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// One parsed request event.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Monotonic line number assigned by the source, for debugging.
    pub line_number: u64,
    /// Event timestamp, milliseconds since epoch.
    pub timestamp_ms: u64,
    /// Client IP in printable form.
    pub ip: String,
    pub method: HttpMethod,
    /// Full path, query string retained.
    pub path: String,
    pub protocol: String,
    pub status: u16,
    pub bytes_sent: u64,
    /// Request duration in seconds, when the source provides it.
    pub request_time_s: Option<f64>,
    /// Upstream duration in seconds, when the source provides it.
    pub upstream_time_s: Option<f64>,
    pub user_agent: String,
    pub referer: String,
    pub host: String,
    pub country_code: String,
    pub request_id: String,
    pub accept_encoding: String,
    /// False for lines the parser could not make sense of.
    pub successfully_parsed: bool,
    /// Truncated raw line kept for alert samples.
    pub raw_sample: String,
}

/// Raw-line sample length retained on each record.
const RAW_SAMPLE_CAP: usize = 256;

impl LogRecord {
    /// Path without its query string.
    pub fn path_without_query(&self) -> &str {
        match self.path.find('?') {
            Some(idx) => &self.path[..idx],
            None => &self.path,
        }
    }

    /// Query string without the leading `?`, if present.
    pub fn query(&self) -> Option<&str> {
        self.path.find('?').map(|idx| &self.path[idx + 1..])
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    /// Parse one line in the extended combined format. Returns `None`
    /// for lines that do not carry the mandatory fields; the source
    /// counts those as malformed.
    pub fn parse(line: &str, line_number: u64) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let mut cursor = Cursor::new(line);

        let ip = cursor.token()?.to_string();
        let _ident = cursor.token()?;
        let _user = cursor.token()?;
        let time_str = cursor.bracketed()?;
        let request = cursor.quoted()?;
        let status: u16 = cursor.token()?.parse().ok()?;
        let bytes_sent: u64 = match cursor.token()? {
            "-" => 0,
            s => s.parse().ok()?,
        };
        let referer = cursor.quoted().unwrap_or("-").to_string();
        let user_agent = cursor.quoted().unwrap_or("-").to_string();

        let timestamp_ms = parse_clf_time(time_str)?;

        // "METHOD path proto" — proto may be absent on malformed requests.
        let mut request_parts = request.splitn(3, ' ');
        let method = HttpMethod::parse(request_parts.next()?);
        let path = request_parts.next()?.to_string();
        let protocol = request_parts.next().unwrap_or("").to_string();

        let mut record = Self {
            line_number,
            timestamp_ms,
            ip,
            method,
            path,
            protocol,
            status,
            bytes_sent,
            request_time_s: None,
            upstream_time_s: None,
            user_agent: dash_to_empty(user_agent),
            referer: dash_to_empty(referer),
            host: String::new(),
            country_code: String::new(),
            request_id: String::new(),
            accept_encoding: String::new(),
            successfully_parsed: true,
            raw_sample: truncate(line, RAW_SAMPLE_CAP),
        };

        // Trailing key=value extensions, in any order.
        while let Some(token) = cursor.token() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "host" => record.host = value.to_string(),
                "cc" => record.country_code = value.to_string(),
                "ae" => record.accept_encoding = value.to_string(),
                "rid" => match value.split_once('|') {
                    Some((rid, ae)) => {
                        record.request_id = rid.to_string();
                        if record.accept_encoding.is_empty() {
                            record.accept_encoding = ae.to_string();
                        }
                    }
                    None => record.request_id = value.to_string(),
                },
                "rt" => record.request_time_s = value.parse().ok(),
                "urt" => record.upstream_time_s = value.parse().ok(),
                _ => {}
            }
        }

        Some(record)
    }

    /// A placeholder record for a line that failed to parse. Keeps the
    /// sample so operators can inspect what was dropped.
    pub fn malformed(line: &str, line_number: u64) -> Self {
        Self {
            line_number,
            timestamp_ms: 0,
            ip: String::new(),
            method: HttpMethod::Unknown,
            path: String::new(),
            protocol: String::new(),
            status: 0,
            bytes_sent: 0,
            request_time_s: None,
            upstream_time_s: None,
            user_agent: String::new(),
            referer: String::new(),
            host: String::new(),
            country_code: String::new(),
            request_id: String::new(),
            accept_encoding: String::new(),
            successfully_parsed: false,
            raw_sample: truncate(line, RAW_SAMPLE_CAP),
        }
    }
}

fn dash_to_empty(s: String) -> String {
    if s == "-" { String::new() } else { s }
}

fn truncate(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_string();
    }
    let mut end = cap;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// `[10/Oct/2025:13:55:36 +0000]` body → epoch milliseconds.
fn parse_clf_time(s: &str) -> Option<u64> {
    let dt = DateTime::parse_from_str(s, "%d/%b/%Y:%H:%M:%S %z").ok()?;
    let ms = dt.timestamp_millis();
    if ms < 0 { None } else { Some(ms as u64) }
}

/// Minimal scanner over a log line: whitespace tokens, `"..."` and
/// `[...]` groups.
struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    fn skip_spaces(&mut self) {
        self.rest = self.rest.trim_start_matches(' ');
    }

    fn token(&mut self) -> Option<&'a str> {
        self.skip_spaces();
        if self.rest.is_empty() {
            return None;
        }
        let end = self.rest.find(' ').unwrap_or(self.rest.len());
        let (token, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(token)
    }

    fn quoted(&mut self) -> Option<&'a str> {
        self.delimited('"', '"')
    }

    fn bracketed(&mut self) -> Option<&'a str> {
        self.delimited('[', ']')
    }

    fn delimited(&mut self, open: char, close: char) -> Option<&'a str> {
        self.skip_spaces();
        let rest = self.rest.strip_prefix(open)?;
        let end = rest.find(close)?;
        let inner = &rest[..end];
        self.rest = &rest[end + close.len_utf8()..];
        Some(inner)
    }
}
