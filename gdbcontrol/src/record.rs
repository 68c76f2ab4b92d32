//! GDB/MI output records
//!
//! Only the outer shape of each line is decoded: result records are routed
//! by token, async records by class, and the few fields this crate reads
//! are pulled out of the raw body on demand.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub enum MiRecord {
    Result(MiResult),
    Async(AsyncRecord),
    Stream(StreamRecord),
    /// The `(gdb)` prompt that ends every output batch
    Prompt,
}

/// GDB/MI result classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

/// A `^` result record answering one command
#[derive(Debug, Clone, PartialEq)]
pub struct MiResult {
    pub token: Option<u32>,
    pub class: ResultClass,
    /// Everything after the first comma, undecoded
    pub body: String,
}

impl MiResult {
    /// The `msg` field of an `^error` record.
    pub fn message(&self) -> Option<String> {
        string_field(&self.body, "msg")
    }

    pub fn field(&self, name: &str) -> Option<String> {
        string_field(&self.body, name)
    }

    /// A list of C strings such as `features=["a","b"]`.
    pub fn string_list(&self, name: &str) -> Vec<String> {
        string_list_field(&self.body, name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncKind {
    /// `*` records: execution state
    Exec,
    /// `+` records: progress
    Status,
    /// `=` records: everything else
    Notify,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AsyncClass {
    Running,
    Stopped,
    ThreadGroupStarted,
    ThreadGroupExited,
    Other(String),
}

impl AsyncClass {
    fn from_name(name: &str) -> Self {
        match name {
            "running" => AsyncClass::Running,
            "stopped" => AsyncClass::Stopped,
            "thread-group-started" => AsyncClass::ThreadGroupStarted,
            "thread-group-exited" => AsyncClass::ThreadGroupExited,
            other => AsyncClass::Other(other.to_string()),
        }
    }
}

/// An unsolicited `*`, `+` or `=` record
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncRecord {
    pub kind: AsyncKind,
    pub class: AsyncClass,
    pub body: String,
}

impl AsyncRecord {
    pub fn field(&self, name: &str) -> Option<String> {
        string_field(&self.body, name)
    }
}

/// Types of GDB/MI streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Console, // ~ prefix
    Target,  // @ prefix
    Log,     // & prefix
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub stream_type: StreamType,
    pub content: String,
}

type CachedRegex = OnceLock<Result<Regex, regex::Error>>;

fn cached(cell: &'static CachedRegex, pattern: &str) -> Result<&'static Regex, String> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| format!("Regex error: {}", e))
}

fn result_regex() -> Result<&'static Regex, String> {
    static RE: CachedRegex = OnceLock::new();
    cached(&RE, r"^(\d+)?\^(done|running|connected|error|exit)(?:,(.*))?$")
}

fn async_regex() -> Result<&'static Regex, String> {
    static RE: CachedRegex = OnceLock::new();
    cached(&RE, r"^(\d+)?([*+=])([A-Za-z0-9_-]+)(?:,(.*))?$")
}

fn quoted_regex() -> Result<&'static Regex, String> {
    static RE: CachedRegex = OnceLock::new();
    cached(&RE, r#""((?:[^"\\]|\\.)*)""#)
}

/// Classify one line of GDB/MI output
pub fn parse_record(line: &str) -> Result<MiRecord, String> {
    let line = line.trim();

    if line.is_empty() {
        return Err("Empty line".into());
    }
    if line == "(gdb)" {
        return Ok(MiRecord::Prompt);
    }

    if let Some(stream) = parse_stream_record(line) {
        return Ok(MiRecord::Stream(stream));
    }

    if let Some(caps) = result_regex()?.captures(line) {
        let class = match &caps[2] {
            "done" => ResultClass::Done,
            "running" => ResultClass::Running,
            "connected" => ResultClass::Connected,
            "error" => ResultClass::Error,
            _ => ResultClass::Exit,
        };
        return Ok(MiRecord::Result(MiResult {
            token: caps.get(1).and_then(|m| m.as_str().parse().ok()),
            class,
            body: caps.get(3).map_or_else(String::new, |m| m.as_str().to_string()),
        }));
    }

    if let Some(caps) = async_regex()?.captures(line) {
        let kind = match &caps[2] {
            "*" => AsyncKind::Exec,
            "+" => AsyncKind::Status,
            _ => AsyncKind::Notify,
        };
        return Ok(MiRecord::Async(AsyncRecord {
            kind,
            class: AsyncClass::from_name(&caps[3]),
            body: caps.get(4).map_or_else(String::new, |m| m.as_str().to_string()),
        }));
    }

    Err(format!("Unknown GDB/MI output format: {}", line))
}

fn parse_stream_record(line: &str) -> Option<StreamRecord> {
    let mut chars = line.chars();
    let stream_type = match chars.next()? {
        '~' => StreamType::Console,
        '@' => StreamType::Target,
        '&' => StreamType::Log,
        _ => return None,
    };
    let rest = chars.as_str();
    let content = match rest.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(inner) => unescape(inner),
        None => rest.to_string(),
    };
    Some(StreamRecord {
        stream_type,
        content,
    })
}

fn field_regex() -> Result<&'static Regex, String> {
    static RE: CachedRegex = OnceLock::new();
    cached(&RE, r#"(?:^|[,{\[])([A-Za-z0-9_-]+)="((?:[^"\\]|\\.)*)""#)
}

fn list_field_regex() -> Result<&'static Regex, String> {
    static RE: CachedRegex = OnceLock::new();
    cached(&RE, r"(?:^|,)([A-Za-z0-9_-]+)=\[([^\]]*)\]")
}

fn string_field(body: &str, name: &str) -> Option<String> {
    field_regex()
        .ok()?
        .captures_iter(body)
        .find(|caps| &caps[1] == name)
        .map(|caps| unescape(&caps[2]))
}

fn string_list_field(body: &str, name: &str) -> Vec<String> {
    let (Ok(lists), Ok(quoted)) = (list_field_regex(), quoted_regex()) else {
        return Vec::new();
    };
    match lists.captures_iter(body).find(|caps| &caps[1] == name) {
        Some(caps) => quoted
            .captures_iter(&caps[2])
            .map(|item| unescape(&item[1]))
            .collect(),
        None => Vec::new(),
    }
}

/// Undo C-string escaping of the text between the quotes.
fn unescape(content: &str) -> String {
    let mut result = String::with_capacity(content.len());
    let mut chars = content.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            result.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('t') => result.push('\t'),
            Some('r') => result.push('\r'),
            Some('\\') => result.push('\\'),
            Some('"') => result.push('"'),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }

    result
}

/// Quote a string for use as an MI command argument.
pub fn quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for ch in text.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}
