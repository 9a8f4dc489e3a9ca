//! Text line protocol.
//!
//! One request per line: a command word followed by space separated
//! `key=value` arguments. Values may be double quoted. Replies are a single
//! line, `OK:<urlencoded pairs>` or `ERR:<code>:<message>`.

use std::collections::{BTreeSet, HashMap};

use url::form_urlencoded;

use crate::error::BrokerError;
use crate::scheduler::{AffinityFilter, Job};

pub const MAX_SCOPE_LEN: usize = 64;
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Client identification: `client_node=<node> client_session=<session>`.
    Hello { node: String, session: String },
    SetScope { scope: String },
    Submit {
        payload: String,
        affinities: BTreeSet<String>,
    },
    Get2 {
        affinity: AffinityFilter,
        accept_unscoped: bool,
        port: Option<u16>,
        timeout_secs: u64,
    },
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    JobKey(String),
    Job(Job),
    Error(ErrorCode, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidParameter,
    ProtocolSyntax,
    QueueFull,
    ShutDown,
    Internal,
}

impl ErrorCode {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "eInvalidParameter",
            ErrorCode::ProtocolSyntax => "eProtocolSyntaxError",
            ErrorCode::QueueFull => "eQueueFull",
            ErrorCode::ShutDown => "eShuttingDown",
            ErrorCode::Internal => "eInternalError",
        }
    }
}

impl From<&BrokerError> for ErrorCode {
    fn from(err: &BrokerError) -> Self {
        match err {
            BrokerError::QueueFull(_) => ErrorCode::QueueFull,
            BrokerError::InvalidScope(_) | BrokerError::InvalidParameter(_) => {
                ErrorCode::InvalidParameter
            }
            BrokerError::Protocol(_) => ErrorCode::ProtocolSyntax,
            BrokerError::ShutDown => ErrorCode::ShutDown,
            BrokerError::InvariantViolation(_) | BrokerError::Io(_) => ErrorCode::Internal,
        }
    }
}

impl From<BrokerError> for Response {
    fn from(err: BrokerError) -> Self {
        Response::Error(ErrorCode::from(&err), err.to_string())
    }
}

impl Response {
    /// Wire form, without the trailing newline.
    pub fn to_line(&self) -> String {
        match self {
            Response::Ok => "OK:".to_string(),
            Response::JobKey(key) => {
                let body = form_urlencoded::Serializer::new(String::new())
                    .append_pair("job_key", key)
                    .finish();
                format!("OK:{body}")
            }
            Response::Job(job) => {
                let body = form_urlencoded::Serializer::new(String::new())
                    .append_pair("job_key", &job.id.to_string())
                    .append_pair("input", &job.payload)
                    .append_pair("scope", &job.scope)
                    .append_pair(
                        "affinity",
                        &job.affinities.iter().cloned().collect::<Vec<_>>().join(","),
                    )
                    .finish();
                format!("OK:{body}")
            }
            Response::Error(code, message) => {
                format!("ERR:{}:{}", code.as_str(), message.replace('\n', " "))
            }
        }
    }
}

/// Decode the body of an `OK:` reply into its key/value pairs.
pub fn parse_reply(line: &str) -> Result<HashMap<String, String>, BrokerError> {
    let line = line.trim_end();
    if let Some(body) = line.strip_prefix("OK:") {
        return Ok(form_urlencoded::parse(body.as_bytes())
            .into_owned()
            .collect());
    }
    Err(BrokerError::Protocol(line.to_string()))
}

/// Reject scopes that are too long or contain characters outside
/// `[A-Za-z0-9_.:-]`. The empty scope is valid and means "global".
pub fn validate_scope(scope: &str) -> Result<(), BrokerError> {
    if scope.len() > MAX_SCOPE_LEN {
        return Err(BrokerError::InvalidScope(format!(
            "scope longer than {MAX_SCOPE_LEN} bytes"
        )));
    }
    if let Some(c) = scope
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')))
    {
        return Err(BrokerError::InvalidScope(format!(
            "character {c:?} not allowed in scope {scope:?}"
        )));
    }
    Ok(())
}

pub fn parse_request(line: &str) -> Result<Request, BrokerError> {
    let tokens = tokenize(line)?;
    let Some((command, rest)) = tokens.split_first() else {
        return Err(BrokerError::Protocol("empty request".to_string()));
    };

    if command.starts_with("client_node=") {
        let args = Args::parse(&tokens)?;
        return Ok(Request::Hello {
            node: args.required("client_node")?.to_string(),
            session: args.get("client_session").unwrap_or_default().to_string(),
        });
    }

    let args = Args::parse(rest)?;
    match command.to_ascii_uppercase().as_str() {
        "SETSCOPE" => {
            let scope = args.get("scope").unwrap_or_default().to_string();
            validate_scope(&scope)?;
            Ok(Request::SetScope { scope })
        }
        "SUBMIT" => {
            let payload = match args.get("input") {
                Some(input) => input.to_string(),
                None => args
                    .positional
                    .first()
                    .cloned()
                    .ok_or_else(|| BrokerError::InvalidParameter("missing job input".into()))?,
            };
            Ok(Request::Submit {
                payload,
                affinities: args.list("aff"),
            })
        }
        "GET2" => {
            let tags = args.list("aff");
            let any = args.flag("any_aff")?.unwrap_or(tags.is_empty());
            Ok(Request::Get2 {
                affinity: AffinityFilter { any, tags },
                accept_unscoped: args.flag("accept_unscoped")?.unwrap_or(false),
                port: args.number("port")?.map(|p| p as u16),
                timeout_secs: args.number("timeout")?.unwrap_or(0),
            })
        }
        "QUIT" => Ok(Request::Quit),
        other => Err(BrokerError::Protocol(format!("unknown command {other}"))),
    }
}

struct Args {
    named: HashMap<String, String>,
    positional: Vec<String>,
}

impl Args {
    fn parse(tokens: &[String]) -> Result<Self, BrokerError> {
        let mut named = HashMap::new();
        let mut positional = Vec::new();
        for token in tokens {
            match token.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    if named.insert(key.to_string(), value.to_string()).is_some() {
                        return Err(BrokerError::Protocol(format!("duplicate argument {key}")));
                    }
                }
                _ => positional.push(token.clone()),
            }
        }
        Ok(Self { named, positional })
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.named.get(key).map(String::as_str)
    }

    fn required(&self, key: &str) -> Result<&str, BrokerError> {
        self.get(key)
            .ok_or_else(|| BrokerError::InvalidParameter(format!("missing {key}")))
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, BrokerError> {
        match self.get(key) {
            None => Ok(None),
            Some("1") | Some("true") => Ok(Some(true)),
            Some("0") | Some("false") => Ok(Some(false)),
            Some(other) => Err(BrokerError::InvalidParameter(format!(
                "{key} must be 0 or 1, got {other:?}"
            ))),
        }
    }

    fn number(&self, key: &str) -> Result<Option<u64>, BrokerError> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        let value: u64 = raw.parse().map_err(|_| {
            BrokerError::InvalidParameter(format!("{key} must be a non-negative integer"))
        })?;
        if key == "port" && (value == 0 || value > u16::MAX as u64) {
            return Err(BrokerError::InvalidParameter(format!(
                "port {value} out of range"
            )));
        }
        Ok(Some(value))
    }

    fn list(&self, key: &str) -> BTreeSet<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Split on whitespace, keeping double-quoted runs together.
/// `\"` and `\\` escape inside quotes.
fn tokenize(line: &str) -> Result<Vec<String>, BrokerError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = line.trim().chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            '\\' if quoted => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => return Err(BrokerError::Protocol("dangling escape".to_string())),
            },
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quoted {
        return Err(BrokerError::Protocol("unterminated quote".to_string()));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}
