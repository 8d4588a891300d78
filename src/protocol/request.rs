use super::ProtocolError;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Separates the command from its parameter string.
pub const COMMAND_DELIMITER: char = ':';
/// Separates `key=value` pairs.
pub const PAIR_SEPARATOR: char = ';';
/// Separates a key from its value.
pub const KEY_VALUE_SEPARATOR: char = '=';

/// Commands the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Menu,
    GetData,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Menu => "menu",
            Command::GetData => "getdata",
        }
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "version" => Ok(Command::Version),
            "menu" => Ok(Command::Menu),
            "getdata" => Ok(Command::GetData),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-sensitive request parameters.
///
/// Values are not escaped on the wire, so keys and values may not contain
/// `;`, `=` or line breaks. [`RequestParams::encode`] rejects them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams {
    values: BTreeMap<String, String>,
}

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, ProtocolError> {
        self.get(key)
            .ok_or_else(|| ProtocolError::MissingParameter(key.to_string()))
    }

    /// Parse a parameter, `None` if absent.
    pub fn parse_value<T: FromStr>(&self, key: &str) -> Result<Option<T>, ProtocolError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ProtocolError::InvalidParameter {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse `key1=val1;key2=val2`. Empty segments are ignored.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let mut params = RequestParams::new();
        for pair in raw.split(PAIR_SEPARATOR) {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once(KEY_VALUE_SEPARATOR)
                .ok_or_else(|| ProtocolError::MalformedParameter(pair.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ProtocolError::MalformedParameter(pair.to_string()));
            }
            params.insert(key, value.trim());
        }
        Ok(params)
    }

    /// Join as `key1=val1;key2=val2`.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let forbidden = |s: &str| {
            s.contains(|c: char| c == PAIR_SEPARATOR || c == KEY_VALUE_SEPARATOR || c == '\n' || c == '\r')
        };
        let mut out = String::new();
        for (key, value) in self.iter() {
            if forbidden(key) || forbidden(value) || key.is_empty() {
                return Err(ProtocolError::DelimiterInValue(format!("{}={}", key, value)));
            }
            if !out.is_empty() {
                out.push(PAIR_SEPARATOR);
            }
            out.push_str(key);
            out.push(KEY_VALUE_SEPARATOR);
            out.push_str(value);
        }
        Ok(out)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RequestParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = RequestParams::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// A parsed request line. The command is kept raw; resolving it is the
/// dispatcher's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: String,
    pub params: RequestParams,
}

impl Request {
    pub fn new(command: Command, params: RequestParams) -> Self {
        Request {
            command: command.as_str().to_string(),
            params,
        }
    }

    /// Encode as a newline-terminated request line.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        if self.params.is_empty() {
            return Ok(format!("{}{}\n", self.command, COMMAND_DELIMITER));
        }
        Ok(format!(
            "{}{} {}\n",
            self.command,
            COMMAND_DELIMITER,
            self.params.encode()?
        ))
    }
}

/// Split a request line on the first `:` into command and parameters.
pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (command, rest) = line
        .split_once(COMMAND_DELIMITER)
        .ok_or_else(|| ProtocolError::MalformedRequest(line.to_string()))?;
    let command = command.trim();
    if command.is_empty() {
        return Err(ProtocolError::MalformedRequest(line.to_string()));
    }
    Ok(Request {
        command: command.to_string(),
        params: RequestParams::parse(rest)?,
    })
}
