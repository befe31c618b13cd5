/// Directory wire protocol
///
/// One request line and one response line per connection, both ending in
/// `\n` (added and stripped by the framing layer, not by these codecs).
///
/// | Request        | Success                    | Failure |
/// |----------------|----------------------------|---------|
/// | `U\|<user>`    | `K`                        | `E`     |
/// | `F\|<user>`    | `4\|<ipv4>` or `6\|<ipv6>` | `E`     |

use peerchat_common::Username;
use std::fmt;
use std::net::IpAddr;

pub const METHOD_UPDATE: char = 'U';
pub const METHOD_FETCH: char = 'F';
pub const FIELD_SEPARATOR: char = '|';
pub const OK_RESPONSE: &str = "K";
pub const ERR_RESPONSE: &str = "E";
pub const FAMILY_V4: char = '4';
pub const FAMILY_V6: char = '6';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryRequest {
    /// Register the caller's transport address under a username
    Update(Username),
    /// Resolve a username to its registered address
    Fetch(Username),
}

impl DirectoryRequest {
    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (method, rest) = split_method(line)?;
        let username = Username::new(rest).map_err(|e| ProtocolError::BadUsername(e.to_string()))?;

        match method {
            METHOD_UPDATE => Ok(Self::Update(username)),
            METHOD_FETCH => Ok(Self::Fetch(username)),
            other => Err(ProtocolError::UnknownMethod(other)),
        }
    }
}

impl fmt::Display for DirectoryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update(name) => write!(f, "{}{}{}", METHOD_UPDATE, FIELD_SEPARATOR, name),
            Self::Fetch(name) => write!(f, "{}{}{}", METHOD_FETCH, FIELD_SEPARATOR, name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryResponse {
    Ok,
    Address(IpAddr),
    Error,
}

impl DirectoryResponse {
    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        match line {
            OK_RESPONSE => return Ok(Self::Ok),
            ERR_RESPONSE => return Ok(Self::Error),
            _ => {}
        }

        let (family, text) = split_method(line)?;
        let address = match family {
            FAMILY_V4 => text.parse().map(IpAddr::V4),
            FAMILY_V6 => text.parse().map(IpAddr::V6),
            other => return Err(ProtocolError::UnknownFamily(other)),
        }
        .map_err(|_| ProtocolError::BadAddress(text.to_string()))?;

        Ok(Self::Address(address))
    }
}

impl fmt::Display for DirectoryResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str(OK_RESPONSE),
            Self::Error => f.write_str(ERR_RESPONSE),
            Self::Address(IpAddr::V4(v4)) => write!(f, "{}{}{}", FAMILY_V4, FIELD_SEPARATOR, v4),
            Self::Address(IpAddr::V6(v6)) => write!(f, "{}{}{}", FAMILY_V6, FIELD_SEPARATOR, v6),
        }
    }
}

/// Split `X|rest` into its one-character tag and the remainder
fn split_method(line: &str) -> Result<(char, &str), ProtocolError> {
    let mut chars = line.chars();
    let tag = chars.next().ok_or(ProtocolError::Empty)?;
    let rest = chars.as_str();
    let rest = rest
        .strip_prefix(FIELD_SEPARATOR)
        .ok_or_else(|| ProtocolError::Malformed(line.to_string()))?;
    Ok((tag, rest))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,

    #[error("malformed frame: {0:?}")]
    Malformed(String),

    #[error("unknown method {0:?}")]
    UnknownMethod(char),

    #[error("unknown address family {0:?}")]
    UnknownFamily(char),

    #[error("invalid username: {0}")]
    BadUsername(String),

    #[error("invalid address: {0:?}")]
    BadAddress(String),
}
