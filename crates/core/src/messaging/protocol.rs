use crate::directory::{ERR_RESPONSE, FIELD_SEPARATOR, OK_RESPONSE};
use peerchat_common::config::protocol::MAX_MESSAGE_FRAME;
use peerchat_common::Username;
use std::fmt;

/// `<username>|<content>`: a chat message from `username`.
///
/// The username is the claimed sender; the receiving service checks the
/// claim against the certificate the sender presented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub username: Username,
    pub content: String,
}

impl SendRequest {
    pub fn new(username: Username, content: impl Into<String>) -> Result<Self, MessageError> {
        let request = Self {
            username,
            content: content.into(),
        };
        request.validate()?;
        Ok(request)
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Split at the first separator; the content may itself contain `|`
    pub fn parse(line: &str) -> Result<Self, MessageError> {
        let (name, content) = line
            .split_once(FIELD_SEPARATOR)
            .ok_or(MessageError::MissingSeparator)?;
        let username = Username::new(name).map_err(|e| MessageError::BadUsername(e.to_string()))?;
        Self::new(username, content)
    }

    fn validate(&self) -> Result<(), MessageError> {
        if self.content.is_empty() {
            return Err(MessageError::EmptyContent);
        }
        if self.content.contains('\n') {
            return Err(MessageError::NewlineInContent);
        }
        let len = self.username.as_str().len() + 1 + self.content.len();
        if len > MAX_MESSAGE_FRAME {
            return Err(MessageError::TooLong {
                max: MAX_MESSAGE_FRAME,
                actual: len,
            });
        }
        Ok(())
    }
}

impl fmt::Display for SendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.username, FIELD_SEPARATOR, self.content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResponse {
    Accepted,
    Rejected,
}

impl SendResponse {
    pub fn encode(&self) -> &'static str {
        match self {
            Self::Accepted => OK_RESPONSE,
            Self::Rejected => ERR_RESPONSE,
        }
    }

    pub fn parse(line: &str) -> Result<Self, MessageError> {
        match line {
            OK_RESPONSE => Ok(Self::Accepted),
            ERR_RESPONSE => Ok(Self::Rejected),
            other => Err(MessageError::UnknownResponse(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("message has no username separator")]
    MissingSeparator,

    #[error("bad sender username: {0}")]
    BadUsername(String),

    #[error("message content is empty")]
    EmptyContent,

    #[error("message content contains a newline")]
    NewlineInContent,

    #[error("message too long: at most {max} bytes, got {actual}")]
    TooLong { max: usize, actual: usize },

    #[error("unknown response {0:?}")]
    UnknownResponse(String),
}
