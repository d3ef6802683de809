use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::ValidationError;

const MAX_SESSION_LEN: usize = 128;

/// Correlation token shared by every artifact and message of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Issues the session id for a batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionRegistry;

impl SessionRegistry {
    /// Returns the caller's id unchanged once it passes validation, or a
    /// fresh UUID v4 token when none (or an empty string) was supplied.
    /// Whitespace is validated like any other character and rejected.
    pub fn ensure(&self, supplied: Option<&str>) -> Result<SessionId, ValidationError> {
        match supplied {
            Some(raw) if !raw.is_empty() => {
                check_session(raw)?;
                Ok(SessionId(raw.to_string()))
            }
            _ => Ok(SessionId(Uuid::new_v4().to_string())),
        }
    }
}

pub(crate) fn check_session(raw: &str) -> Result<(), ValidationError> {
    let ok = !raw.is_empty()
        && raw.len() <= MAX_SESSION_LEN
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidSession(raw.to_string()))
    }
}
