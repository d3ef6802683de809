use std::collections::BTreeMap;

use pagestream_core::ContentKind;

use crate::publish::{BrokerMessage, HEADER_CONTENT_TYPE, HEADER_SESSION};

const SESSION_ALIASES: [&str; 2] = [HEADER_SESSION, "session"];
const CONTENT_TYPE_ALIASES: [&str; 2] = [HEADER_CONTENT_TYPE, "content_type"];

/// Consumer-side selection of one batch and, optionally, one content kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub session: Option<String>,
    pub kind: Option<ContentKind>,
}

impl SessionFilter {
    pub fn new(session: Option<String>, kind: Option<ContentKind>) -> Self {
        Self { session, kind }
    }

    pub fn matches(&self, headers: &BTreeMap<String, String>) -> bool {
        if let Some(session) = &self.session {
            if lookup(headers, &SESSION_ALIASES) != Some(session.as_str()) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            match lookup(headers, &CONTENT_TYPE_ALIASES) {
                Some(content_type) if content_type_is(content_type, kind) => {}
                _ => return false,
            }
        }
        true
    }

    pub fn matches_message(&self, message: &BrokerMessage) -> bool {
        self.matches(&message.headers)
    }
}

fn lookup<'a>(headers: &'a BTreeMap<String, String>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| headers.get(*name))
        .map(String::as_str)
}

/// Compares the media type only, so `text/html; charset=utf-8` still matches.
fn content_type_is(content_type: &str, kind: ContentKind) -> bool {
    let media = content_type.split(';').next().unwrap_or(content_type).trim();
    media.eq_ignore_ascii_case(kind.mime_type())
}
