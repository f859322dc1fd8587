//! Transform eligibility.

use std::fmt;
use std::ops::RangeInclusive;

use feedpipe_core::config::PolicySection;
use feedpipe_stream::ResponseHead;

/// Why a response was passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Status outside the transformable range.
    Status(u16),
    /// Declared content type not in the allow-list.
    ContentType(Option<String>),
    /// Body empty, or only whitespace within the sniff window.
    NoContent,
    /// First significant byte is not the marker.
    NotMarker(u8),
    /// The body could not be read while sniffing.
    Unreadable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Status(status) => write!(f, "status {status}"),
            SkipReason::ContentType(Some(ct)) => write!(f, "content type {ct}"),
            SkipReason::ContentType(None) => f.write_str("no content type"),
            SkipReason::NoContent => f.write_str("no content"),
            SkipReason::NotMarker(b) => write!(f, "body starts with {:?}", char::from(*b)),
            SkipReason::Unreadable => f.write_str("unreadable body"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Transform,
    Passthrough(SkipReason),
}

/// Decides whether a response is handed to an engine.
#[derive(Debug, Clone)]
pub struct TransformPolicy {
    pub statuses: RangeInclusive<u16>,
    /// Matched as case-insensitive substrings of the declared type.
    pub content_types: Vec<String>,
    pub require_content_type: bool,
    pub marker: u8,
    pub sniff_window: usize,
}

impl Default for TransformPolicy {
    fn default() -> Self {
        Self::from(&PolicySection::default())
    }
}

impl From<&PolicySection> for TransformPolicy {
    fn from(section: &PolicySection) -> Self {
        Self {
            statuses: section.status_min..=section.status_max,
            content_types: section.content_types.clone(),
            require_content_type: section.require_content_type,
            // Validated as ASCII when the config is loaded.
            marker: u8::try_from(section.marker).unwrap_or(b'<'),
            sniff_window: section.sniff_window,
        }
    }
}

impl TransformPolicy {
    pub fn accepts_status(&self, status: u16) -> bool {
        self.statuses.contains(&status)
    }

    pub fn recognizes_content_type(&self, content_type: Option<&str>) -> bool {
        let Some(content_type) = content_type else {
            return false;
        };
        let content_type = content_type.to_ascii_lowercase();
        self.content_types
            .iter()
            .any(|known| content_type.contains(&known.to_ascii_lowercase()))
    }

    /// Classify a response from its head and first significant body byte.
    pub fn classify(&self, head: &ResponseHead, sniffed: Option<u8>) -> Classification {
        if !self.accepts_status(head.status) {
            return Classification::Passthrough(SkipReason::Status(head.status));
        }
        if self.require_content_type && !self.recognizes_content_type(head.content_type()) {
            return Classification::Passthrough(SkipReason::ContentType(
                head.content_type().map(str::to_string),
            ));
        }
        match sniffed {
            None => Classification::Passthrough(SkipReason::NoContent),
            Some(b) if b == self.marker => Classification::Transform,
            Some(b) => Classification::Passthrough(SkipReason::NotMarker(b)),
        }
    }
}
