//! ---
//! relay_section: "02-messaging-ipc-data-model"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Message envelope codec and broker primitives."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
//! Topic names and subscription filters.
//!
//! Filters follow MQTT rules: `+` matches exactly one level, a trailing `#`
//! matches any number of levels (including none, so `sandbox/#` also matches
//! `sandbox`), and wildcards never match topics starting with `$` at the
//! first level.

use std::fmt;
use std::str::FromStr;

use crate::{MessagingError, Result};

/// Level separator.
pub const SEPARATOR: char = '/';
/// Single-level wildcard.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
/// Multi-level wildcard.
pub const MULTI_LEVEL_WILDCARD: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FilterSegment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// Validated subscription filter, immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    raw: String,
    segments: Vec<FilterSegment>,
}

impl TopicFilter {
    /// Parse and validate a filter string.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason| MessagingError::InvalidFilter {
            filter: raw.to_owned(),
            reason,
        };
        if raw.is_empty() {
            return Err(invalid("filter cannot be empty"));
        }

        let parts: Vec<&str> = raw.split(SEPARATOR).collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());
        for (index, part) in parts.into_iter().enumerate() {
            let segment = match part {
                MULTI_LEVEL_WILDCARD if index == last => FilterSegment::MultiLevel,
                MULTI_LEVEL_WILDCARD => {
                    return Err(invalid("'#' is only allowed as the last level"));
                }
                SINGLE_LEVEL_WILDCARD => FilterSegment::SingleLevel,
                literal if literal.contains(['+', '#']) => {
                    return Err(invalid("wildcards must occupy a whole level"));
                }
                literal => FilterSegment::Literal(literal.to_owned()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_owned(),
            segments,
        })
    }

    /// Filter as originally supplied.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the filter contains `+` or `#`.
    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| !matches!(segment, FilterSegment::Literal(_)))
    }

    /// Number of literal levels before the first wildcard; zero for filters
    /// without wildcards.
    pub fn literal_prefix_depth(&self) -> usize {
        if !self.has_wildcards() {
            return 0;
        }
        self.segments
            .iter()
            .take_while(|segment| matches!(segment, FilterSegment::Literal(_)))
            .count()
    }

    /// Check whether a concrete topic name matches this filter.
    pub fn matches(&self, topic: &str) -> bool {
        let levels: Vec<&str> = topic.split(SEPARATOR).collect();
        if topic.starts_with('$')
            && !matches!(self.segments.first(), Some(FilterSegment::Literal(_)))
        {
            return false;
        }

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                FilterSegment::MultiLevel => return true,
                FilterSegment::SingleLevel => {
                    if index >= levels.len() {
                        return false;
                    }
                }
                FilterSegment::Literal(expected) => {
                    if levels.get(index) != Some(&expected.as_str()) {
                        return false;
                    }
                }
            }
        }
        levels.len() == self.segments.len()
    }
}

impl FromStr for TopicFilter {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Reject topic names that cannot be published to.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    let invalid = |reason| MessagingError::InvalidTopic {
        topic: topic.to_owned(),
        reason,
    };
    if topic.is_empty() {
        return Err(invalid("topic cannot be empty"));
    }
    if topic.contains(['+', '#']) {
        return Err(invalid("wildcards are not allowed in topic names"));
    }
    Ok(())
}

/// Per-source publish topic `<prefix>/<source_id>`.
pub fn source_topic(prefix: &str, source_id: &str) -> String {
    format!("{}{}{}", prefix.trim_end_matches(SEPARATOR), SEPARATOR, source_id)
}
