// Copyright 2025 The Inlet Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Topic filters and hierarchical wildcard matching.
//!
//! Filters follow the standard MQTT rules: `+` matches exactly one topic
//! level, `#` matches the remaining levels (including the parent level) and
//! is only valid as the final segment. Topics starting with `$` (broker
//! internals such as `$SYS`) never match a filter that begins with a
//! wildcard.

use std::fmt;

use thiserror::Error;

/// A validated MQTT topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    raw: String,
}

/// Rejected topic-filter syntax.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("topic filter is empty")]
    Empty,
    #[error("`#` must be the final segment of a filter: `{0}`")]
    MultiLevelNotLast(String),
    #[error("wildcard must occupy a whole segment: `{0}`")]
    PartialWildcard(String),
}

impl TopicFilter {
    /// Validate and build a filter.
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        if raw.is_empty() {
            return Err(FilterError::Empty);
        }

        let last = raw.split('/').count() - 1;
        for (i, segment) in raw.split('/').enumerate() {
            if segment.contains('#') {
                if segment != "#" {
                    return Err(FilterError::PartialWildcard(raw.to_string()));
                }
                if i != last {
                    return Err(FilterError::MultiLevelNotLast(raw.to_string()));
                }
            }
            if segment.contains('+') && segment != "+" {
                return Err(FilterError::PartialWildcard(raw.to_string()));
            }
        }

        Ok(Self { raw: raw.to_string() })
    }

    /// The filter as it was written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `topic` (a concrete topic name, no wildcards) matches this
    /// filter.
    pub fn matches(&self, topic: &str) -> bool {
        // $-prefixed topics are reserved; a leading wildcard never sees them.
        if topic.starts_with('$') && (self.raw.starts_with('#') || self.raw.starts_with('+')) {
            return false;
        }

        let mut segments = self.raw.split('/');
        let mut levels = topic.split('/');
        loop {
            match (segments.next(), levels.next()) {
                // `#` swallows everything that remains, parent level included.
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => continue,
                (Some(segment), Some(level)) if segment == level => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
