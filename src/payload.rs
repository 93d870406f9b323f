//! Event payload model.
//!
//! Pubsub delivers loosely shaped JSON documents. They are decoded once into a
//! [`Payload`] so the matcher never has to care which of the two commit shapes
//! (svn-style `changed` mapping or git-style `files` list) arrived.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::SourceError;

/// Changed paths of a commit, normalized from whichever shape the event used.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChangeSet {
    /// Keys of a `changed` mapping (svn commits).
    Changed(Vec<String>),
    /// Entries of a `files` list (git commits).
    Files(Vec<String>),
    /// The commit carried no change information.
    #[default]
    Empty,
}

impl ChangeSet {
    /// All changed paths. `files` entries keep event order; `changed` keys
    /// come back sorted.
    #[must_use]
    pub fn paths(&self) -> &[String] {
        match self {
            Self::Changed(paths) | Self::Files(paths) => paths,
            Self::Empty => &[],
        }
    }

    /// Returns true if any changed path starts with `prefix`.
    #[must_use]
    pub fn touches(&self, prefix: &str) -> bool {
        self.paths().iter().any(|p| p.starts_with(prefix))
    }
}

/// Commit details carried by an event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Commit {
    /// Paths touched by the commit.
    pub changes: ChangeSet,
    /// The `ref` field, used for `$branch`.
    pub branch: Option<String>,
    /// The commit hash, used for `$hash`.
    pub hash: Option<String>,
}

/// One decoded pubsub event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    /// The event's `pubsub_topics`.
    pub topics: BTreeSet<String>,
    /// Set for `stillalive` keepalive pings.
    pub heartbeat: bool,
    /// Commit details, absent for non-commit events.
    pub commit: Option<Commit>,
}

#[derive(Deserialize)]
struct RawPayload {
    #[serde(default)]
    pubsub_topics: Vec<String>,
    #[serde(default)]
    commit: Option<RawCommit>,
}

#[derive(Deserialize)]
struct RawCommit {
    #[serde(default)]
    changed: Option<Map<String, Value>>,
    #[serde(default)]
    files: Option<Vec<String>>,
    #[serde(default, rename = "ref")]
    branch: Option<String>,
    #[serde(default)]
    hash: Option<String>,
}

impl From<RawCommit> for Commit {
    fn from(raw: RawCommit) -> Self {
        let changes = match (raw.changed, raw.files) {
            (Some(changed), _) => ChangeSet::Changed(changed.into_iter().map(|(k, _)| k).collect()),
            (None, Some(files)) => ChangeSet::Files(files),
            (None, None) => ChangeSet::Empty,
        };
        Self {
            changes,
            branch: raw.branch,
            hash: raw.hash,
        }
    }
}

impl Payload {
    /// Decode a payload from an already parsed JSON document.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Decode` when a recognized field has the wrong type.
    pub fn from_value(value: Value) -> Result<Self, SourceError> {
        let heartbeat = value
            .as_object()
            .is_some_and(|obj| obj.contains_key("stillalive"));
        if heartbeat {
            // Keepalives carry nothing else worth decoding.
            return Ok(Self {
                heartbeat,
                ..Self::default()
            });
        }

        let raw: RawPayload = serde_json::from_value(value).map_err(|e| SourceError::Decode {
            message: e.to_string(),
        })?;

        Ok(Self {
            topics: raw.pubsub_topics.into_iter().collect(),
            heartbeat: false,
            commit: raw.commit.map(Commit::from),
        })
    }

    /// Decode a payload from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Decode` on malformed JSON or mistyped fields.
    pub fn from_json(s: &str) -> Result<Self, SourceError> {
        let value: Value = serde_json::from_str(s).map_err(|e| SourceError::Decode {
            message: e.to_string(),
        })?;
        Self::from_value(value)
    }

    /// Decode a payload from raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Decode` on malformed JSON, invalid UTF-8 or
    /// mistyped fields.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SourceError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| SourceError::Decode {
            message: e.to_string(),
        })?;
        Self::from_value(value)
    }

    /// Returns true if every topic is present on this event.
    pub fn has_topics<'a, I>(&self, topics: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        topics.into_iter().all(|t| self.topics.contains(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed_paths(p: &Payload) -> &[String] {
        p.commit.as_ref().map_or(&[], |c| c.changes.paths())
    }

    #[test]
    fn svn_payload_uses_changed_keys() {
        let p = Payload::from_json(
            r#"{"pubsub_topics":["svn","commit"],
                "commit":{"changed":{"trunk/foo.txt":{"flags":"U  "},"trunk/bar/":{}}}}"#,
        )
        .unwrap();
        assert!(!p.heartbeat);
        assert!(p.topics.contains("svn"));
        assert_eq!(changed_paths(&p), ["trunk/bar/", "trunk/foo.txt"]);
        assert!(matches!(p.commit.unwrap().changes, ChangeSet::Changed(_)));
    }

    #[test]
    fn git_payload_uses_files_list() {
        let p = Payload::from_json(
            r#"{"pubsub_topics":["git","commit"],
                "commit":{"ref":"refs/heads/main","hash":"abc123","files":["content/index.md"]}}"#,
        )
        .unwrap();
        let commit = p.commit.clone().unwrap();
        assert_eq!(commit.branch.as_deref(), Some("refs/heads/main"));
        assert_eq!(commit.hash.as_deref(), Some("abc123"));
        assert_eq!(changed_paths(&p), ["content/index.md".to_string()]);
        assert!(commit.changes.touches("content/"));
        assert!(!commit.changes.touches("site/"));
    }

    #[test]
    fn stillalive_is_a_heartbeat() {
        let p = Payload::from_json(r#"{"stillalive": 1700000000.0}"#).unwrap();
        assert!(p.heartbeat);
        assert!(p.topics.is_empty());
        assert!(p.commit.is_none());
    }

    #[test]
    fn missing_fields_decode_to_empty() {
        let p = Payload::from_json(r#"{"pubsub_topics":["svn"]}"#).unwrap();
        assert!(changed_paths(&p).is_empty());

        let p = Payload::from_json(r#"{"commit":{}}"#).unwrap();
        assert!(p.topics.is_empty());
        assert_eq!(p.commit.unwrap().changes, ChangeSet::Empty);
    }

    #[test]
    fn mistyped_topics_are_rejected() {
        let err = Payload::from_json(r#"{"pubsub_topics":"svn"}"#).unwrap_err();
        assert!(matches!(err, SourceError::Decode { .. }));
    }
}
