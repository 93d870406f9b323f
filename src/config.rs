//! `occ.yaml` configuration.
//!
//! Configuration is loaded once at startup and is read-only afterwards.
//! Subscriptions keep the order in which they are declared, since that order
//! decides dispatch order and `skiprest` short-circuiting.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::command::OnCommit;
use crate::error::ConfigError;

/// Default subject line for failure reports.
pub const DEFAULT_BLAME_SUBJECT: &str = "OCC execution failure";

/// Default sendmail binary used by the mail notifier.
pub const DEFAULT_SENDMAIL: &str = "/usr/sbin/sendmail";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Event stream connection.
    pub pubsub: PubSubConfig,
    /// Failure mail settings.
    #[serde(default)]
    pub mail: MailConfig,
    /// Subscriptions in declared order.
    #[serde(default, deserialize_with = "ordered_subscriptions")]
    pub subscriptions: Vec<Subscription>,
}

/// Connection settings for the pubsub event stream.
#[allow(missing_docs)]
#[derive(Clone, Deserialize)]
pub struct PubSubConfig {
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
}

impl fmt::Debug for PubSubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Mail transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// `From` address; defaults to `occ@<hostname>`.
    #[serde(default)]
    pub sender: Option<String>,
    /// Path of the sendmail binary.
    #[serde(default = "default_sendmail")]
    pub sendmail: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            sender: None,
            sendmail: default_sendmail(),
        }
    }
}

fn default_sendmail() -> String {
    DEFAULT_SENDMAIL.to_string()
}

/// One subscription rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// The subscription's key in `occ.yaml`.
    pub id: String,
    /// Topics that must all be present on an event.
    pub topics: Vec<String>,
    /// Only fire when a changed path starts with this prefix.
    pub changedir: Option<String>,
    /// Command to run; `None` fires without running anything.
    pub oncommit: Option<OnCommit>,
    /// User to run as; `None` means the user this process runs as.
    pub runas: Option<String>,
    /// Failure report recipient; `None` suppresses mail.
    pub blamelist: Option<String>,
    /// Subject line of failure reports.
    pub blamesubject: String,
    /// Stop processing later subscriptions once this one has run.
    pub skiprest: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTopics {
    Path(String),
    List(Vec<String>),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSubscription {
    topics: Option<RawTopics>,
    #[serde(default)]
    changedir: Option<String>,
    #[serde(default)]
    oncommit: Option<OnCommit>,
    #[serde(default)]
    runas: Option<String>,
    #[serde(default)]
    blamelist: Option<String>,
    #[serde(default)]
    blamesubject: Option<String>,
    #[serde(default)]
    skiprest: bool,
}

impl Subscription {
    fn from_raw(id: String, raw: RawSubscription) -> Result<Self, ConfigError> {
        let topics = match raw.topics {
            None => {
                return Err(ConfigError::InvalidSubscription {
                    subscription: id,
                    reason: "missing 'topics'".to_string(),
                })
            }
            Some(RawTopics::Path(path)) => path.split('/').map(str::to_string).collect(),
            Some(RawTopics::List(list)) => list,
        };
        if topics.is_empty() {
            return Err(ConfigError::InvalidSubscription {
                subscription: id,
                reason: "'topics' must name at least one topic".to_string(),
            });
        }

        Ok(Self {
            id,
            topics,
            changedir: raw.changedir.filter(|d| !d.is_empty()),
            oncommit: raw.oncommit,
            runas: raw.runas.filter(|u| !u.is_empty()),
            blamelist: raw.blamelist.filter(|b| !b.trim().is_empty()),
            blamesubject: raw
                .blamesubject
                .unwrap_or_else(|| DEFAULT_BLAME_SUBJECT.to_string()),
            skiprest: raw.skiprest,
        })
    }

    /// Convenience constructor used by tests and embedders.
    #[must_use]
    pub fn new(id: impl Into<String>, topics: &str, oncommit: OnCommit) -> Self {
        Self {
            id: id.into(),
            topics: topics.split('/').map(str::to_string).collect(),
            changedir: None,
            oncommit: Some(oncommit),
            runas: None,
            blamelist: None,
            blamesubject: DEFAULT_BLAME_SUBJECT.to_string(),
            skiprest: false,
        }
    }

    /// Restrict to commits touching `dir`.
    #[must_use]
    pub fn with_changedir(mut self, dir: impl Into<String>) -> Self {
        self.changedir = Some(dir.into());
        self
    }

    /// Run the command as `user`.
    #[must_use]
    pub fn with_runas(mut self, user: impl Into<String>) -> Self {
        self.runas = Some(user.into());
        self
    }

    /// Mail failures to `recipient`.
    #[must_use]
    pub fn with_blamelist(mut self, recipient: impl Into<String>) -> Self {
        self.blamelist = Some(recipient.into());
        self
    }

    /// Stop later subscriptions once this one has run.
    #[must_use]
    pub fn with_skiprest(mut self, skiprest: bool) -> Self {
        self.skiprest = skiprest;
        self
    }
}

fn ordered_subscriptions<'de, D>(deserializer: D) -> Result<Vec<Subscription>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedVisitor;

    impl<'de> Visitor<'de> for OrderedVisitor {
        type Value = Vec<Subscription>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping of subscription names to subscriptions")
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut seen = HashSet::new();
            let mut out = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((id, raw)) = map.next_entry::<String, RawSubscription>()? {
                if !seen.insert(id.clone()) {
                    return Err(<A::Error as de::Error>::custom(ConfigError::DuplicateSubscription {
                        subscription: id,
                    }));
                }
                out.push(Subscription::from_raw(id, raw).map_err(<A::Error as de::Error>::custom)?);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_any(OrderedVisitor)
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read, or a parse error
    /// if it is not a valid configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed YAML, missing required fields
    /// or invalid subscriptions.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Build a configuration directly from subscriptions.
    #[must_use]
    pub fn with_subscriptions(url: impl Into<String>, subscriptions: Vec<Subscription>) -> Self {
        Self {
            pubsub: PubSubConfig {
                url: url.into(),
                user: None,
                pass: None,
            },
            mail: MailConfig::default(),
            subscriptions,
        }
    }
}
