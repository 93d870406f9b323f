//! # OCC - On-Commit Commands
//!
//! OCC listens to a pubsub stream of commit notifications and runs local
//! commands when a commit matches one of its configured subscriptions.
//!
//! ## Core Concepts
//!
//! - **Subscription**: topics to match, an optional directory filter, the command
//!   to run, the user to run it as and who to blame when it fails
//! - **Payload**: one decoded pubsub event
//! - **Dispatcher**: matches payloads against subscriptions in declared order and
//!   runs what fires, honoring `skiprest`
//! - **Executor**: runs a command as another local user with a bounded runtime
//! - **Notifier**: mails a failure report to a subscription's blamelist
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use occ::{Config, Dispatcher, MailNotifier, Payload, Sendmail, SystemExecutor};
//!
//! let config = Arc::new(Config::load("occ.yaml")?);
//! let notifier = MailNotifier::new(Sendmail::from_config(&config.mail));
//! let dispatcher = Dispatcher::new(Arc::clone(&config), SystemExecutor::new(), notifier);
//!
//! let payload = Payload::from_json(r#"{"pubsub_topics":["svn","commit"],"commit":{"changed":{"trunk/a":{}}}}"#)?;
//! let report = dispatcher.handle(&payload);
//! println!("{} subscription(s) fired", report.rules.len());
//! # Ok::<(), occ::OccError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod matcher;
pub mod notifier;
pub mod payload;
pub mod source;

// Re-export primary types at crate root for convenience
pub use command::OnCommit;
pub use config::{Config, MailConfig, PubSubConfig, Subscription};
pub use dispatcher::{DispatchReport, Dispatcher, RuleOutcome, RuleReport};
pub use error::{CommandError, ConfigError, NotifyError, OccError, OccResult, SourceError};
pub use executor::{CommandOutput, CommandRequest, Executor, RunAs, SystemExecutor};
pub use matcher::MatchOutput;
pub use notifier::{FailureReport, MailNotifier, MailTransport, Notifier, Sendmail};
pub use payload::{ChangeSet, Commit, Payload};
pub use source::{EventSource, LineSource, PubSubListener};
