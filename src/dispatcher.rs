//! Dispatch of firing subscriptions.
//!
//! For every event the dispatcher walks the configured subscriptions in
//! declared order, runs the command of each one that fires, mails the
//! blamelist on failure and stops early after a `skiprest` subscription.
//! A failing subscription never prevents later ones from running.

use std::sync::Arc;

use crate::config::{Config, Subscription};
use crate::error::CommandError;
use crate::executor::{CommandRequest, Executor, RunAs};
use crate::matcher;
use crate::notifier::{FailureReport, Notifier};
use crate::payload::Payload;

/// What happened to one firing subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    /// The command ran and exited 0.
    Succeeded,
    /// The command failed; `notified` is true if the blamelist was mailed.
    #[allow(missing_docs)]
    Failed { error: CommandError, notified: bool },
    /// The subscription resolved to an empty command.
    Skipped,
}

/// Per-subscription record of a dispatch.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleReport {
    pub subscription: String,
    pub args: Vec<String>,
    pub outcome: RuleOutcome,
}

/// Summary of one event's dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DispatchReport {
    /// Firing subscriptions in dispatch order.
    pub rules: Vec<RuleReport>,
    /// Id of the subscription whose `skiprest` ended processing, if any.
    pub stopped_by: Option<String>,
}

impl DispatchReport {
    /// Ids of subscriptions that fired, in dispatch order.
    #[must_use]
    pub fn fired(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.subscription.as_str()).collect()
    }

    /// Number of failed commands.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.rules
            .iter()
            .filter(|r| matches!(r.outcome, RuleOutcome::Failed { .. }))
            .count()
    }
}

/// Runs the commands of subscriptions that fire for an event.
pub struct Dispatcher<E, N> {
    config: Arc<Config>,
    executor: E,
    notifier: N,
}

impl<E: Executor, N: Notifier> Dispatcher<E, N> {
    /// Dispatcher over `config`'s subscriptions.
    #[must_use]
    pub fn new(config: Arc<Config>, executor: E, notifier: N) -> Self {
        Self {
            config,
            executor,
            notifier,
        }
    }

    /// The executor commands run through.
    #[must_use]
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// The notifier failures are reported to.
    #[must_use]
    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Match `payload` against the configuration and dispatch what fires.
    pub fn handle(&self, payload: &Payload) -> DispatchReport {
        if payload.heartbeat {
            tracing::trace!("keepalive received");
            return DispatchReport::default();
        }
        self.dispatch(matcher::matching(&self.config.subscriptions, payload), payload)
    }

    /// Dispatch an ordered sequence of firing subscriptions for `payload`.
    ///
    /// The sequence is consumed lazily, so a `skiprest` stops evaluation of
    /// anything after it.
    pub fn dispatch<'a, I>(&self, rules: I, payload: &Payload) -> DispatchReport
    where
        I: IntoIterator<Item = &'a Subscription>,
    {
        let mut report = DispatchReport::default();

        for sub in rules {
            let rule = self.run_rule(sub, payload);
            report.rules.push(rule);

            if sub.skiprest {
                tracing::info!(subscription = %sub.id, "skiprest set, not processing remaining subscriptions");
                report.stopped_by = Some(sub.id.clone());
                break;
            }
        }

        report
    }

    fn run_rule(&self, sub: &Subscription, payload: &Payload) -> RuleReport {
        let args = sub
            .oncommit
            .as_ref()
            .map(|c| c.resolve(payload.commit.as_ref()))
            .unwrap_or_default();

        if args.is_empty() {
            tracing::debug!(subscription = %sub.id, "matching subscription has no command");
            return RuleReport {
                subscription: sub.id.clone(),
                args,
                outcome: RuleOutcome::Skipped,
            };
        }

        tracing::info!(
            subscription = %sub.id,
            command = %args.join(" "),
            "found a matching payload, executing command"
        );

        let request = CommandRequest::new(args, RunAs::from_config(sub.runas.as_deref()));
        let outcome = match self.executor.run(&request) {
            Ok(_) => {
                tracing::info!(subscription = %sub.id, "command executed successfully");
                RuleOutcome::Succeeded
            }
            Err(error) => {
                tracing::error!(
                    subscription = %sub.id,
                    kind = error.kind(),
                    code = error.code(),
                    error = %error,
                    "on-commit command failed"
                );
                let notified = match sub.blamelist.as_deref() {
                    Some(recipient) => {
                        self.notifier
                            .notify(&FailureReport::for_error(recipient, &sub.blamesubject, &error));
                        true
                    }
                    None => false,
                };
                RuleOutcome::Failed { error, notified }
            }
        };

        RuleReport {
            subscription: sub.id.clone(),
            args: request.args,
            outcome,
        }
    }
}
