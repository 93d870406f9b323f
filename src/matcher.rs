//! Subscription matching.
//!
//! The matcher evaluates subscriptions against a decoded [`Payload`].
//! Matching is lazy and in declaration order so the dispatcher can run each
//! firing subscription before the next one is even looked at.

use crate::config::Subscription;
use crate::payload::Payload;

/// Why a subscription did or did not fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutput {
    /// The event is a keepalive; nothing is evaluated.
    Heartbeat,
    /// At least one required topic is absent.
    MissingTopic,
    /// Topics matched but no changed path lies under `changedir`.
    OutsideChangedir,
    /// The subscription fires.
    Match,
}

impl MatchOutput {
    /// Returns true if the subscription fires.
    #[must_use]
    pub const fn is_match(self) -> bool {
        matches!(self, Self::Match)
    }
}

/// Evaluate one subscription against one payload.
#[must_use]
pub fn evaluate(subscription: &Subscription, payload: &Payload) -> MatchOutput {
    if payload.heartbeat {
        return MatchOutput::Heartbeat;
    }

    if !payload.has_topics(&subscription.topics) {
        return MatchOutput::MissingTopic;
    }

    if let Some(dir) = subscription.changedir.as_deref() {
        // An event without change information never satisfies a directory filter.
        let touched = payload
            .commit
            .as_ref()
            .is_some_and(|c| c.changes.touches(dir));
        if !touched {
            return MatchOutput::OutsideChangedir;
        }
    }

    MatchOutput::Match
}

/// Returns true if `subscription` fires for `payload`.
#[must_use]
pub fn matches(subscription: &Subscription, payload: &Payload) -> bool {
    evaluate(subscription, payload).is_match()
}

/// Lazily yield the subscriptions that fire for `payload`, in declared order.
///
/// Heartbeat payloads yield nothing without evaluating any subscription.
pub fn matching<'a, I>(subscriptions: I, payload: &'a Payload) -> impl Iterator<Item = &'a Subscription> + 'a
where
    I: IntoIterator<Item = &'a Subscription>,
    I::IntoIter: 'a,
{
    let live = !payload.heartbeat;
    subscriptions
        .into_iter()
        .take_while(move |_| live)
        .filter(move |s| matches(s, payload))
}
