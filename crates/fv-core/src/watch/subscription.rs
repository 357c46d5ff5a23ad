//! Subscriptions: one-shot, never-retroactive pattern matches.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regex::{Captures, Regex};
use tokio::sync::watch;

/// The line that satisfied a subscription, with its capture groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMatch {
    /// The full line, without its trailing newline.
    pub line: String,
    /// 1-based position of the line within the watched run.
    pub line_number: u64,
    /// Positional groups; index 0 is the whole match.
    pub groups: Vec<Option<String>>,
    /// Named groups that participated in the match.
    pub named: BTreeMap<String, String>,
}

impl LineMatch {
    pub(crate) fn from_captures(
        pattern: &Regex,
        caps: &Captures<'_>,
        line: &str,
        line_number: u64,
    ) -> Self {
        let groups = caps
            .iter()
            .map(|g| g.map(|m| m.as_str().to_string()))
            .collect();
        let named = pattern
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect();
        Self {
            line: line.to_string(),
            line_number,
            groups,
            named,
        }
    }

    /// Positional capture group `i`, if it participated.
    pub fn group(&self, i: usize) -> Option<&str> {
        self.groups.get(i).and_then(|g| g.as_deref())
    }

    /// Named capture group, if it participated.
    pub fn name(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }
}

/// Resolution state of a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No line has matched yet.
    Pending,
    /// A line matched. Terminal.
    Matched(Arc<LineMatch>),
    /// The watcher was discarded before a match. Terminal.
    Abandoned,
}

impl SubscriptionState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Why [`Subscription::wait`] returned without a match.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("pattern {pattern:?} not seen within {timeout:?}")]
    Timeout { pattern: String, timeout: Duration },

    #[error("watcher for pattern {pattern:?} was discarded before a match")]
    Abandoned { pattern: String },
}

/// A registered pattern match against one watcher's future output.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    pattern: Arc<str>,
    rx: watch::Receiver<SubscriptionState>,
}

impl Subscription {
    pub(crate) fn new(id: u64, pattern: &Regex, rx: watch::Receiver<SubscriptionState>) -> Self {
        Self {
            id,
            pattern: Arc::from(pattern.as_str()),
            rx,
        }
    }

    /// Identifier, unique within the owning watcher.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The pattern source text.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> SubscriptionState {
        self.rx.borrow().clone()
    }

    pub fn is_matched(&self) -> bool {
        matches!(*self.rx.borrow(), SubscriptionState::Matched(_))
    }

    pub fn is_pending(&self) -> bool {
        self.rx.borrow().is_pending()
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(*self.rx.borrow(), SubscriptionState::Abandoned)
    }

    /// The matching line, once matched.
    pub fn matched(&self) -> Option<Arc<LineMatch>> {
        match &*self.rx.borrow() {
            SubscriptionState::Matched(m) => Some(Arc::clone(m)),
            _ => None,
        }
    }

    /// Block until matched, abandoned, or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> Result<Arc<LineMatch>, WaitError> {
        let mut rx = self.rx.clone();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(|s| !s.is_pending())
                .await
                .map(|state| (*state).clone())
        })
        .await;

        match waited {
            Err(_elapsed) => Err(WaitError::Timeout {
                pattern: self.pattern.to_string(),
                timeout,
            }),
            Ok(Ok(SubscriptionState::Matched(m))) => Ok(m),
            // Either explicitly abandoned or the sender side went away.
            Ok(_) => Err(WaitError::Abandoned {
                pattern: self.pattern.to_string(),
            }),
        }
    }
}
