//! Per-scope wake-up channels for long-polling runners.
//!
//! The durable `tasks_version` counters live in the store; these channels
//! only tell parked `FetchTask` calls that the counter for their scope
//! moved, so a bump for one repository never wakes runners scoped to
//! another.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::models::Scope;

#[derive(Clone, Default)]
pub struct VersionNotifier {
    channels: Arc<DashMap<Scope, watch::Sender<u64>>>,
}

impl VersionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe before reading the durable version, so a bump that lands
    /// in between is not missed.
    pub fn subscribe(&self, scope: Scope) -> watch::Receiver<u64> {
        self.channels
            .entry(scope)
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    pub fn notify(&self, scope: Scope) {
        if let Some(tx) = self.channels.get(&scope) {
            tx.send_modify(|v| *v = v.wrapping_add(1));
        }
    }

    pub fn notify_all<'a>(&self, scopes: impl IntoIterator<Item = &'a Scope>) {
        for scope in scopes {
            self.notify(*scope);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_notify_wakes_only_matching_scope() {
        let notifier = VersionNotifier::new();
        let mut repo_a = notifier.subscribe(Scope::repo(1));
        let mut repo_b = notifier.subscribe(Scope::repo(2));

        notifier.notify(Scope::repo(1));

        tokio::time::timeout(Duration::from_millis(100), repo_a.changed())
            .await
            .expect("repo A should wake")
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), repo_b.changed())
                .await
                .is_err()
        );
    }

    #[test]
    fn test_notify_without_subscribers_is_a_no_op() {
        let notifier = VersionNotifier::new();
        notifier.notify(Scope::global());
        assert!(notifier.channels.is_empty());
    }
}
