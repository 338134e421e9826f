//! Debounced presence updates.
//!
//! Branch starts and completions arrive in bursts; the manager coalesces
//! them so the presence sink sees at most one update per debounce window,
//! always reflecting the latest activity counts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::traits::{Activity, PresenceSink};

const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);

struct State {
    active: HashSet<(String, u64)>,
    last_update: Option<Instant>,
    pending: Option<JoinHandle<()>>,
}

/// Tracks running branches across agents and pushes debounced activity
/// updates to the presence sink.
pub struct BotPresenceManager {
    sink: Arc<dyn PresenceSink>,
    debounce: Duration,
    state: Mutex<State>,
}

impl BotPresenceManager {
    pub fn new(sink: Arc<dyn PresenceSink>) -> Self {
        Self {
            sink,
            debounce: DEFAULT_DEBOUNCE,
            state: Mutex::new(State {
                active: HashSet::new(),
                last_update: None,
                pending: None,
            }),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// A branch started running for an agent.
    pub async fn thread_started(self: &Arc<Self>, agent_name: &str, branch_id: u64) {
        {
            let mut state = self.state.lock().await;
            state.active.insert((agent_name.to_owned(), branch_id));
        }
        self.schedule_update().await;
    }

    /// A branch completed for an agent.
    pub async fn thread_completed(self: &Arc<Self>, agent_name: &str, branch_id: u64) {
        {
            let mut state = self.state.lock().await;
            state.active.remove(&(agent_name.to_owned(), branch_id));
        }
        self.schedule_update().await;
    }

    /// Current activity snapshot.
    pub async fn activity(&self) -> Activity {
        let state = self.state.lock().await;
        activity_of(&state.active)
    }

    async fn schedule_update(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        let due_now = state
            .last_update
            .is_none_or(|last| last.elapsed() >= self.debounce);

        if due_now {
            if let Some(pending) = state.pending.take() {
                pending.abort();
            }
            let activity = activity_of(&state.active);
            state.last_update = Some(Instant::now());
            drop(state);
            self.sink.update(activity).await;
            return;
        }

        if state.pending.is_none() {
            let remaining = self
                .debounce
                .saturating_sub(state.last_update.map_or(Duration::ZERO, |l| l.elapsed()));
            let manager = Arc::clone(self);
            state.pending = Some(tokio::spawn(async move {
                tokio::time::sleep(remaining).await;
                let activity = {
                    let mut state = manager.state.lock().await;
                    state.pending = None;
                    state.last_update = Some(Instant::now());
                    activity_of(&state.active)
                };
                manager.sink.update(activity).await;
            }));
        }
    }
}

fn activity_of(active: &HashSet<(String, u64)>) -> Activity {
    let num_agents = active
        .iter()
        .map(|(agent, _)| agent.as_str())
        .collect::<HashSet<_>>()
        .len();
    Activity {
        num_tasks: active.len(),
        num_agents,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        updates: StdMutex<Vec<Activity>>,
    }

    #[async_trait]
    impl PresenceSink for RecordingSink {
        async fn update(&self, activity: Activity) {
            self.updates.lock().unwrap().push(activity);
        }
    }

    fn manager(debounce: Duration) -> (Arc<BotPresenceManager>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink {
            updates: StdMutex::new(Vec::new()),
        });
        let manager = Arc::new(
            BotPresenceManager::new(Arc::clone(&sink) as Arc<dyn PresenceSink>)
                .with_debounce(debounce),
        );
        (manager, sink)
    }

    #[tokio::test]
    async fn counts_tasks_and_distinct_agents() {
        let (m, _sink) = manager(Duration::from_millis(10));
        m.thread_started("athena", 1).await;
        m.thread_started("athena", 2).await;
        m.thread_started("hermes", 1).await;
        let activity = m.activity().await;
        assert_eq!(activity.num_tasks, 3);
        assert_eq!(activity.num_agents, 2);

        m.thread_completed("athena", 1).await;
        m.thread_completed("athena", 2).await;
        let activity = m.activity().await;
        assert_eq!(activity.num_tasks, 1);
        assert_eq!(activity.num_agents, 1);
    }

    #[tokio::test]
    async fn bursts_are_debounced_to_a_trailing_update() {
        let (m, sink) = manager(Duration::from_millis(60));
        m.thread_started("athena", 1).await;
        // First event flushes immediately.
        assert_eq!(sink.updates.lock().unwrap().len(), 1);

        for id in 2..6 {
            m.thread_started("athena", id).await;
        }
        // Burst coalesced into one pending update.
        assert_eq!(sink.updates.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let updates = sink.updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        // The trailing update reflects the latest counts.
        assert_eq!(updates[1].num_tasks, 5);
    }
}
