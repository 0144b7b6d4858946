//! TTL-bounded chat session cache.
//!
//! Session id → remembered turns, last-access time, sticky scope, and a
//! turn counter. Every chat call sweeps sessions idle past the TTL
//! (lazy sweep; `sweep` is also callable from a scheduler). The lock is
//! held only for map operations, never across a network call: a turn
//! snapshots the session out, the generation call runs unlocked, and the
//! result is written back — so eviction mid-call just means the write-back
//! recreates the session.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::generation::ChatTurn;

struct SessionEntry {
    history: Vec<ChatTurn>,
    last_accessed: Instant,
    sticky_scope: Option<String>,
    turns: u32,
}

/// Snapshot handed to the caller for the duration of one turn.
pub struct TurnSnapshot {
    pub history: Vec<ChatTurn>,
    /// Scope to apply this turn: the caller's, or the session's sticky
    /// scope when the caller omitted one.
    pub scope: Option<String>,
    /// Whether an existing live session is being continued.
    pub resumed: bool,
}

pub struct SessionCache {
    ttl: Duration,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Evict sessions idle longer than the TTL.
    pub fn sweep(&self) {
        let mut sessions = self.sessions.lock().expect("session cache poisoned");
        let ttl = self.ttl;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.last_accessed.elapsed() <= ttl);
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle chat sessions");
        }
    }

    /// Start a turn: sweep, then create or resume the session and return
    /// a snapshot of its state. `reset` discards any existing session
    /// (including its sticky scope). A scope passed by the caller becomes
    /// the session's sticky scope; an omitted one is recovered from the
    /// session if it has one.
    pub fn begin_turn(
        &self,
        session_id: &str,
        reset: bool,
        scope: Option<String>,
    ) -> TurnSnapshot {
        self.sweep();

        let mut sessions = self.sessions.lock().expect("session cache poisoned");

        if reset {
            sessions.remove(session_id);
        }

        match sessions.get_mut(session_id) {
            Some(entry) => {
                entry.last_accessed = Instant::now();
                if let Some(scope) = scope.clone() {
                    entry.sticky_scope = Some(scope);
                }
                TurnSnapshot {
                    history: entry.history.clone(),
                    scope: scope.or_else(|| entry.sticky_scope.clone()),
                    resumed: true,
                }
            }
            None => {
                sessions.insert(
                    session_id.to_string(),
                    SessionEntry {
                        history: Vec::new(),
                        last_accessed: Instant::now(),
                        sticky_scope: scope.clone(),
                        turns: 0,
                    },
                );
                TurnSnapshot {
                    history: Vec::new(),
                    scope,
                    resumed: false,
                }
            }
        }
    }

    /// Finish a turn: append the exchange, bump the counter, touch the
    /// access time. Returns the new turn count. If the session was
    /// evicted while the generation call was in flight, it is recreated.
    pub fn complete_turn(
        &self,
        session_id: &str,
        scope: Option<String>,
        user_text: &str,
        model_text: &str,
    ) -> u32 {
        let mut sessions = self.sessions.lock().expect("session cache poisoned");
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                history: Vec::new(),
                last_accessed: Instant::now(),
                sticky_scope: None,
                turns: 0,
            });

        entry.history.push(ChatTurn::user(user_text));
        entry.history.push(ChatTurn::model(model_text));
        entry.last_accessed = Instant::now();
        if scope.is_some() {
            entry.sticky_scope = scope;
        }
        entry.turns += 1;
        entry.turns
    }

    /// Drop a session entirely (explicit reset with no follow-up prompt).
    pub fn remove(&self, session_id: &str) {
        self.sessions
            .lock()
            .expect("session cache poisoned")
            .remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_turn_creates_session() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let snapshot = cache.begin_turn("s1", false, Some("P-11".into()));
        assert!(!snapshot.resumed);
        assert!(snapshot.history.is_empty());
        assert_eq!(snapshot.scope.as_deref(), Some("P-11"));

        let turns = cache.complete_turn("s1", snapshot.scope, "q1", "a1");
        assert_eq!(turns, 1);
    }

    #[test]
    fn test_sticky_scope_recovered_when_omitted() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let first = cache.begin_turn("s1", false, Some("P-11".into()));
        cache.complete_turn("s1", first.scope, "q1", "a1");

        let second = cache.begin_turn("s1", false, None);
        assert!(second.resumed);
        assert_eq!(second.scope.as_deref(), Some("P-11"));
        assert_eq!(second.history.len(), 2);
    }

    #[test]
    fn test_reset_clears_history_and_scope() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let first = cache.begin_turn("s1", false, Some("P-11".into()));
        cache.complete_turn("s1", first.scope, "q1", "a1");

        let reset = cache.begin_turn("s1", true, None);
        assert!(!reset.resumed);
        assert!(reset.history.is_empty());
        assert!(reset.scope.is_none());
    }

    #[test]
    fn test_ttl_eviction_starts_fresh_session() {
        let cache = SessionCache::new(Duration::from_millis(40));
        let first = cache.begin_turn("s1", false, Some("P-11".into()));
        cache.complete_turn("s1", first.scope, "q1", "a1");

        std::thread::sleep(Duration::from_millis(80));
        let revisit = cache.begin_turn("s1", false, None);
        assert!(!revisit.resumed);
        assert!(revisit.history.is_empty());
        assert!(revisit.scope.is_none());

        let turns = cache.complete_turn("s1", None, "q2", "a2");
        assert_eq!(turns, 1);
    }

    #[test]
    fn test_activity_within_ttl_preserves_session() {
        let cache = SessionCache::new(Duration::from_millis(200));
        let first = cache.begin_turn("s1", false, None);
        cache.complete_turn("s1", first.scope, "q1", "a1");

        std::thread::sleep(Duration::from_millis(30));
        let second = cache.begin_turn("s1", false, None);
        assert!(second.resumed);
        let turns = cache.complete_turn("s1", second.scope, "q2", "a2");
        assert_eq!(turns, 2);
    }

    #[test]
    fn test_sweep_only_evicts_idle() {
        let cache = SessionCache::new(Duration::from_millis(60));
        cache.begin_turn("old", false, None);
        std::thread::sleep(Duration::from_millis(90));
        cache.begin_turn("fresh", false, None);
        cache.sweep();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_completion_after_eviction_recreates() {
        // Simulates eviction racing an in-flight generation call
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.begin_turn("s1", false, None);
        cache.remove("s1");
        let turns = cache.complete_turn("s1", None, "q", "a");
        assert_eq!(turns, 1);
    }
}
