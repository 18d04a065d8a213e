//! Shared-Knowledge Store: a small consensus-aware fact store workers use
//! to publish, vote on, and learn from each other's experience.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::WorkerId;

/// A single fact shared by a worker, with lightweight peer-review via votes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub key: String,
    pub value: Value,
    pub author_worker_id: WorkerId,
    pub created_at: DateTime<Utc>,
    pub ttl: Option<Duration>,
    pub confidence: f64,
    pub votes: HashSet<WorkerId>,
}

impl KnowledgeEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => now - self.created_at > chrono::Duration::from_std(ttl).unwrap_or_default(),
            None => false,
        }
    }
}

/// One worker's ballot in a [`ConsensusSession`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub value: bool,
    pub confidence: f64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ConsensusStatus {
    pub fn is_terminal(self) -> bool {
        self != ConsensusStatus::Pending
    }
}

/// A proposal open for worker votes, finalized on threshold or deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSession {
    pub id: Uuid,
    pub topic: String,
    pub proposal: Value,
    pub requester_worker_id: WorkerId,
    pub deadline: DateTime<Utc>,
    pub votes: HashMap<WorkerId, Vote>,
    pub status: ConsensusStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    ProblemSolution,
    ErrorPattern,
}

/// A recurring problem/solution or error, aggregated across workers as they
/// report matching experiences via `learn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub kind: PatternKind,
    pub signature: String,
    pub occurrences: u64,
    pub contributors: HashSet<WorkerId>,
    pub last_seen_at: DateTime<Utc>,
    pub representative_solution: Option<Value>,
}

/// What a worker reports to `learn`: the problem it faced, whether it
/// succeeded, and (if so) the solution it applied.
#[derive(Debug, Clone)]
pub struct Experience {
    pub problem: String,
    pub success: bool,
    pub solution: Option<Value>,
    pub error: Option<String>,
}

struct Inner {
    entries: HashMap<String, KnowledgeEntry>,
    sessions: HashMap<Uuid, ConsensusSession>,
    patterns: HashMap<String, LearnedPattern>,
    active_workers: HashSet<WorkerId>,
}

/// Shared fact store plus lightweight consensus voting and cross-worker
/// pattern learning. Owns a single lock over all three maps, per the
/// shared-resource policy: they are read/written together often enough
/// (confidence recompute touches every entry) that splitting them would
/// only add lock-ordering risk without reducing contention in practice.
pub struct KnowledgeStore {
    inner: std::sync::RwLock<Inner>,
    max_knowledge: usize,
    consensus_threshold: f64,
    clock: Arc<dyn Clock>,
}

impl KnowledgeStore {
    pub fn new(max_knowledge: usize, consensus_threshold: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: std::sync::RwLock::new(Inner {
                entries: HashMap::new(),
                sessions: HashMap::new(),
                patterns: HashMap::new(),
                active_workers: HashSet::new(),
            }),
            max_knowledge,
            consensus_threshold,
            clock,
        }
    }

    fn active_worker_count(inner: &Inner) -> usize {
        inner.active_workers.len().max(1)
    }

    fn recompute_confidence(entry: &mut KnowledgeEntry, active_workers: usize) {
        entry.confidence = entry.votes.len() as f64 / active_workers.max(1) as f64;
    }

    /// Register a worker as active, then recompute every entry's
    /// confidence against the new denominator.
    pub fn register_worker(&self, worker_id: WorkerId) {
        let mut inner = self.inner.write().unwrap();
        inner.active_workers.insert(worker_id);
        let count = Self::active_worker_count(&inner);
        for entry in inner.entries.values_mut() {
            Self::recompute_confidence(entry, count);
        }
    }

    /// Unregister a worker: strip its vote from every entry and every open
    /// session, then recompute confidences.
    pub fn unregister_worker(&self, worker_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.active_workers.remove(worker_id);
        for entry in inner.entries.values_mut() {
            entry.votes.remove(worker_id);
        }
        for session in inner.sessions.values_mut() {
            session.votes.remove(worker_id);
        }
        let count = Self::active_worker_count(&inner);
        for entry in inner.entries.values_mut() {
            Self::recompute_confidence(entry, count);
        }
    }

    /// Share a fact. If `key` is new, it is created with a single vote from
    /// `worker_id`. Otherwise `worker_id`'s vote is added, confidence is
    /// recomputed, and the value is replaced only if the new confidence
    /// strictly exceeds the stored one.
    pub fn share(
        &self,
        worker_id: WorkerId,
        key: impl Into<String>,
        value: Value,
        ttl: Option<Duration>,
    ) -> OrchestratorResult<()> {
        let key = key.into();
        let mut inner = self.inner.write().unwrap();
        let now = self.clock.now();
        let active = Self::active_worker_count(&inner);

        match inner.entries.get_mut(&key) {
            None => {
                let mut votes = HashSet::new();
                votes.insert(worker_id.clone());
                let confidence = 1.0 / active as f64;
                inner.entries.insert(
                    key.clone(),
                    KnowledgeEntry {
                        key,
                        value,
                        author_worker_id: worker_id,
                        created_at: now,
                        ttl,
                        confidence,
                        votes,
                    },
                );
            }
            Some(entry) => {
                let previous_confidence = entry.confidence;
                entry.votes.insert(worker_id);
                Self::recompute_confidence(entry, active);
                if entry.confidence > previous_confidence {
                    entry.value = value;
                    entry.created_at = now;
                }
            }
        }
        self.evict_over_capacity(&mut inner);
        Ok(())
    }

    /// Return `key`'s value if present and not expired. Lazily removes the
    /// entry if it has expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap();
        let expired = inner.entries.get(key).map(|e| e.is_expired(now)).unwrap_or(false);
        if expired {
            inner.entries.remove(key);
            return None;
        }
        inner.entries.get(key).map(|e| e.value.clone())
    }

    /// Linear scan for every live entry whose key contains `pattern`.
    pub fn search(&self, pattern: &str) -> Vec<KnowledgeEntry> {
        let now = self.clock.now();
        let inner = self.inner.read().unwrap();
        inner
            .entries
            .values()
            .filter(|e| !e.is_expired(now) && e.key.contains(pattern))
            .cloned()
            .collect()
    }

    /// Open a consensus session on `proposal`.
    pub fn request_consensus(
        &self,
        requester: WorkerId,
        topic: impl Into<String>,
        proposal: Value,
        deadline: DateTime<Utc>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let mut inner = self.inner.write().unwrap();
        inner.sessions.insert(
            id,
            ConsensusSession {
                id,
                topic: topic.into(),
                proposal,
                requester_worker_id: requester,
                deadline,
                votes: HashMap::new(),
                status: ConsensusStatus::Pending,
            },
        );
        id
    }

    /// Cast `worker`'s ballot. Rejected if the session is terminal or the
    /// worker has already voted. Finalizes the session immediately once
    /// the vote count reaches `consensusThreshold * activeWorkers`.
    pub fn vote(
        &self,
        worker: WorkerId,
        session_id: Uuid,
        value: bool,
        confidence: f64,
        reason: Option<String>,
    ) -> OrchestratorResult<()> {
        let mut inner = self.inner.write().unwrap();
        let active = Self::active_worker_count(&inner);
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("consensus session {session_id}")))?;
        if session.status.is_terminal() {
            return Err(OrchestratorError::InvalidState(
                "consensus session is already terminal".into(),
            ));
        }
        if session.votes.contains_key(&worker) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "worker {worker} has already voted in session {session_id}"
            )));
        }
        session.votes.insert(worker, Vote { value, confidence, reason });

        let threshold_count = (self.consensus_threshold * active as f64).ceil() as usize;
        if session.votes.len() >= threshold_count.max(1) {
            let approvals = session.votes.values().filter(|v| v.value).count();
            session.status = if approvals * 2 >= session.votes.len() {
                ConsensusStatus::Approved
            } else {
                ConsensusStatus::Rejected
            };
        }
        Ok(())
    }

    /// Snapshot of a session, transitioning it to `Timeout` first if its
    /// deadline has passed and it is still pending.
    pub fn consensus_result(&self, session_id: Uuid) -> OrchestratorResult<ConsensusSession> {
        let mut inner = self.inner.write().unwrap();
        let now = self.clock.now();
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("consensus session {session_id}")))?;
        if session.status == ConsensusStatus::Pending && session.deadline <= now {
            session.status = ConsensusStatus::Timeout;
        }
        Ok(session.clone())
    }

    /// Record `experience` against its matching pattern (problem-solution
    /// on success, error-pattern on failure), and on success also publish
    /// the solution via `share` under `solution:<problem>`.
    pub fn learn(&self, worker_id: WorkerId, experience: Experience) {
        let now = self.clock.now();
        let (kind, signature) = if experience.success {
            (PatternKind::ProblemSolution, experience.problem.clone())
        } else {
            (
                PatternKind::ErrorPattern,
                experience.error.clone().unwrap_or_else(|| experience.problem.clone()),
            )
        };

        {
            let mut inner = self.inner.write().unwrap();
            let pattern = inner
                .patterns
                .entry(signature.clone())
                .or_insert_with(|| LearnedPattern {
                    kind,
                    signature: signature.clone(),
                    occurrences: 0,
                    contributors: HashSet::new(),
                    last_seen_at: now,
                    representative_solution: None,
                });
            pattern.occurrences += 1;
            pattern.contributors.insert(worker_id.clone());
            pattern.last_seen_at = now;
            if pattern.representative_solution.is_none() {
                pattern.representative_solution = experience.solution.clone();
            }
        }

        if experience.success {
            if let Some(solution) = experience.solution {
                let _ = self.share(
                    worker_id,
                    format!("solution:{}", experience.problem),
                    solution,
                    None,
                );
            }
        }
    }

    pub fn pattern(&self, signature: &str) -> Option<LearnedPattern> {
        self.inner.read().unwrap().patterns.get(signature).cloned()
    }

    /// Periodic sweep: drop TTL-expired entries, finalize past-deadline
    /// sessions, and enforce the capacity eviction policy.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap();
        inner.entries.retain(|_, e| !e.is_expired(now));
        for session in inner.sessions.values_mut() {
            if session.status == ConsensusStatus::Pending && session.deadline <= now {
                session.status = ConsensusStatus::Timeout;
            }
        }
        self.evict_over_capacity(&mut inner);
    }

    /// Evict lowest-confidence (oldest-first tiebreak) entries until the
    /// store is back at or under `max_knowledge`.
    fn evict_over_capacity(&self, inner: &mut Inner) {
        while inner.entries.len() > self.max_knowledge {
            let victim = inner
                .entries
                .values()
                .min_by(|a, b| {
                    a.confidence
                        .partial_cmp(&b.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.created_at.cmp(&b.created_at))
                })
                .map(|e| e.key.clone());
            match victim {
                Some(key) => {
                    inner.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn store(max: usize, threshold: f64) -> (KnowledgeStore, Arc<FakeClock>) {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = Arc::new(FakeClock::new(start));
        let store = KnowledgeStore::new(max, threshold, clock.clone());
        (store, clock)
    }

    #[test]
    fn share_then_get_returns_value() {
        let (store, _clock) = store(100, 0.5);
        store.register_worker("w1".to_string());
        store.share("w1".to_string(), "k", serde_json::json!("v"), None).unwrap();
        assert_eq!(store.get("k"), Some(serde_json::json!("v")));
    }

    #[test]
    fn confidence_is_votes_over_active_workers() {
        let (store, _clock) = store(100, 0.5);
        store.register_worker("w1".to_string());
        store.register_worker("w2".to_string());
        store.share("w1".to_string(), "k", serde_json::json!(1), None).unwrap();
        let entries = store.search("k");
        assert_eq!(entries.len(), 1);
        assert!((entries[0].confidence - 0.5).abs() < 1e-9);

        store.share("w2".to_string(), "k", serde_json::json!(2), None).unwrap();
        let entries = store.search("k");
        assert!((entries[0].confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn expired_entry_is_unreadable_and_lazily_removed() {
        let (store, clock) = store(100, 0.5);
        store.register_worker("w1".to_string());
        store
            .share("w1".to_string(), "k", serde_json::json!(1), Some(Duration::from_secs(10)))
            .unwrap();
        clock.advance(chrono::Duration::seconds(20));
        assert_eq!(store.get("k"), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn unregister_worker_strips_votes_and_recomputes_confidence() {
        let (store, _clock) = store(100, 0.5);
        store.register_worker("w1".to_string());
        store.register_worker("w2".to_string());
        store.share("w1".to_string(), "k", serde_json::json!(1), None).unwrap();
        store.share("w2".to_string(), "k", serde_json::json!(1), None).unwrap();

        store.unregister_worker("w2");
        let entries = store.search("k");
        assert_eq!(entries[0].votes.len(), 1);
        assert!((entries[0].confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn eviction_removes_lowest_confidence_first() {
        let (store, _clock) = store(1, 0.5);
        store.register_worker("w1".to_string());
        store.register_worker("w2".to_string());
        store.share("w1".to_string(), "low", serde_json::json!(1), None).unwrap();
        store.share("w1".to_string(), "high", serde_json::json!(1), None).unwrap();
        store.share("w2".to_string(), "high", serde_json::json!(1), None).unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.get("high").is_some());
        assert!(store.get("low").is_none());
    }

    #[test]
    fn vote_rejects_double_voting_and_terminal_sessions() {
        let (store, clock) = store(100, 0.5);
        store.register_worker("w1".to_string());
        let id = store.request_consensus(
            "w1".to_string(),
            "topic",
            serde_json::json!("proposal"),
            clock.now() + chrono::Duration::seconds(60),
        );
        store.vote("w1".to_string(), id, true, 1.0, None).unwrap();
        let err = store.vote("w1".to_string(), id, true, 1.0, None).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
    }

    #[test]
    fn consensus_finalizes_once_threshold_reached() {
        let (store, clock) = store(100, 0.5);
        store.register_worker("w1".to_string());
        store.register_worker("w2".to_string());
        let id = store.request_consensus(
            "w1".to_string(),
            "topic",
            serde_json::json!("proposal"),
            clock.now() + chrono::Duration::seconds(60),
        );
        store.vote("w1".to_string(), id, true, 1.0, None).unwrap();
        let result = store.consensus_result(id).unwrap();
        assert_eq!(result.status, ConsensusStatus::Approved);
    }

    #[test]
    fn consensus_times_out_past_deadline() {
        let (store, clock) = store(100, 0.9);
        store.register_worker("w1".to_string());
        store.register_worker("w2".to_string());
        let id = store.request_consensus(
            "w1".to_string(),
            "topic",
            serde_json::json!("proposal"),
            clock.now() + chrono::Duration::seconds(10),
        );
        clock.advance(chrono::Duration::seconds(20));
        let result = store.consensus_result(id).unwrap();
        assert_eq!(result.status, ConsensusStatus::Timeout);
    }

    #[test]
    fn learn_increments_occurrences_and_publishes_solution_on_success() {
        let (store, _clock) = store(100, 0.5);
        store.register_worker("w1".to_string());
        store.learn(
            "w1".to_string(),
            Experience {
                problem: "slow query".to_string(),
                success: true,
                solution: Some(serde_json::json!("add index")),
                error: None,
            },
        );
        let pattern = store.pattern("slow query").unwrap();
        assert_eq!(pattern.occurrences, 1);
        assert_eq!(store.get("solution:slow query"), Some(serde_json::json!("add index")));

        store.learn(
            "w1".to_string(),
            Experience {
                problem: "slow query".to_string(),
                success: true,
                solution: Some(serde_json::json!("add index")),
                error: None,
            },
        );
        assert_eq!(store.pattern("slow query").unwrap().occurrences, 2);
    }

    #[test]
    fn learn_records_error_pattern_on_failure() {
        let (store, _clock) = store(100, 0.5);
        store.register_worker("w1".to_string());
        store.learn(
            "w1".to_string(),
            Experience {
                problem: "connect to db".to_string(),
                success: false,
                solution: None,
                error: Some("connection refused".to_string()),
            },
        );
        let pattern = store.pattern("connection refused").unwrap();
        assert_eq!(pattern.kind, PatternKind::ErrorPattern);
    }
}
