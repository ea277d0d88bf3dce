use std::collections::{HashMap, HashSet};

use crate::raft::log::RaftLog;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// The peer record. Every field is read and written under the node's single
/// lock.
///
/// # Raft Safety Invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term. Enforced by:
/// - Each node votes for at most one candidate per term (`voted_for`), and the
///   vote is only cleared when the term advances
/// - Candidate must receive a strict majority of votes to become leader
///
/// ## Leader Append-Only
/// A leader never overwrites or deletes entries in its log. Enforced by:
/// - Leaders only append new entries via `append_command()`
/// - Log truncation only occurs on followers during replication conflicts
///
/// ## Log Matching
/// If two logs contain an entry with the same index and term, then the logs
/// are identical in all entries up through that index. Enforced by:
/// - `AppendEntries` consistency check (prev_log_index, prev_log_term)
/// - Conflicting entries are truncated before appending
///
/// ## Leader Completeness
/// If a log entry is committed in a given term, that entry will be present
/// in the logs of all leaders for higher terms. Enforced by:
/// - Vote restriction: candidates must have up-to-date logs (`is_log_up_to_date`)
/// - Leaders only commit entries from their current term (`advance_leader_commit`)
///
/// ## State Machine Safety
/// Entries are only applied after being committed
/// (`last_applied <= commit_index <= last_log_index`) and `commit_index`
/// never decreases.
#[derive(Debug)]
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: RaftLog,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    pub role: RaftRole,

    // Known leader (if any)
    pub leader_id: Option<u64>,

    // Votes received in current election (for candidates), self included
    pub votes_received: u64,
    // Peers whose grant has been counted this election
    pub voters: HashSet<u64>,

    // Set whenever term, vote or log change and a save is owed
    dirty: bool,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: 0,
            voters: HashSet::new(),
            dirty: false,
        }
    }

    /// Rebuild a follower from persisted term, vote and log.
    pub fn restore(current_term: u64, voted_for: Option<u64>, log: RaftLog) -> Self {
        Self {
            current_term,
            voted_for,
            log,
            ..Self::new()
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Step down to follower, adopting `term` if it is newer.
    ///
    /// The vote is cleared only when the term actually advances; clearing it
    /// within the same term would allow a second vote.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.dirty = true;
        }
        self.role = RaftRole::Follower;
        self.votes_received = 0;
        self.voters.clear();
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received = 1; // Vote for self
        self.voters.clear();
        self.leader_id = None;
        self.dirty = true;
    }

    /// Transition to leader state. Only a candidate can win, so a repeated
    /// call in the same term is a no-op and returns false.
    pub fn become_leader(&mut self, my_id: u64, peer_ids: &[u64]) -> bool {
        if self.role != RaftRole::Candidate {
            return false;
        }
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);

        let last_log_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, last_log_index + 1);
            self.match_index.insert(peer_id, 0);
        }
        true
    }

    pub fn grant_vote(&mut self, candidate_id: u64) {
        self.voted_for = Some(candidate_id);
        self.role = RaftRole::Follower;
        self.dirty = true;
    }

    /// Append a client command in the current term. Caller checks leadership.
    pub fn append_command(&mut self, command: Vec<u8>) -> u64 {
        let index = self.log.append(self.current_term, command);
        self.dirty = true;
        index
    }

    pub fn mark_log_changed(&mut self) {
        self.dirty = true;
    }

    /// Returns whether persistent fields changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Raise `commit_index` to `index` if that is an advance. Returns true
    /// when it moved.
    pub fn advance_commit(&mut self, index: u64) -> bool {
        let index = index.min(self.last_log_index());
        if index > self.commit_index {
            self.commit_index = index;
            true
        } else {
            false
        }
    }

    /// Leader commit rule: the highest index `n` replicated on a strict
    /// majority (self included, via `match_index`) whose entry carries the
    /// current term. Entries from earlier terms commit only indirectly.
    pub fn advance_leader_commit(&mut self, cluster_size: usize) -> bool {
        if self.role != RaftRole::Leader {
            return false;
        }
        let mut n = self.last_log_index();
        while n > self.commit_index {
            if self.log.term_at(n) == Some(self.current_term) {
                let replicas = 1 + self.match_index.values().filter(|&&m| m >= n).count();
                if replicas > cluster_size / 2 {
                    return self.advance_commit(n);
                }
            } else if self.log.term_at(n).is_some_and(|t| t < self.current_term) {
                break;
            }
            n -= 1;
        }
        false
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
