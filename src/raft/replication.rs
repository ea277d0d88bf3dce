//! Log reconciliation on followers and progress tracking on the leader.

use crate::raft::rpc::{AppendEntriesRequest, AppendEntriesResponse};
use crate::raft::state::{RaftRole, RaftState};

/// What an AppendEntries reply did to the leader's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Reply for a term or leadership this peer no longer holds
    Stale,
    /// Reply carried a newer term; the leader stepped down
    SteppedDown,
    /// Accepted, but the follower's known progress did not move
    Acknowledged,
    /// Follower's match index moved forward
    Replicated { match_index: u64, commit_advanced: bool },
    /// Consistency check failed; the leader will resume from `next_index`
    Rejected { next_index: u64 },
}

/// Handle AppendEntries RPC
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesRequest,
    my_id: u64,
) -> AppendEntriesResponse {
    if req.term < state.current_term {
        return AppendEntriesResponse {
            term: state.current_term,
            success: false,
            next_index: state.last_log_index() + 1,
        };
    }

    // Valid leader for this term: adopt its term and fall back to follower
    state.become_follower(req.term);
    state.leader_id = Some(req.leader_id);

    let last_log_index = state.last_log_index();
    if req.prev_log_index > last_log_index {
        return AppendEntriesResponse {
            term: state.current_term,
            success: false,
            next_index: last_log_index + 1,
        };
    }

    if state.log.term_at(req.prev_log_index) != Some(req.prev_log_term) {
        // Skip the whole conflicting term in one round trip. Committed
        // entries always match the leader, so never point below them.
        let next_index = state
            .log
            .first_index_of_term_run(req.prev_log_index)
            .max(state.commit_index + 1);
        tracing::debug!(
            node_id = my_id,
            prev_log_index = req.prev_log_index,
            prev_log_term = req.prev_log_term,
            next_index,
            "AppendEntries consistency check failed"
        );
        return AppendEntriesResponse {
            term: state.current_term,
            success: false,
            next_index,
        };
    }

    if state.log.merge(req.prev_log_index, &req.entries) {
        state.mark_log_changed();
        tracing::debug!(
            node_id = my_id,
            entries_appended = req.entries.len(),
            new_last_index = state.last_log_index(),
            "Appended entries"
        );
    }

    // Only entries this request vouched for may be committed
    if req.leader_commit > state.commit_index {
        state.advance_commit(req.leader_commit.min(req.last_entry_index()));
    }

    AppendEntriesResponse {
        term: state.current_term,
        success: true,
        next_index: state.last_log_index() + 1,
    }
}

/// Build the next AppendEntries for `peer_id`: everything from the peer's
/// `next_index` to the end of the leader's log. Returns `None` unless this
/// peer is leader.
pub fn append_request_for(
    state: &RaftState,
    peer_id: u64,
    my_id: u64,
) -> Option<AppendEntriesRequest> {
    if state.role != RaftRole::Leader {
        return None;
    }
    let last_log_index = state.last_log_index();
    let next_index = state
        .next_index
        .get(&peer_id)
        .copied()
        .unwrap_or(last_log_index + 1)
        .clamp(1, last_log_index + 1);
    let prev_log_index = next_index - 1;

    Some(AppendEntriesRequest {
        term: state.current_term,
        leader_id: my_id,
        prev_log_index,
        prev_log_term: state.log.term_at(prev_log_index).unwrap_or(0),
        entries: state.log.entries_from(next_index),
        leader_commit: state.commit_index,
    })
}

/// Fold one AppendEntries reply into the leader's per-peer progress.
pub fn handle_append_response(
    state: &mut RaftState,
    peer_id: u64,
    req: &AppendEntriesRequest,
    resp: &AppendEntriesResponse,
    cluster_size: usize,
) -> AppendOutcome {
    if state.role != RaftRole::Leader || state.current_term != req.term {
        return AppendOutcome::Stale;
    }

    if resp.term > state.current_term {
        state.become_follower(resp.term);
        return AppendOutcome::SteppedDown;
    }

    if resp.success {
        // A successful check proves the follower holds everything up to the
        // last index covered. Replies can arrive out of order, so progress
        // only moves forward.
        let covered = req.last_entry_index();
        let previous = state.match_index.get(&peer_id).copied().unwrap_or(0);
        if covered <= previous {
            return AppendOutcome::Acknowledged;
        }
        let match_index = covered;
        state.match_index.insert(peer_id, match_index);
        state.next_index.insert(peer_id, match_index + 1);

        let commit_advanced = state.advance_leader_commit(cluster_size);
        return AppendOutcome::Replicated {
            match_index,
            commit_advanced,
        };
    }

    let next_index = resp.next_index.clamp(1, state.last_log_index() + 1);
    state.next_index.insert(peer_id, next_index);
    AppendOutcome::Rejected { next_index }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::LogEntry;

    fn follower_with_terms(terms: &[u64]) -> RaftState {
        let mut state = RaftState::new();
        for &term in terms {
            state.log.append(term, Vec::new());
        }
        state.current_term = terms.last().copied().unwrap_or(0);
        state
    }

    fn leader_with_terms(terms: &[u64], peers: &[u64]) -> RaftState {
        let mut state = follower_with_terms(terms);
        state.become_candidate(0);
        state.become_leader(0, peers);
        state
    }

    #[test]
    fn heartbeat_accepted_and_leader_recorded() {
        let mut state = RaftState::new();
        state.current_term = 1;

        let req = AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let resp = handle_append_entries(&mut state, &req, 1);

        assert!(resp.success);
        assert_eq!(resp.next_index, 1);
        assert_eq!(state.leader_id, Some(2));
    }

    #[test]
    fn stale_term_rejected() {
        let mut state = RaftState::new();
        state.current_term = 5;

        let req = AppendEntriesRequest {
            term: 3,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let resp = handle_append_entries(&mut state, &req, 1);

        assert!(!resp.success);
        assert_eq!(resp.term, 5);
        assert_eq!(state.current_term, 5);
    }

    #[test]
    fn missing_prev_entry_hints_end_of_log() {
        let mut state = follower_with_terms(&[1, 1]);

        let req = AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 5,
            prev_log_term: 1,
            entries: vec![],
            leader_commit: 0,
        };
        let resp = handle_append_entries(&mut state, &req, 1);

        assert!(!resp.success);
        assert_eq!(resp.next_index, 3);
    }

    #[test]
    fn conflicting_term_hint_points_at_start_of_term() {
        // Follower [T1, T1, T2]; leader's entry 3 is T1.
        let mut state = follower_with_terms(&[1, 1, 2]);

        let req = AppendEntriesRequest {
            term: 3,
            leader_id: 0,
            prev_log_index: 3,
            prev_log_term: 1,
            entries: vec![LogEntry::new(3, 4, "new")],
            leader_commit: 0,
        };
        let resp = handle_append_entries(&mut state, &req, 1);

        assert!(!resp.success);
        assert_eq!(resp.next_index, 3);
        assert_eq!(state.last_log_index(), 3);

        // Leader resends from index 3 and overwrites the divergent suffix.
        let retry = AppendEntriesRequest {
            term: 3,
            leader_id: 0,
            prev_log_index: 2,
            prev_log_term: 1,
            entries: vec![LogEntry::new(1, 3, ""), LogEntry::new(3, 4, "new")],
            leader_commit: 0,
        };
        let resp = handle_append_entries(&mut state, &retry, 1);

        assert!(resp.success);
        assert_eq!(resp.next_index, 5);
        assert_eq!(state.log.term_at(3), Some(1));
        assert_eq!(state.log.term_at(4), Some(3));
        assert!(state.take_dirty());
    }

    #[test]
    fn commit_follows_leader_but_not_past_verified_entries() {
        let mut state = follower_with_terms(&[1, 1, 1]);

        let req = AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![],
            leader_commit: 3,
        };
        let resp = handle_append_entries(&mut state, &req, 1);

        assert!(resp.success);
        assert_eq!(state.commit_index, 1);
    }

    #[test]
    fn candidate_steps_down_on_same_term_append() {
        let mut state = RaftState::new();
        state.become_candidate(1);

        let req = AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        assert!(handle_append_entries(&mut state, &req, 1).success);
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.voted_for, Some(1));
    }

    #[test]
    fn request_carries_entries_from_next_index() {
        let mut state = leader_with_terms(&[1, 1], &[1, 2]);
        state.append_command(b"x".to_vec());
        state.next_index.insert(1, 2);

        let req = append_request_for(&state, 1, 0).unwrap();
        assert_eq!(req.term, 2);
        assert_eq!(req.prev_log_index, 1);
        assert_eq!(req.prev_log_term, 1);
        assert_eq!(req.entries.len(), 2);
        assert_eq!(req.entries[1].command, b"x");

        // Peer 2 is caught up to the election point: heartbeat plus new entry.
        let req = append_request_for(&state, 2, 0).unwrap();
        assert_eq!(req.prev_log_index, 2);
        assert_eq!(req.entries.len(), 1);
    }

    #[test]
    fn no_request_unless_leader() {
        let state = follower_with_terms(&[1]);
        assert!(append_request_for(&state, 1, 0).is_none());
    }

    #[test]
    fn success_advances_progress_and_commit() {
        let mut state = leader_with_terms(&[], &[1, 2]);
        state.append_command(b"x".to_vec());
        let req = append_request_for(&state, 1, 0).unwrap();
        let resp = AppendEntriesResponse {
            term: 1,
            success: true,
            next_index: 2,
        };

        let outcome = handle_append_response(&mut state, 1, &req, &resp, 3);
        assert_eq!(
            outcome,
            AppendOutcome::Replicated {
                match_index: 1,
                commit_advanced: true
            }
        );
        assert_eq!(state.next_index.get(&1), Some(&2));
        assert_eq!(state.commit_index, 1);
    }

    #[test]
    fn out_of_order_success_does_not_regress_match() {
        let mut state = leader_with_terms(&[], &[1, 2]);
        state.append_command(Vec::new());
        let old = append_request_for(&state, 1, 0).unwrap();
        state.append_command(Vec::new());
        let new = append_request_for(&state, 1, 0).unwrap();
        let ok = AppendEntriesResponse {
            term: 1,
            success: true,
            next_index: 3,
        };

        handle_append_response(&mut state, 1, &new, &ok, 3);
        handle_append_response(&mut state, 1, &old, &ok, 3);
        assert_eq!(state.match_index.get(&1), Some(&2));
        assert_eq!(state.next_index.get(&1), Some(&3));
    }

    #[test]
    fn heartbeat_success_records_verified_prefix() {
        let mut state = leader_with_terms(&[1, 1], &[1, 2]);
        let req = append_request_for(&state, 1, 0).unwrap();
        assert!(req.entries.is_empty());
        let ok = AppendEntriesResponse {
            term: 2,
            success: true,
            next_index: 3,
        };

        let outcome = handle_append_response(&mut state, 1, &req, &ok, 3);
        assert!(matches!(outcome, AppendOutcome::Replicated { match_index: 2, .. }));
        // Earlier-term entries are not committed by counting replicas
        assert_eq!(state.commit_index, 0);

        assert_eq!(
            handle_append_response(&mut state, 1, &req, &ok, 3),
            AppendOutcome::Acknowledged
        );
    }

    #[test]
    fn rejection_jumps_to_hint() {
        let mut state = leader_with_terms(&[1, 1, 1], &[1, 2]);
        state.append_command(Vec::new());
        let req = append_request_for(&state, 1, 0).unwrap();
        let resp = AppendEntriesResponse {
            term: 2,
            success: false,
            next_index: 3,
        };

        let outcome = handle_append_response(&mut state, 1, &req, &resp, 3);
        assert_eq!(outcome, AppendOutcome::Rejected { next_index: 3 });
        assert_eq!(state.next_index.get(&1), Some(&3));
    }

    #[test]
    fn newer_term_reply_steps_leader_down() {
        let mut state = leader_with_terms(&[], &[1, 2]);
        let req = append_request_for(&state, 1, 0).unwrap();
        let resp = AppendEntriesResponse {
            term: 4,
            success: false,
            next_index: 1,
        };

        assert_eq!(
            handle_append_response(&mut state, 1, &req, &resp, 3),
            AppendOutcome::SteppedDown
        );
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 4);
        assert!(state.take_dirty());
    }

    #[test]
    fn reply_after_term_change_is_stale() {
        let mut state = leader_with_terms(&[], &[1, 2]);
        state.append_command(Vec::new());
        let req = append_request_for(&state, 1, 0).unwrap();
        state.become_follower(2);
        state.become_candidate(0);
        state.become_leader(0, &[1, 2]);

        let resp = AppendEntriesResponse {
            term: 1,
            success: true,
            next_index: 2,
        };
        assert_eq!(
            handle_append_response(&mut state, 1, &req, &resp, 3),
            AppendOutcome::Stale
        );
        assert_eq!(state.match_index.get(&1), Some(&0));
    }
}
