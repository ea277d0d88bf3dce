//! Vote granting on the receiver side and vote counting on the candidate side.

use crate::raft::rpc::{VoteRequest, VoteResponse};
use crate::raft::state::{RaftRole, RaftState};

/// What a vote reply did to the candidate's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Reply belongs to an election this peer is no longer running
    Stale,
    /// Reply carried a newer term; the candidate stepped down
    SteppedDown,
    /// Vote was refused (or was a duplicate of one already counted)
    Rejected,
    /// Vote counted, majority not yet reached
    Counted,
    /// This vote crossed the majority threshold. Reported exactly once per
    /// election.
    Elected,
}

/// Handle RequestVote RPC
pub fn handle_request_vote(state: &mut RaftState, req: &VoteRequest, my_id: u64) -> VoteResponse {
    // A newer term always wins: step down and forget the old vote
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let vote_granted = if req.term < state.current_term {
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        false
    } else {
        state.grant_vote(req.candidate_id);
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Build the ballot a freshly started candidate sends to every peer.
pub fn vote_request(state: &RaftState, my_id: u64) -> VoteRequest {
    VoteRequest {
        term: state.current_term,
        candidate_id: my_id,
        last_log_index: state.last_log_index(),
        last_log_term: state.last_log_term(),
    }
}

/// Fold one vote reply into the candidate's tally.
///
/// `sent_term` is the term the request was issued in; a reply for any other
/// term, or arriving after the candidacy ended, is discarded untouched.
pub fn handle_vote_response(
    state: &mut RaftState,
    peer_id: u64,
    sent_term: u64,
    resp: &VoteResponse,
    cluster_size: usize,
) -> VoteOutcome {
    if state.role != RaftRole::Candidate || state.current_term != sent_term {
        return VoteOutcome::Stale;
    }

    if resp.term > state.current_term {
        state.become_follower(resp.term);
        return VoteOutcome::SteppedDown;
    }

    if !resp.vote_granted || !state.voters.insert(peer_id) {
        return VoteOutcome::Rejected;
    }

    state.votes_received += 1;
    let majority = (cluster_size / 2 + 1) as u64;
    if state.votes_received == majority {
        VoteOutcome::Elected
    } else {
        VoteOutcome::Counted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(term: u64) -> VoteResponse {
        VoteResponse {
            term,
            vote_granted: true,
        }
    }

    #[test]
    fn grant_vote_to_new_term_candidate() {
        let mut state = RaftState::new();
        state.current_term = 1;

        let req = VoteRequest {
            term: 2,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        };
        let resp = handle_request_vote(&mut state, &req, 1);

        assert!(resp.vote_granted);
        assert_eq!(resp.term, 2);
        assert_eq!(state.voted_for, Some(2));
        assert_eq!(state.role, RaftRole::Follower);
        assert!(state.take_dirty());
    }

    #[test]
    fn repeat_request_from_same_candidate_is_granted() {
        let mut state = RaftState::new();
        state.current_term = 2;
        state.voted_for = Some(4);

        let req = VoteRequest {
            term: 2,
            candidate_id: 4,
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(handle_request_vote(&mut state, &req, 1).vote_granted);
    }

    #[test]
    fn higher_term_request_resets_vote_even_when_refused() {
        let mut state = RaftState::new();
        state.current_term = 1;
        state.voted_for = Some(3);
        state.log.append(1, Vec::new());

        let req = VoteRequest {
            term: 4,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        };
        let resp = handle_request_vote(&mut state, &req, 1);

        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 4);
        assert_eq!(state.current_term, 4);
        assert_eq!(state.voted_for, None);
    }

    #[test]
    fn vote_request_snapshots_last_log_position() {
        let mut state = RaftState::new();
        state.current_term = 1;
        state.append_command(Vec::new());
        state.become_candidate(7);

        let req = vote_request(&state, 7);
        assert_eq!(req.term, 2);
        assert_eq!(req.candidate_id, 7);
        assert_eq!(req.last_log_index, 1);
        assert_eq!(req.last_log_term, 1);
    }

    #[test]
    fn majority_reported_once() {
        let mut state = RaftState::new();
        state.become_candidate(0);

        assert_eq!(handle_vote_response(&mut state, 1, 1, &granted(1), 5), VoteOutcome::Counted);
        assert_eq!(handle_vote_response(&mut state, 2, 1, &granted(1), 5), VoteOutcome::Elected);
        assert_eq!(handle_vote_response(&mut state, 3, 1, &granted(1), 5), VoteOutcome::Counted);
        assert_eq!(state.votes_received, 4);
    }

    #[test]
    fn duplicate_reply_is_not_counted_twice() {
        let mut state = RaftState::new();
        state.become_candidate(0);

        assert_eq!(handle_vote_response(&mut state, 1, 1, &granted(1), 5), VoteOutcome::Counted);
        assert_eq!(handle_vote_response(&mut state, 1, 1, &granted(1), 5), VoteOutcome::Rejected);
        assert_eq!(state.votes_received, 2);
    }

    #[test]
    fn stale_term_reply_is_discarded() {
        let mut state = RaftState::new();
        state.become_candidate(0);
        state.become_candidate(0);
        state.become_candidate(0);
        assert_eq!(state.current_term, 3);

        let outcome = handle_vote_response(&mut state, 1, 2, &granted(2), 3);
        assert_eq!(outcome, VoteOutcome::Stale);
        assert_eq!(state.votes_received, 1);
        assert_eq!(state.role, RaftRole::Candidate);
    }

    #[test]
    fn higher_term_reply_steps_down() {
        let mut state = RaftState::new();
        state.become_candidate(0);

        let resp = VoteResponse {
            term: 9,
            vote_granted: false,
        };
        assert_eq!(handle_vote_response(&mut state, 1, 1, &resp, 3), VoteOutcome::SteppedDown);
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 9);
        assert_eq!(state.voted_for, None);
    }
}
