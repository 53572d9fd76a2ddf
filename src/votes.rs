//! Per-answer vote ledger.
//!
//! Every answer carries the set of users whose upvote is currently counted.
//! A downvote retracts an earlier upvote, so each user contributes either 0
//! or +1 to the running total and `votes - voters.len()` never changes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::models::{Answer, Id};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteDirection {
    Up,
    Down,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VoteError {
    #[error("user has already voted on this answer")]
    AlreadyVoted,
    #[error("user has not voted on this answer")]
    NotVoted,
    #[error("users cannot vote on their own answer")]
    SelfVote,
}

/// Users whose upvote is counted on an answer. Serialized as a sorted list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoterSet(BTreeSet<Id>);

impl VoterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, user_id: Id) -> bool {
        self.0.contains(&user_id)
    }

    pub fn insert(&mut self, user_id: Id) -> bool {
        self.0.insert(user_id)
    }

    pub fn remove(&mut self, user_id: Id) -> bool {
        self.0.remove(&user_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Id> {
        self.0.iter().copied().collect()
    }
}

impl FromIterator<Id> for VoterSet {
    fn from_iter<I: IntoIterator<Item = Id>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Vec<Id>> for VoterSet {
    fn from(ids: Vec<Id>) -> Self {
        ids.into_iter().collect()
    }
}

/// Apply one vote transition to `answer` in place and return the new total.
///
/// On error the answer is left untouched, so callers holding a lock (or a row
/// lock inside a transaction) can simply drop the change.
pub fn apply_vote(answer: &mut Answer, voter: Id, direction: VoteDirection) -> Result<i64, VoteError> {
    if voter == answer.author_id {
        return Err(VoteError::SelfVote);
    }
    match direction {
        VoteDirection::Up => {
            if !answer.voters.insert(voter) {
                return Err(VoteError::AlreadyVoted);
            }
            answer.votes += 1;
        }
        VoteDirection::Down => {
            if !answer.voters.remove(voter) {
                return Err(VoteError::NotVoted);
            }
            answer.votes -= 1;
        }
    }
    Ok(answer.votes)
}

/// How an answer looks to a particular viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerVote {
    OwnAnswer,
    Voted,
    NotVoted,
}

impl ViewerVote {
    pub fn of(answer: &Answer, viewer: Id) -> Self {
        if viewer == answer.author_id {
            ViewerVote::OwnAnswer
        } else if answer.voters.contains(viewer) {
            ViewerVote::Voted
        } else {
            ViewerVote::NotVoted
        }
    }

    /// Wire flag the frontend expects: 1 = may upvote.
    pub fn can_vote(self) -> u8 {
        match self {
            ViewerVote::NotVoted => 1,
            ViewerVote::OwnAnswer | ViewerVote::Voted => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn answer(author: Id, votes: i64, voters: &[Id]) -> Answer {
        Answer {
            id: 1,
            question_id: 1,
            author_id: author,
            votes,
            voters: voters.iter().copied().collect(),
            html: "<p>x</p>".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn upvote_once_per_user() {
        let mut a = answer(1, 0, &[]);
        assert_eq!(apply_vote(&mut a, 2, VoteDirection::Up), Ok(1));
        assert_eq!(apply_vote(&mut a, 2, VoteDirection::Up), Err(VoteError::AlreadyVoted));
        assert_eq!(a.votes, 1);
        assert!(a.voters.contains(2));
    }

    #[test]
    fn downvote_requires_prior_upvote() {
        let mut a = answer(1, 3, &[]);
        assert_eq!(apply_vote(&mut a, 2, VoteDirection::Down), Err(VoteError::NotVoted));
        assert_eq!(a.votes, 3);
    }

    #[test]
    fn up_then_down_restores_count() {
        let mut a = answer(1, 4, &[9]);
        apply_vote(&mut a, 2, VoteDirection::Up).unwrap();
        apply_vote(&mut a, 2, VoteDirection::Down).unwrap();
        assert_eq!(a.votes, 4);
        assert!(!a.voters.contains(2));
        assert!(a.voters.contains(9));
    }

    #[test]
    fn self_vote_rejected_in_both_directions() {
        let mut a = answer(5, 0, &[]);
        assert_eq!(apply_vote(&mut a, 5, VoteDirection::Up), Err(VoteError::SelfVote));
        assert_eq!(apply_vote(&mut a, 5, VoteDirection::Down), Err(VoteError::SelfVote));
        assert!(a.voters.is_empty());
    }

    #[test]
    fn retract_example_from_five() {
        let mut a = answer(1, 5, &[7]);
        assert_eq!(apply_vote(&mut a, 7, VoteDirection::Down), Ok(4));
        assert!(a.voters.is_empty());
        assert_eq!(apply_vote(&mut a, 7, VoteDirection::Down), Err(VoteError::NotVoted));
        assert_eq!(a.votes, 4);
    }

    #[test]
    fn offset_between_count_and_voters_is_stable() {
        let mut a = answer(1, 10, &[2, 3]);
        let offset = a.votes - a.voters.len() as i64;
        for (user, dir) in [(4, VoteDirection::Up), (2, VoteDirection::Down), (4, VoteDirection::Up), (5, VoteDirection::Down), (3, VoteDirection::Down)] {
            let _ = apply_vote(&mut a, user, dir);
            assert_eq!(a.votes - a.voters.len() as i64, offset);
        }
    }

    #[test]
    fn viewer_state_flags() {
        let a = answer(1, 1, &[2]);
        assert_eq!(ViewerVote::of(&a, 1).can_vote(), 0);
        assert_eq!(ViewerVote::of(&a, 2), ViewerVote::Voted);
        assert_eq!(ViewerVote::of(&a, 3).can_vote(), 1);
    }

    #[test]
    fn voter_set_serializes_as_list() {
        let s: VoterSet = vec![3, 1, 2].into();
        assert_eq!(serde_json::to_string(&s).unwrap(), "[1,2,3]");
    }
}
