//! Votes and ballot selection.

use std::cmp::Ordering;

use crate::hierarchy::HierarchyPath;
use crate::object::FileObject;

/// A resource's confidence that it can service an operation, with the path that earned it.
#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    /// Score; zero means "cannot service". Leaves vote in `[0.0, 1.0]`, passthru
    /// weights may scale a vote above 1.0.
    pub score: f64,
    /// Hierarchy the score applies to.
    pub hierarchy: HierarchyPath,
}

impl Vote {
    /// Builds a leaf-range vote, clamping the score into `[0.0, 1.0]`.
    pub fn new(score: f64, hierarchy: HierarchyPath) -> Self {
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        Self { score, hierarchy }
    }

    /// A zero vote for `hierarchy`.
    pub fn zero(hierarchy: HierarchyPath) -> Self {
        Self {
            score: 0.0,
            hierarchy,
        }
    }

    /// Whether the vote is able to service the request.
    pub fn is_positive(&self) -> bool {
        self.score > 0.0
    }

    /// Multiplies the score by a weight. The result is never negative but may
    /// exceed 1.0.
    pub fn scaled(self, factor: f64) -> Self {
        let score = self.score * factor;
        let score = if score.is_nan() { 0.0 } else { score.max(0.0) };
        Self {
            score,
            hierarchy: self.hierarchy,
        }
    }

    /// The same score, earned by `hierarchy`.
    pub fn with_hierarchy(self, hierarchy: HierarchyPath) -> Self {
        Self { hierarchy, ..self }
    }
}

/// One child's answer during a fan-out, with the object view it produced.
#[derive(Debug, Clone)]
pub struct Ballot {
    /// Child that voted.
    pub child: String,
    /// The child's vote.
    pub vote: Vote,
    /// The object as the child left it.
    pub object: FileObject,
}

/// Orders ballots best first: higher score, then lexicographically smaller child name.
pub fn ballot_order(a: &Ballot, b: &Ballot) -> Ordering {
    b.vote
        .score
        .partial_cmp(&a.vote.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.child.cmp(&b.child))
}

/// Sorts ballots best first.
pub fn rank(ballots: &mut [Ballot]) {
    ballots.sort_by(ballot_order);
}

/// Removes and returns the winning ballot, or `None` when there are no ballots.
pub fn select_best(ballots: &mut Vec<Ballot>) -> Option<Ballot> {
    rank(ballots);
    if ballots.is_empty() {
        None
    } else {
        Some(ballots.remove(0))
    }
}
