//! Allocation decision values
//!
//! A single decider produces a `Decision`; a set of deciders produces
//! `Decisions`, which folds to one outcome: any NO wins, otherwise any
//! THROTTLE, otherwise YES.

use serde::{Deserialize, Serialize};

/// Decision outcome, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    Yes,
    Throttle,
    No,
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionKind::Yes => write!(f, "YES"),
            DecisionKind::Throttle => write!(f, "THROTTLE"),
            DecisionKind::No => write!(f, "NO"),
        }
    }
}

/// Verdict of one decider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub kind: DecisionKind,
    /// Name of the decider that produced it
    pub label: String,
    pub explanation: String,
}

impl Decision {
    pub fn new(kind: DecisionKind, label: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            explanation: explanation.into(),
        }
    }

    pub fn yes(label: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self::new(DecisionKind::Yes, label, explanation)
    }

    pub fn no(label: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self::new(DecisionKind::No, label, explanation)
    }

    pub fn throttle(label: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self::new(DecisionKind::Throttle, label, explanation)
    }

    pub fn is_yes(&self) -> bool {
        self.kind == DecisionKind::Yes
    }

    pub fn is_no(&self) -> bool {
        self.kind == DecisionKind::No
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}): {}", self.kind, self.label, self.explanation)
    }
}

/// Verdicts of every decider for one (shard, node) question
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decisions {
    decisions: Vec<Decision>,
}

impl Decisions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(decision: Decision) -> Self {
        Self {
            decisions: vec![decision],
        }
    }

    pub fn push(&mut self, decision: Decision) {
        self.decisions.push(decision);
    }

    /// Folded outcome; an empty set is YES
    pub fn kind(&self) -> DecisionKind {
        self.decisions
            .iter()
            .map(|d| d.kind)
            .max()
            .unwrap_or(DecisionKind::Yes)
    }

    pub fn is_yes(&self) -> bool {
        self.kind() == DecisionKind::Yes
    }

    pub fn is_no(&self) -> bool {
        self.kind() == DecisionKind::No
    }

    /// First decision of the folded kind, the one surfaced to operators
    pub fn representative(&self) -> Decision {
        let kind = self.kind();
        self.decisions
            .iter()
            .find(|d| d.kind == kind)
            .cloned()
            .unwrap_or_else(|| Decision::yes("all", "all deciders allow"))
    }

    /// Every retained decision, in evaluation order
    pub fn all(&self) -> &[Decision] {
        &self.decisions
    }

    /// Decisions of one kind, in evaluation order
    pub fn of_kind(&self, kind: DecisionKind) -> impl Iterator<Item = &Decision> {
        self.decisions.iter().filter(move |d| d.kind == kind)
    }
}

impl std::fmt::Display for Decisions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind())?;
        for d in self.of_kind(DecisionKind::No).chain(self.of_kind(DecisionKind::Throttle)) {
            write!(f, "; {}", d)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_wins_over_throttle() {
        let mut decisions = Decisions::new();
        decisions.push(Decision::yes("a", "ok"));
        decisions.push(Decision::throttle("b", "busy"));
        decisions.push(Decision::no("c", "first no"));
        decisions.push(Decision::no("d", "second no"));

        assert_eq!(decisions.kind(), DecisionKind::No);
        assert_eq!(decisions.representative().label, "c");
        assert_eq!(decisions.all().len(), 4);
    }

    #[test]
    fn test_throttle_without_no() {
        let mut decisions = Decisions::new();
        decisions.push(Decision::yes("a", "ok"));
        decisions.push(Decision::throttle("b", "busy"));
        assert_eq!(decisions.kind(), DecisionKind::Throttle);
        assert_eq!(decisions.representative().label, "b");
    }

    #[test]
    fn test_empty_is_yes() {
        let decisions = Decisions::new();
        assert!(decisions.is_yes());
        assert!(decisions.representative().is_yes());
    }
}
