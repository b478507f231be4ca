//! Typed status conditions and the operations for keeping a condition list consistent.
//!
//! A condition list is keyed by [`Condition::type_`]: it holds at most one entry per type,
//! and [`Conditions::set`] replaces an existing entry in place so the list keeps the order
//! in which each type was first inserted.
use crate::metadata::Time;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition type reporting that the resource has converged.
pub const READY: &str = "Ready";
/// Condition type reporting a permanent configuration problem.
pub const DEGRADED: &str = "Degraded";

/// Tri-state value of a [`Condition`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// The controller cannot tell (yet)
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        })
    }
}

impl From<bool> for ConditionStatus {
    fn from(b: bool) -> Self {
        if b {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// One aspect of the observed state of a resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition in CamelCase, e.g. `Ready`
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition
    pub status: ConditionStatus,
    /// Machine-readable CamelCase reason for the last transition
    pub reason: String,
    /// Human-readable details about the last transition
    #[serde(default)]
    pub message: String,
    /// The generation of the resource the condition was computed from
    #[serde(default)]
    pub observed_generation: i64,
    /// Last time the status of the condition changed
    pub last_transition_time: Time,
}

impl Condition {
    /// Build a condition stamped with the current time
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: i64,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation,
            last_transition_time: Utc::now(),
        }
    }

    /// Whether the condition was computed from `generation`
    pub fn is_current(&self, generation: i64) -> bool {
        self.observed_generation == generation
    }

    /// Equality ignoring `last_transition_time`
    pub fn same_as(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Operations on a keyed condition list.
pub trait Conditions {
    /// Set `condition`, replacing any existing entry of the same type in place
    ///
    /// When the status is unchanged the existing `last_transition_time` is kept.
    /// Returns `true` if anything other than the transition time changed.
    fn set(&mut self, condition: Condition) -> bool;
    /// Find the condition of type `type_`
    fn find(&self, type_: &str) -> Option<&Condition>;
    /// Remove the condition of type `type_`, returning whether it existed
    ///
    /// Named apart from `Vec::remove`, which would otherwise shadow it.
    fn remove_type(&mut self, type_: &str) -> bool;
    /// Whether the condition of type `type_` is present and `True`
    fn is_true(&self, type_: &str) -> bool {
        self.find(type_).is_some_and(|c| c.status == ConditionStatus::True)
    }
    /// Whether the condition of type `type_` is present and `False`
    fn is_false(&self, type_: &str) -> bool {
        self.find(type_).is_some_and(|c| c.status == ConditionStatus::False)
    }
    /// Whether the condition of type `type_` is absent or `Unknown`
    fn is_unknown(&self, type_: &str) -> bool {
        self.find(type_).is_none_or(|c| c.status == ConditionStatus::Unknown)
    }
}

impl Conditions for Vec<Condition> {
    fn set(&mut self, mut condition: Condition) -> bool {
        match self.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                let changed = !existing.same_as(&condition);
                *existing = condition;
                changed
            }
            None => {
                self.push(condition);
                true
            }
        }
    }

    fn find(&self, type_: &str) -> Option<&Condition> {
        self.iter().find(|c| c.type_ == type_)
    }

    fn remove_type(&mut self, type_: &str) -> bool {
        let before = self.len();
        self.retain(|c| c.type_ != type_);
        self.len() != before
    }
}

/// A status object that carries conditions and the generation they were computed from.
pub trait ObservedStatus: Default {
    /// The condition list
    fn conditions(&self) -> &Vec<Condition>;
    /// Mutable access to the condition list
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    /// The generation this status was last written for
    fn observed_generation(&self) -> Option<i64>;
    /// Record the generation this status is written for
    fn set_observed_generation(&mut self, generation: Option<i64>);
}
