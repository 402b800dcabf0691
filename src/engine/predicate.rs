// Variable predicates used by the query layer

//! # Variable Predicates
//!
//! A [`VariableCondition`] names a variable and a [`VariablePredicate`] to
//! test against the slot the scoped lookup finds for it. Predicates work on
//! declared types only; nothing is coerced.
//!
//! ## Absent vs. typed null
//!
//! | Predicate | absent slot | slot holding null |
//! |---|---|---|
//! | `Equals(Null)` | match | match |
//! | `IsNullValue` | no match | match |
//! | `NotEquals(v)` | no match | no match |
//! | `Exists` | no match | match |
//!
//! `NotEquals(Null)` therefore selects exactly the present, non-null values.
//!
//! ## Comparison rules
//!
//! - Integer and Long form one integral family and compare numerically.
//! - Equality between incompatible declared types is simply a non-match.
//! - Ordering on Boolean, Null, Bytes or Object, ordering across incompatible
//!   types and `Like` on a non-string fail with `UnsupportedComparison`.
//! - A slot holding null (typed or untyped) never satisfies an ordering.
//! - [`find_executions`](ExecutionTree::find_executions) only fails for a bad
//!   operand; a stored value it cannot compare is a non-match for that
//!   execution.
//!
//! JSON form uses the same tagged layout as the rest of the models:
//! `{"type": "GreaterThan", "value": {"type": "integer", "value": 5}}`

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::tree::ExecutionTree;
use crate::models::{ExecutionId, TypedValue, ValueType, VariableSlot};
use crate::{ProcessEngineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VariablePredicate {
    Equals { value: TypedValue },
    NotEquals { value: TypedValue },
    GreaterThan { value: TypedValue },
    GreaterThanOrEqual { value: TypedValue },
    LessThan { value: TypedValue },
    LessThanOrEqual { value: TypedValue },
    /// SQL-style pattern: `%` matches any run, `_` one character
    Like { pattern: String },
    /// Present and holding null (typed or untyped)
    IsNullValue,
    Exists,
    NotExists,
}

impl VariablePredicate {
    pub fn name(&self) -> &'static str {
        match self {
            VariablePredicate::Equals { .. } => "equals",
            VariablePredicate::NotEquals { .. } => "notEquals",
            VariablePredicate::GreaterThan { .. } => "greaterThan",
            VariablePredicate::GreaterThanOrEqual { .. } => "greaterThanOrEqual",
            VariablePredicate::LessThan { .. } => "lessThan",
            VariablePredicate::LessThanOrEqual { .. } => "lessThanOrEqual",
            VariablePredicate::Like { .. } => "like",
            VariablePredicate::IsNullValue => "isNullValue",
            VariablePredicate::Exists => "exists",
            VariablePredicate::NotExists => "notExists",
        }
    }

    /// Reject operands no slot could ever be compared with
    pub fn validate(&self) -> Result<()> {
        match self {
            VariablePredicate::GreaterThan { value }
            | VariablePredicate::GreaterThanOrEqual { value }
            | VariablePredicate::LessThan { value }
            | VariablePredicate::LessThanOrEqual { value } => {
                let operand_type = value.value_type();
                if !operand_type.is_orderable() || value.is_null() {
                    return Err(self.unsupported(format!("cannot order by a {} operand", operand_type)));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Test a looked-up slot; `None` means the variable is absent
    pub fn matches(&self, slot: Option<&VariableSlot>) -> Result<bool> {
        match self {
            VariablePredicate::Equals { value } => Ok(match slot {
                None => value.is_null(),
                Some(slot) if value.is_null() => slot.value.is_null(),
                Some(slot) => values_equal(&slot.value, value),
            }),

            VariablePredicate::NotEquals { value } => Ok(match slot {
                None => false,
                Some(slot) if slot.value.is_null() => false,
                Some(_) if value.is_null() => true,
                Some(slot) => {
                    slot.value_type.is_compatible_with(&value.value_type())
                        && !values_equal(&slot.value, value)
                }
            }),

            VariablePredicate::GreaterThan { value } => {
                self.ordering(slot, value, |o| o == Ordering::Greater)
            }
            VariablePredicate::GreaterThanOrEqual { value } => {
                self.ordering(slot, value, |o| o != Ordering::Less)
            }
            VariablePredicate::LessThan { value } => {
                self.ordering(slot, value, |o| o == Ordering::Less)
            }
            VariablePredicate::LessThanOrEqual { value } => {
                self.ordering(slot, value, |o| o != Ordering::Greater)
            }

            VariablePredicate::Like { pattern } => match slot {
                None => Ok(false),
                Some(slot) => match &slot.value {
                    TypedValue::String(Some(s)) => Ok(like(s, pattern)),
                    TypedValue::String(None) => Ok(false),
                    other => Err(self.unsupported(format!(
                        "like requires a string variable, found {}",
                        other.value_type()
                    ))),
                },
            },

            VariablePredicate::IsNullValue => Ok(slot.map_or(false, |s| s.value.is_null())),
            VariablePredicate::Exists => Ok(slot.is_some()),
            VariablePredicate::NotExists => Ok(slot.is_none()),
        }
    }

    fn ordering<F>(&self, slot: Option<&VariableSlot>, operand: &TypedValue, accept: F) -> Result<bool>
    where
        F: Fn(Ordering) -> bool,
    {
        self.validate()?;
        let operand_type = operand.value_type();

        let slot = match slot {
            Some(slot) if !slot.value.is_null() => slot,
            _ => return Ok(false),
        };
        if !slot.value_type.is_orderable() || !slot.value_type.is_compatible_with(&operand_type) {
            return Err(self.unsupported(format!(
                "cannot order a {} variable against a {} operand",
                slot.value_type, operand_type
            )));
        }

        Ok(compare(&slot.value, operand).map_or(false, accept))
    }

    fn unsupported(&self, reason: String) -> ProcessEngineError {
        ProcessEngineError::UnsupportedComparison {
            predicate: self.name().to_string(),
            reason,
        }
    }
}

/// One variable test as issued by the query layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableCondition {
    pub name: String,

    pub predicate: VariablePredicate,

    /// Test only the owning scope instead of the whole scope chain
    #[serde(default)]
    pub local: bool,
}

impl VariableCondition {
    pub fn new(name: &str, predicate: VariablePredicate) -> Self {
        VariableCondition { name: name.to_string(), predicate, local: false }
    }

    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn equals(name: &str, value: impl Into<TypedValue>) -> Self {
        Self::new(name, VariablePredicate::Equals { value: value.into() })
    }

    pub fn not_equals(name: &str, value: impl Into<TypedValue>) -> Self {
        Self::new(name, VariablePredicate::NotEquals { value: value.into() })
    }

    pub fn equals_null(name: &str) -> Self {
        Self::new(name, VariablePredicate::Equals { value: TypedValue::Null })
    }

    pub fn greater_than(name: &str, value: impl Into<TypedValue>) -> Self {
        Self::new(name, VariablePredicate::GreaterThan { value: value.into() })
    }

    pub fn less_than(name: &str, value: impl Into<TypedValue>) -> Self {
        Self::new(name, VariablePredicate::LessThan { value: value.into() })
    }

    pub fn like(name: &str, pattern: &str) -> Self {
        Self::new(name, VariablePredicate::Like { pattern: pattern.to_string() })
    }
}

impl ExecutionTree {
    /// Evaluate one condition against the variables visible from `node`
    pub fn variable_matches(&self, node: &ExecutionId, condition: &VariableCondition) -> Result<bool> {
        let slot = if condition.local {
            self.get_variable_local(node, &condition.name)?
        } else {
            self.get_variable(node, &condition.name)?
        };
        condition.predicate.matches(slot)
    }

    /// Executions (ACTIVE, in creation order) for which every condition holds.
    ///
    /// A bad operand fails the query up front. A stored value whose type
    /// cannot be compared only disqualifies its own execution.
    pub fn find_executions(&self, conditions: &[VariableCondition]) -> Result<Vec<ExecutionId>> {
        for condition in conditions {
            condition.predicate.validate()?;
        }

        let mut found = Vec::new();
        for node in self.active_nodes() {
            let mut all = true;
            for condition in conditions {
                let matched = match self.variable_matches(&node.id, condition) {
                    Ok(matched) => matched,
                    Err(ProcessEngineError::UnsupportedComparison { reason, .. }) => {
                        debug!(execution = %node.id, variable = %condition.name, %reason, "stored value not comparable");
                        false
                    }
                    Err(e) => return Err(e),
                };
                if !matched {
                    all = false;
                    break;
                }
            }
            if all {
                found.push(node.id);
            }
        }
        Ok(found)
    }
}

fn values_equal(left: &TypedValue, right: &TypedValue) -> bool {
    let (lt, rt) = (left.value_type(), right.value_type());
    if !lt.is_compatible_with(&rt) {
        return false;
    }
    if lt.is_integral() {
        return left.as_i64() == right.as_i64();
    }
    left == right
}

fn compare(left: &TypedValue, right: &TypedValue) -> Option<Ordering> {
    match (left, right) {
        (TypedValue::Double(Some(a)), TypedValue::Double(Some(b))) => a.partial_cmp(b),
        (TypedValue::String(Some(a)), TypedValue::String(Some(b))) => Some(a.cmp(b)),
        (TypedValue::Date(Some(a)), TypedValue::Date(Some(b))) => Some(a.cmp(b)),
        _ if left.value_type().is_integral() => Some(left.as_i64()?.cmp(&right.as_i64()?)),
        _ => None,
    }
}

/// `%` matches any sequence, `_` exactly one character
fn like(value: &str, pattern: &str) -> bool {
    let text: Vec<char> = value.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();

    // dp[j]: pattern[..i] matches text[..j]
    let mut dp = vec![false; text.len() + 1];
    dp[0] = true;
    for p in &pat {
        let mut next = vec![false; text.len() + 1];
        match p {
            '%' => {
                let mut reachable = false;
                for j in 0..=text.len() {
                    reachable |= dp[j];
                    next[j] = reachable;
                }
            }
            _ => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1] && (*p == '_' || *p == text[j - 1]);
                }
            }
        }
        dp = next;
    }
    dp[text.len()]
}
