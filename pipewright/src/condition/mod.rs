//! Run/skip decisions for jobs and steps.
//!
//! Conditions use a small closed grammar:
//!
//! ```text
//! expr    := or
//! or      := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | primary
//! primary := "(" expr ")" | status "()" | env_ref [("==" | "!=") string]
//!          | "true" | "false"
//! status  := "success" | "failure" | "always" | "cancelled"
//! env_ref := "env." NAME
//! ```
//!
//! `success()` holds when no job has failed, `failure()` when at least one
//! has, `always()` is always true and `cancelled()` reflects the run's
//! cancellation flag. A bare `env.NAME` is true when the variable is set,
//! non-empty and not `0` or `false`. A blank expression means `success()`.

mod parser;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::ConditionError;

/// One of the built-in status functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCheck {
    /// `success()`
    Success,
    /// `failure()`
    Failure,
    /// `always()`
    Always,
    /// `cancelled()`
    Cancelled,
}

/// String comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
}

/// A parsed condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// A status function call.
    Status(StatusCheck),
    /// `true` or `false`.
    Literal(bool),
    /// Truthiness of an environment variable.
    Env(String),
    /// Comparison of an environment variable against a literal.
    Compare {
        /// Variable name.
        var: String,
        /// Operator.
        op: CompareOp,
        /// Literal to compare against.
        value: String,
    },
    /// Negation.
    Not(Box<Condition>),
    /// Conjunction.
    And(Box<Condition>, Box<Condition>),
    /// Disjunction.
    Or(Box<Condition>, Box<Condition>),
}

/// The run state a condition is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct ConditionContext<'a> {
    /// Whether `FailedJobs` is non-empty.
    pub has_failures: bool,
    /// Whether the run has been cancelled.
    pub cancelled: bool,
    /// The resolved environment of the job or step.
    pub env: &'a BTreeMap<String, String>,
}

impl Default for Condition {
    fn default() -> Self {
        Self::Status(StatusCheck::Success)
    }
}

impl Condition {
    /// Parses an expression.
    pub fn parse(expr: &str) -> Result<Self, ConditionError> {
        parser::parse(expr)
    }

    /// Evaluates the condition.
    #[must_use]
    pub fn evaluate(&self, ctx: &ConditionContext<'_>) -> bool {
        match self {
            Self::Status(StatusCheck::Success) => !ctx.has_failures,
            Self::Status(StatusCheck::Failure) => ctx.has_failures,
            Self::Status(StatusCheck::Always) => true,
            Self::Status(StatusCheck::Cancelled) => ctx.cancelled,
            Self::Literal(value) => *value,
            Self::Env(var) => ctx.env.get(var).is_some_and(|v| is_truthy(v)),
            Self::Compare { var, op, value } => {
                let actual = ctx.env.get(var).map(String::as_str);
                match op {
                    CompareOp::Eq => actual == Some(value.as_str()),
                    CompareOp::Ne => actual != Some(value.as_str()),
                }
            }
            Self::Not(inner) => !inner.evaluate(ctx),
            Self::And(lhs, rhs) => lhs.evaluate(ctx) && rhs.evaluate(ctx),
            Self::Or(lhs, rhs) => lhs.evaluate(ctx) || rhs.evaluate(ctx),
        }
    }

    /// Returns true if the expression calls `check` anywhere.
    #[must_use]
    pub fn references(&self, check: StatusCheck) -> bool {
        match self {
            Self::Status(c) => *c == check,
            Self::Literal(_) | Self::Env(_) | Self::Compare { .. } => false,
            Self::Not(inner) => inner.references(check),
            Self::And(lhs, rhs) | Self::Or(lhs, rhs) => {
                lhs.references(check) || rhs.references(check)
            }
        }
    }

    /// Returns true if the condition opts in to running after a halting failure.
    #[must_use]
    pub fn runs_after_failure(&self) -> bool {
        self.references(StatusCheck::Always)
            || self.references(StatusCheck::Failure)
            || self.references(StatusCheck::Cancelled)
    }

    /// Returns true if the condition opts in to running after cancellation.
    #[must_use]
    pub fn runs_after_cancel(&self) -> bool {
        self.references(StatusCheck::Always) || self.references(StatusCheck::Cancelled)
    }
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(StatusCheck::Success) => write!(f, "success()"),
            Self::Status(StatusCheck::Failure) => write!(f, "failure()"),
            Self::Status(StatusCheck::Always) => write!(f, "always()"),
            Self::Status(StatusCheck::Cancelled) => write!(f, "cancelled()"),
            Self::Literal(v) => write!(f, "{v}"),
            Self::Env(var) => write!(f, "env.{var}"),
            Self::Compare { var, op, value } => {
                let op = match op {
                    CompareOp::Eq => "==",
                    CompareOp::Ne => "!=",
                };
                let quote = if value.contains('\'') { '"' } else { '\'' };
                write!(f, "env.{var} {op} {quote}{value}{quote}")
            }
            Self::Not(inner) => write!(f, "!({inner})"),
            Self::And(lhs, rhs) => write!(f, "({lhs} && {rhs})"),
            Self::Or(lhs, rhs) => write!(f, "({lhs} || {rhs})"),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false"))
}

/// Parses and evaluates `expr` in one go.
pub fn evaluate(expr: &str, ctx: &ConditionContext<'_>) -> Result<bool, ConditionError> {
    Ok(Condition::parse(expr)?.evaluate(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(
        has_failures: bool,
        cancelled: bool,
        env: &BTreeMap<String, String>,
    ) -> ConditionContext<'_> {
        ConditionContext {
            has_failures,
            cancelled,
            env,
        }
    }

    #[test]
    fn test_builtins() {
        let env = BTreeMap::new();
        let clean = ctx(false, false, &env);
        let failed = ctx(true, false, &env);
        let cancelled = ctx(false, true, &env);

        assert!(evaluate("success()", &clean).unwrap());
        assert!(!evaluate("success()", &failed).unwrap());
        assert!(evaluate("failure()", &failed).unwrap());
        assert!(!evaluate("failure()", &clean).unwrap());
        assert!(evaluate("always()", &failed).unwrap());
        assert!(evaluate("cancelled()", &cancelled).unwrap());
        assert!(!evaluate("cancelled()", &clean).unwrap());
    }

    #[test]
    fn test_blank_is_success() {
        let env = BTreeMap::new();
        assert_eq!(Condition::parse("  ").unwrap(), Condition::default());
        assert!(!evaluate("", &ctx(true, false, &env)).unwrap());
    }

    #[test]
    fn test_env_predicates() {
        let env: BTreeMap<String, String> = [
            ("DEPLOY", "1"),
            ("DRY_RUN", "false"),
            ("EMPTY", ""),
            ("BRANCH", "main"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let c = ctx(false, false, &env);

        assert!(evaluate("env.DEPLOY", &c).unwrap());
        assert!(!evaluate("env.DRY_RUN", &c).unwrap());
        assert!(!evaluate("env.EMPTY", &c).unwrap());
        assert!(!evaluate("env.MISSING", &c).unwrap());
        assert!(evaluate("env.BRANCH == 'main'", &c).unwrap());
        assert!(evaluate("env.BRANCH != 'dev'", &c).unwrap());
        assert!(evaluate("env.MISSING != 'x'", &c).unwrap());
        assert!(evaluate("success() && env.DEPLOY && !env.DRY_RUN", &c).unwrap());
    }

    #[test]
    fn test_references() {
        let cond: Condition = "always() || env.X".parse().unwrap();
        assert!(cond.references(StatusCheck::Always));
        assert!(cond.runs_after_failure());
        assert!(cond.runs_after_cancel());

        let cond: Condition = "!failure()".parse().unwrap();
        assert!(cond.runs_after_failure());
        assert!(!cond.runs_after_cancel());

        let cond = Condition::default();
        assert!(!cond.runs_after_failure());
    }

    #[test]
    fn test_display_reparses() {
        let cond: Condition = "!(failure() || env.A == 'x') && always()".parse().unwrap();
        let again: Condition = cond.to_string().parse().unwrap();
        assert_eq!(cond, again);
    }

    #[test]
    fn test_display_keeps_quotes_in_values() {
        for expr in [r#"env.MSG == "it's""#, r#"env.MSG != 'say "hi"'"#] {
            let cond: Condition = expr.parse().unwrap();
            let again: Condition = cond.to_string().parse().unwrap();
            assert_eq!(cond, again);
        }
    }
}
