//! Structural and referential validation of workflow documents.
//!
//! Serde already guarantees shape; this pass enforces the cross-references
//! a run relies on: unique step keys, resolvable role/parser/step
//! references, well-formed conditions. A document that passes here cannot
//! hit an unknown-reference failure mid-run.

use std::collections::BTreeSet;

use crate::condition::Condition;
use crate::document::{Step, StepKind, Transition, WorkflowDocument};
use crate::error::WorkflowError;
use crate::scope::SCOPE_PREFIXES;

/// Validate a document, returning it unchanged on success.
pub fn validate_document(document: &WorkflowDocument) -> Result<(), WorkflowError> {
    if document.id.trim().is_empty() {
        return Err(schema("workflow id must not be empty"));
    }

    for (name, role) in &document.roles {
        if !document.parsers.contains_key(&role.parser) {
            return Err(schema(format!(
                "role '{name}' references unknown parser '{}' (known: {:?})",
                role.parser,
                document.parsers.keys().collect::<Vec<_>>()
            )));
        }
    }

    for session in &document.sessions.roles {
        if !document.roles.contains_key(&session.role) {
            return Err(schema(format!(
                "session entry references unknown role '{}'",
                session.role
            )));
        }
    }

    let round = &document.flow.round;
    if round.steps.is_empty() {
        return Err(schema("flow.round.steps must not be empty"));
    }

    let mut keys = BTreeSet::new();
    for step in &round.steps {
        if !keys.insert(step.key.as_str()) {
            return Err(schema(format!("duplicate step key '{}'", step.key)));
        }
    }

    if let Some(start) = &round.start {
        if !keys.contains(start.as_str()) {
            return Err(schema(format!(
                "flow.round.start '{start}' is not a step key"
            )));
        }
    }

    if let Some(bootstrap) = &document.flow.bootstrap {
        validate_step(document, bootstrap, &keys, "flow.bootstrap")?;
    }
    for step in &round.steps {
        validate_step(document, step, &keys, &format!("step '{}'", step.key))?;
    }

    Ok(())
}

fn validate_step(
    document: &WorkflowDocument,
    step: &Step,
    keys: &BTreeSet<&str>,
    context: &str,
) -> Result<(), WorkflowError> {
    if let StepKind::Agent { role, prompt } = &step.kind {
        if !document.roles.contains_key(role) {
            return Err(schema(format!(
                "{context} references unknown role '{role}' (known: {:?})",
                document.roles.keys().collect::<Vec<_>>()
            )));
        }
        if prompt.is_empty() {
            return Err(schema(format!("{context} has an empty prompt list")));
        }
    }

    if let StepKind::Cli {
        args, args_object, ..
    } = &step.kind
    {
        if args.is_some() && args_object.is_some() {
            return Err(schema(format!(
                "{context} sets both args and argsObject"
            )));
        }
    }

    if let Some(next) = &step.next {
        if !keys.contains(next.as_str()) {
            return Err(schema(format!("{context} next '{next}' is not a step key")));
        }
    }

    for (list, label) in [(&step.transitions, "transition"), (&step.exits, "exit")] {
        for (index, transition) in list.iter().enumerate() {
            validate_transition(transition, keys, &format!("{context} {label} #{index}"))?;
            if label == "exit" && transition.outcome.is_none() {
                return Err(schema(format!(
                    "{context} exit #{index} must declare an outcome"
                )));
            }
        }
    }

    Ok(())
}

fn validate_transition(
    transition: &Transition,
    keys: &BTreeSet<&str>,
    context: &str,
) -> Result<(), WorkflowError> {
    validate_condition(&transition.condition, context)?;
    if let Some(next) = &transition.next {
        if !keys.contains(next.as_str()) {
            return Err(schema(format!("{context} next '{next}' is not a step key")));
        }
    }
    Ok(())
}

fn validate_condition(condition: &Condition, context: &str) -> Result<(), WorkflowError> {
    match condition {
        Condition::Literal(s) => {
            if s != "always" {
                return Err(schema(format!(
                    "{context} condition literal must be \"always\", got {s:?}"
                )));
            }
        }
        Condition::All { all } => {
            for c in all {
                validate_condition(c, context)?;
            }
        }
        Condition::Any { any } => {
            for c in any {
                validate_condition(c, context)?;
            }
        }
        Condition::Not { not } => validate_condition(not, context)?,
        Condition::Leaf(leaf) => {
            let prefix = leaf.field.split('.').next().unwrap_or("");
            if !SCOPE_PREFIXES.contains(&prefix) {
                return Err(schema(format!(
                    "{context} condition field '{}' does not start with a scope prefix {SCOPE_PREFIXES:?}",
                    leaf.field
                )));
            }
            let has_comparator = leaf.equals.is_some()
                || leaf.includes.is_some()
                || leaf.is_in.is_some()
                || leaf.matches.is_some()
                || leaf.exists.is_some()
                || leaf.absent.is_some()
                || leaf.gt.is_some()
                || leaf.ge.is_some()
                || leaf.lt.is_some()
                || leaf.le.is_some();
            if !has_comparator {
                return Err(schema(format!(
                    "{context} condition on '{}' has no comparator",
                    leaf.field
                )));
            }
            if let Some(pattern) = &leaf.matches {
                regex::Regex::new(pattern).map_err(|e| {
                    schema(format!("{context} invalid matches pattern {pattern:?}: {e}"))
                })?;
            }
        }
    }
    Ok(())
}

fn schema(message: impl Into<String>) -> WorkflowError {
    WorkflowError::Schema(message.into())
}
