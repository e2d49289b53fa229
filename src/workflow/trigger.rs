//! `on:` trigger filters and event matching.

use std::collections::BTreeMap;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::errors::GraphError;
use crate::models::TriggerEvent;

use super::doc::scalar_string;

const DEFAULT_PR_TYPES: &[&str] = &["opened", "synchronize", "reopened"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub branches: Vec<String>,
    pub branches_ignore: Vec<String>,
    pub tags: Vec<String>,
    pub tags_ignore: Vec<String>,
    pub paths: Vec<String>,
    pub paths_ignore: Vec<String>,
    pub types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchInput {
    pub description: Option<String>,
    pub required: bool,
    pub default: Option<String>,
}

/// Parsed `on:` section of a workflow.
#[derive(Debug, Clone, Default)]
pub struct Triggers {
    pub events: BTreeMap<String, EventFilter>,
    /// Cron specs from `on.schedule[].cron`.
    pub schedules: Vec<String>,
    pub dispatch_inputs: BTreeMap<String, DispatchInput>,
}

/// What the dispatcher knows about an incoming event.
#[derive(Debug, Clone)]
pub struct EventContext<'a> {
    pub event: &'a TriggerEvent,
    /// Full ref (`refs/heads/main`, `refs/tags/v1`). For pull requests this
    /// is the base branch ref.
    pub ref_name: &'a str,
    pub action: Option<&'a str>,
    /// `None` when the file list is unknown; path filters then pass.
    pub changed_files: Option<&'a [String]>,
}

impl Triggers {
    pub fn from_value(on: &Value) -> Result<Self, GraphError> {
        let mut triggers = Triggers::default();
        match on {
            Value::String(event) => {
                triggers.events.insert(event.clone(), EventFilter::default());
            }
            Value::Sequence(events) => {
                for event in events {
                    triggers
                        .events
                        .insert(scalar_string(event), EventFilter::default());
                }
            }
            Value::Mapping(map) => {
                for (key, value) in map {
                    let event = scalar_string(key);
                    match event.as_str() {
                        "schedule" => triggers.schedules = parse_schedules(value)?,
                        "workflow_dispatch" => {
                            triggers.dispatch_inputs = parse_inputs(value);
                        }
                        _ => {}
                    }
                    triggers.events.insert(event, parse_filter(value));
                }
            }
            Value::Null => {}
            other => {
                return Err(GraphError::Parse(format!("unsupported `on` value: {:?}", other)));
            }
        }
        Ok(triggers)
    }

    pub fn has_event(&self, event: &TriggerEvent) -> bool {
        self.events.contains_key(event.as_str())
    }

    /// Whether this workflow should run for `ctx`.
    pub fn matches(&self, ctx: &EventContext<'_>) -> bool {
        let Some(filter) = self.events.get(ctx.event.as_str()) else {
            return false;
        };
        match ctx.event {
            TriggerEvent::Push => filter.matches_push(ctx),
            TriggerEvent::PullRequest | TriggerEvent::PullRequestTarget => {
                filter.matches_pull_request(ctx)
            }
            TriggerEvent::Schedule => !self.schedules.is_empty(),
            TriggerEvent::WorkflowDispatch => true,
            _ => filter.matches_types(ctx.action, &[]),
        }
    }
}

impl EventFilter {
    fn matches_push(&self, ctx: &EventContext<'_>) -> bool {
        if let Some(tag) = ctx.ref_name.strip_prefix("refs/tags/") {
            if self.tags.is_empty() && self.tags_ignore.is_empty() {
                // Branch-only filters never fire for tags.
                if !self.branches.is_empty() || !self.branches_ignore.is_empty() {
                    return false;
                }
            } else if !include_exclude(tag, &self.tags, &self.tags_ignore) {
                return false;
            }
            // Path filters don't apply to tag pushes.
            return true;
        }

        let branch = ctx
            .ref_name
            .strip_prefix("refs/heads/")
            .unwrap_or(ctx.ref_name);
        if self.branches.is_empty() && self.branches_ignore.is_empty() {
            if !self.tags.is_empty() || !self.tags_ignore.is_empty() {
                return false;
            }
        } else if !include_exclude(branch, &self.branches, &self.branches_ignore) {
            return false;
        }
        self.matches_paths(ctx.changed_files)
    }

    fn matches_pull_request(&self, ctx: &EventContext<'_>) -> bool {
        if !self.matches_types(ctx.action, DEFAULT_PR_TYPES) {
            return false;
        }
        let base = ctx
            .ref_name
            .strip_prefix("refs/heads/")
            .unwrap_or(ctx.ref_name);
        if !include_exclude(base, &self.branches, &self.branches_ignore) {
            return false;
        }
        self.matches_paths(ctx.changed_files)
    }

    fn matches_types(&self, action: Option<&str>, defaults: &[&str]) -> bool {
        let Some(action) = action else {
            return true;
        };
        if self.types.is_empty() {
            return defaults.is_empty() || defaults.contains(&action);
        }
        self.types.iter().any(|t| t == action)
    }

    fn matches_paths(&self, changed: Option<&[String]>) -> bool {
        let Some(files) = changed else {
            return true;
        };
        if !self.paths.is_empty() && !files.iter().any(|f| pattern_list_matches(&self.paths, f)) {
            return false;
        }
        if !self.paths_ignore.is_empty()
            && !files.is_empty()
            && files.iter().all(|f| pattern_list_matches(&self.paths_ignore, f))
        {
            return false;
        }
        true
    }
}

fn include_exclude(name: &str, include: &[String], exclude: &[String]) -> bool {
    if !include.is_empty() && !pattern_list_matches(include, name) {
        return false;
    }
    if !exclude.is_empty() && pattern_list_matches(exclude, name) {
        return false;
    }
    true
}

/// Evaluate a pattern list in order; `!pattern` entries negate, last match
/// wins.
pub fn pattern_list_matches(patterns: &[String], name: &str) -> bool {
    let mut matched = false;
    for pattern in patterns {
        match pattern.strip_prefix('!') {
            Some(negated) if glob_matches(negated, name) => matched = false,
            Some(_) => {}
            None if glob_matches(pattern, name) => matched = true,
            None => {}
        }
    }
    matched
}

fn glob_matches(pattern: &str, name: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    match Pattern::new(pattern) {
        Ok(p) => p.matches_with(name, options),
        Err(_) => pattern == name,
    }
}

fn parse_filter(value: &Value) -> EventFilter {
    let Value::Mapping(map) = value else {
        return EventFilter::default();
    };
    let list = |key: &str| -> Vec<String> {
        match map.get(key) {
            Some(Value::Sequence(items)) => items.iter().map(scalar_string).collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(v) => vec![scalar_string(v)],
        }
    };
    EventFilter {
        branches: list("branches"),
        branches_ignore: list("branches-ignore"),
        tags: list("tags"),
        tags_ignore: list("tags-ignore"),
        paths: list("paths"),
        paths_ignore: list("paths-ignore"),
        types: list("types"),
    }
}

fn parse_schedules(value: &Value) -> Result<Vec<String>, GraphError> {
    let Value::Sequence(entries) = value else {
        return Err(GraphError::Parse(
            "on.schedule must be a list of {cron: ...}".to_string(),
        ));
    };
    let mut specs = Vec::new();
    for entry in entries {
        match entry.get("cron") {
            Some(cron) => specs.push(scalar_string(cron)),
            None => {
                return Err(GraphError::Parse(
                    "on.schedule entry without cron".to_string(),
                ));
            }
        }
    }
    Ok(specs)
}

fn parse_inputs(value: &Value) -> BTreeMap<String, DispatchInput> {
    let mut inputs = BTreeMap::new();
    let Some(Value::Mapping(map)) = value.get("inputs") else {
        return inputs;
    };
    for (name, spec) in map {
        inputs.insert(
            scalar_string(name),
            DispatchInput {
                description: spec.get("description").map(scalar_string),
                required: spec.get("required").and_then(Value::as_bool).unwrap_or(false),
                default: spec.get("default").map(scalar_string),
            },
        );
    }
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triggers(yaml: &str) -> Triggers {
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        Triggers::from_value(&value).unwrap()
    }

    fn push<'a>(
        event: &'a TriggerEvent,
        ref_name: &'a str,
        files: Option<&'a [String]>,
    ) -> EventContext<'a> {
        EventContext {
            event,
            ref_name,
            action: None,
            changed_files: files,
        }
    }

    #[test]
    fn string_and_list_forms() {
        assert!(triggers("push").has_event(&TriggerEvent::Push));
        let t = triggers("[push, pull_request]");
        assert!(t.has_event(&TriggerEvent::PullRequest));
        assert!(!t.has_event(&TriggerEvent::Schedule));
    }

    #[test]
    fn branch_filters() {
        let t = triggers("push:\n  branches: [main, 'release/**']\n");
        let ev = TriggerEvent::Push;
        assert!(t.matches(&push(&ev, "refs/heads/main", None)));
        assert!(t.matches(&push(&ev, "refs/heads/release/v1/hotfix", None)));
        assert!(!t.matches(&push(&ev, "refs/heads/feature", None)));
        assert!(!t.matches(&push(&ev, "refs/tags/v1.0", None)));
    }

    #[test]
    fn branches_ignore_and_negation() {
        let t = triggers("push:\n  branches: ['feature/*', '!feature/wip']\n");
        let ev = TriggerEvent::Push;
        assert!(t.matches(&push(&ev, "refs/heads/feature/login", None)));
        assert!(!t.matches(&push(&ev, "refs/heads/feature/wip", None)));

        let t = triggers("push:\n  branches-ignore: ['dependabot/**']\n");
        assert!(!t.matches(&push(&ev, "refs/heads/dependabot/npm/x", None)));
        assert!(t.matches(&push(&ev, "refs/heads/main", None)));
    }

    #[test]
    fn tag_filters() {
        let t = triggers("push:\n  tags: ['v*']\n");
        let ev = TriggerEvent::Push;
        assert!(t.matches(&push(&ev, "refs/tags/v2", None)));
        assert!(!t.matches(&push(&ev, "refs/tags/nightly", None)));
        assert!(!t.matches(&push(&ev, "refs/heads/main", None)));
    }

    #[test]
    fn path_filters() {
        let t = triggers("push:\n  paths: ['src/**']\n  paths-ignore: ['**/*.md']\n");
        let ev = TriggerEvent::Push;
        let code = vec!["src/main.rs".to_string()];
        let docs = vec!["README.md".to_string()];
        assert!(t.matches(&push(&ev, "refs/heads/main", Some(&code))));
        assert!(!t.matches(&push(&ev, "refs/heads/main", Some(&docs))));

        let t = triggers("push:\n  paths-ignore: ['docs/**']\n");
        let only_docs = vec!["docs/a.md".to_string(), "docs/b.md".to_string()];
        let mixed = vec!["docs/a.md".to_string(), "src/lib.rs".to_string()];
        assert!(!t.matches(&push(&ev, "refs/heads/main", Some(&only_docs))));
        assert!(t.matches(&push(&ev, "refs/heads/main", Some(&mixed))));
    }

    #[test]
    fn pull_request_types() {
        let t = triggers("pull_request:\n  branches: [main]\n");
        let ev = TriggerEvent::PullRequest;
        let ctx = |action| EventContext {
            event: &ev,
            ref_name: "refs/heads/main",
            action: Some(action),
            changed_files: None,
        };
        assert!(t.matches(&ctx("opened")));
        assert!(t.matches(&ctx("synchronize")));
        assert!(!t.matches(&ctx("closed")));

        let t = triggers("pull_request:\n  types: [closed]\n");
        assert!(t.matches(&ctx("closed")));
        assert!(!t.matches(&ctx("opened")));
    }

    #[test]
    fn schedule_and_dispatch() {
        let t = triggers(
            "schedule:\n  - cron: '*/5 * * * *'\n  - cron: '@daily'\nworkflow_dispatch:\n  inputs:\n    level:\n      required: true\n      default: info\n",
        );
        assert_eq!(t.schedules, vec!["*/5 * * * *", "@daily"]);
        let input = t.dispatch_inputs.get("level").unwrap();
        assert!(input.required);
        assert_eq!(input.default.as_deref(), Some("info"));
        assert!(t.has_event(&TriggerEvent::WorkflowDispatch));
    }
}
