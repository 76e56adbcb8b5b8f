use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, ErrorKind};

/// Version of the persisted route document. Bump on any incompatible change.
pub const ROUTE_SCHEMA_VERSION: u32 = 1;

/// The closed set of UI actions a route step can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Click,
    Type,
    Upload,
    Navigate,
    Wait,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::Click => "click",
            ActionType::Type => "type",
            ActionType::Upload => "upload",
            ActionType::Navigate => "navigate",
            ActionType::Wait => "wait",
        };
        f.write_str(s)
    }
}

/// Viewport coordinates, used when an element has no stable selector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// A single atomic step performed against the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Click {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coordinates: Option<Point>,
    },
    Type {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coordinates: Option<Point>,
        text: String,
    },
    Upload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coordinates: Option<Point>,
        path: String,
    },
    Navigate {
        url: String,
    },
    Wait {
        ms: u64,
    },
}

impl Action {
    pub fn action_type(&self) -> ActionType {
        match self {
            Action::Click { .. } => ActionType::Click,
            Action::Type { .. } => ActionType::Type,
            Action::Upload { .. } => ActionType::Upload,
            Action::Navigate { .. } => ActionType::Navigate,
            Action::Wait { .. } => ActionType::Wait,
        }
    }

    pub fn selector(&self) -> Option<&str> {
        match self {
            Action::Click { selector, .. }
            | Action::Type { selector, .. }
            | Action::Upload { selector, .. } => selector.as_deref(),
            Action::Navigate { .. } | Action::Wait { .. } => None,
        }
    }

    pub fn coordinates(&self) -> Option<Point> {
        match self {
            Action::Click { coordinates, .. }
            | Action::Type { coordinates, .. }
            | Action::Upload { coordinates, .. } => *coordinates,
            Action::Navigate { .. } | Action::Wait { .. } => None,
        }
    }

    /// The literal payload of the action: typed text, file path, URL or
    /// wait duration. Clicks carry an empty literal.
    pub fn literal(&self) -> String {
        match self {
            Action::Click { .. } => String::new(),
            Action::Type { text, .. } => text.clone(),
            Action::Upload { path, .. } => path.clone(),
            Action::Navigate { url } => url.clone(),
            Action::Wait { ms } => ms.to_string(),
        }
    }

    /// Rebuild an action from its stored parts. Inverse of `action_type`,
    /// `selector`, `coordinates` and `literal`.
    pub fn assemble(
        action_type: ActionType,
        selector: Option<String>,
        coordinates: Option<Point>,
        value: &str,
    ) -> Result<Action, String> {
        let action = match action_type {
            ActionType::Click => Action::Click {
                selector,
                coordinates,
            },
            ActionType::Type => Action::Type {
                selector,
                coordinates,
                text: value.to_string(),
            },
            ActionType::Upload => Action::Upload {
                selector,
                coordinates,
                path: value.to_string(),
            },
            ActionType::Navigate => Action::Navigate {
                url: value.to_string(),
            },
            ActionType::Wait => Action::Wait {
                ms: value
                    .trim()
                    .parse()
                    .map_err(|_| format!("wait duration '{}' is not a number of ms", value))?,
            },
        };
        Ok(action)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match (self.selector(), self.coordinates()) {
            (Some(sel), _) => sel.to_string(),
            (None, Some(p)) => format!("({}, {})", p.x, p.y),
            (None, None) => String::new(),
        };
        match self {
            Action::Click { .. } => write!(f, "click {}", target),
            Action::Type { text, .. } => {
                let preview: String = text.chars().take(30).collect();
                write!(f, "type {} \"{}\"", target, preview)
            }
            Action::Upload { path, .. } => write!(f, "upload {} {}", target, path),
            Action::Navigate { url } => write!(f, "navigate {}", url),
            Action::Wait { ms } => write!(f, "wait {}ms", ms),
        }
    }
}

/// Either a literal value or a named placeholder bound from task variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    Value(String),
    TemplateVar(String),
}

impl Binding {
    /// Resolve against the task variables. The error carries the name of
    /// the unbound variable.
    pub fn resolve<'a>(&'a self, variables: &'a BTreeMap<String, String>) -> Result<&'a str, &'a str> {
        match self {
            Binding::Value(v) => Ok(v.as_str()),
            Binding::TemplateVar(name) => variables
                .get(name)
                .map(String::as_str)
                .ok_or(name.as_str()),
        }
    }

    pub fn template_var(&self) -> Option<&str> {
        match self {
            Binding::TemplateVar(name) => Some(name),
            Binding::Value(_) => None,
        }
    }
}

/// A resolved, literal predicate over the observed UI state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "arg", rename_all = "snake_case")]
pub enum Check {
    UrlContains(String),
    TitleContains(String),
    ElementPresent(String),
    TextPresent(String),
    ActionSucceeded,
}

impl Check {
    /// Evaluate against a captured state. `None` means the check needs the
    /// live page (selector lookup) and cannot be decided from a snapshot.
    pub fn evaluate(&self, state: &ObservedState) -> Option<bool> {
        match self {
            Check::UrlContains(s) => Some(state.url.contains(s.as_str())),
            Check::TitleContains(s) => Some(state.title.contains(s.as_str())),
            Check::TextPresent(s) => Some(state.dom_snapshot.contains(s.as_str())),
            Check::ActionSucceeded => Some(true),
            Check::ElementPresent(_) => None,
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::UrlContains(s) => write!(f, "url contains '{}'", s),
            Check::TitleContains(s) => write!(f, "title contains '{}'", s),
            Check::ElementPresent(s) => write!(f, "element '{}' present", s),
            Check::TextPresent(s) => write!(f, "text '{}' visible", s),
            Check::ActionSucceeded => f.write_str("action succeeded"),
        }
    }
}

/// The persisted, possibly templated form of a [`Check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "arg", rename_all = "snake_case")]
pub enum VerifyCondition {
    UrlContains(Binding),
    TitleContains(String),
    ElementPresent(String),
    TextPresent(Binding),
    ActionSucceeded,
}

impl VerifyCondition {
    pub fn resolve<'a>(&'a self, variables: &'a BTreeMap<String, String>) -> Result<Check, &'a str> {
        Ok(match self {
            VerifyCondition::UrlContains(b) => Check::UrlContains(b.resolve(variables)?.to_string()),
            VerifyCondition::TitleContains(s) => Check::TitleContains(s.clone()),
            VerifyCondition::ElementPresent(s) => Check::ElementPresent(s.clone()),
            VerifyCondition::TextPresent(b) => Check::TextPresent(b.resolve(variables)?.to_string()),
            VerifyCondition::ActionSucceeded => Check::ActionSucceeded,
        })
    }

    pub fn template_var(&self) -> Option<&str> {
        match self {
            VerifyCondition::UrlContains(b) | VerifyCondition::TextPresent(b) => b.template_var(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStep {
    pub name: String,
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Point>,
    #[serde(flatten)]
    pub binding: Binding,
    #[serde(default)]
    pub post_wait_ms: u64,
    pub verify: VerifyCondition,
}

impl RouteStep {
    /// Bind the step's value and verify condition. Nothing is executed here,
    /// so an unbound variable is reported before any side effect.
    pub fn resolve(
        &self,
        index: usize,
        variables: &BTreeMap<String, String>,
    ) -> Result<(Action, Check), AgentError> {
        let unbound = |var: &str| AgentError::UnboundVariable {
            index,
            step: self.name.clone(),
            var: var.to_string(),
        };
        let value = self.binding.resolve(variables).map_err(unbound)?;
        let check = self.verify.resolve(variables).map_err(unbound)?;
        let action = Action::assemble(
            self.action_type,
            self.selector.clone(),
            self.coordinates,
            value,
        )
        .map_err(|reason| AgentError::InvalidStep {
            index,
            step: self.name.clone(),
            reason,
        })?;
        Ok((action, check))
    }
}

/// A compiled, parameterised action sequence for one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub workflow_id: String,
    pub schema_version: u32,
    pub last_compiled_at: DateTime<Utc>,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
    pub steps: Vec<RouteStep>,
}

impl Route {
    pub fn is_replay_eligible(&self, failure_threshold: u32) -> bool {
        self.failure_count < failure_threshold
    }

    /// Every variable name the route needs bound at replay time.
    pub fn template_vars(&self) -> BTreeSet<&str> {
        self.steps
            .iter()
            .flat_map(|s| [s.binding.template_var(), s.verify.template_var()])
            .flatten()
            .collect()
    }
}

/// A caller-submitted task instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub workflow_id: String,
    pub goal: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl Task {
    pub fn new(workflow_id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            goal: goal.into(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// The goal as handed to decision providers, with the input values the
    /// workflow has to enter.
    pub fn describe(&self) -> String {
        if self.variables.is_empty() {
            return self.goal.clone();
        }
        let mut out = format!("{}\n\nInputs:", self.goal);
        for (name, value) in &self.variables {
            out.push_str(&format!("\n- {}: {}", name, value));
        }
        out
    }
}

/// What the agent observes after executing an action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    pub url: String,
    pub title: String,
    pub dom_snapshot: String,
    /// Base64 JPEG for vision providers. Never used for verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ActionResult {
    pub success: bool,
    pub state: ObservedState,
    pub error: Option<String>,
}

/// A provider's suggestion for the next action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProposal {
    pub name: String,
    pub action: Action,
    #[serde(default)]
    pub post_wait_ms: u64,
    /// What the provider expects to hold once the action is done.
    #[serde(default)]
    pub expect: Option<Check>,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Act(ActionProposal),
    GoalSatisfied { summary: String },
    GoalFailed { reason: String },
}

/// One executed exploration action, as fed back to providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: usize,
    pub action: Action,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub name: String,
    pub action: Action,
    pub post_wait_ms: u64,
    /// The success signal captured right after the action.
    pub signal: Check,
}

/// Successful actions of one exploration, in order. Run-local.
#[derive(Debug, Clone, Default)]
pub struct ExplorationTrace {
    entries: Vec<TraceEntry>,
}

impl ExplorationTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Replaying,
    Exploring,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Replay,
    Explore,
    Mixed,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::Replay => "replay",
            RunMode::Explore => "explore",
            RunMode::Mixed => "mixed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    pub index: usize,
    pub name: String,
}

/// Why a run failed, and where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub mode: RunMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepRef>,
}

impl RunFailure {
    pub fn new(err: &AgentError, mode: RunMode) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            mode,
            step: err.step(),
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(s) => write!(f, "[{}] step {} ({}): {}", self.mode, s.index, s.name, self.message),
            None => write!(f, "[{}] {}", self.mode, self.message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub mode: RunMode,
    pub steps_executed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
}

impl RunReport {
    pub fn completed(mode: RunMode, steps_executed: usize) -> Self {
        Self {
            status: RunStatus::Completed,
            mode,
            steps_executed,
            error: None,
        }
    }

    pub fn failed(mode: RunMode, steps_executed: usize, err: &AgentError) -> Self {
        Self::failed_at(mode, steps_executed, err, None)
    }

    /// Like `failed`, with a fallback location for errors that do not name
    /// a route step themselves (exploration failures).
    pub fn failed_at(
        mode: RunMode,
        steps_executed: usize,
        err: &AgentError,
        at: Option<StepRef>,
    ) -> Self {
        let mut failure = RunFailure::new(err, mode);
        if failure.step.is_none() {
            failure.step = at;
        }
        Self {
            status: RunStatus::Failed,
            mode,
            steps_executed,
            error: Some(failure),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<String, String> {
        BTreeMap::from([("title".to_string(), "Hello".to_string())])
    }

    #[test]
    fn route_step_json_has_value_or_template_var() {
        let step = RouteStep {
            name: "title".into(),
            action_type: ActionType::Type,
            selector: Some("#title".into()),
            coordinates: None,
            binding: Binding::TemplateVar("title".into()),
            post_wait_ms: 0,
            verify: VerifyCondition::TextPresent(Binding::TemplateVar("title".into())),
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["template_var"], "title");
        assert!(json.get("value").is_none());

        let back: RouteStep = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn resolve_substitutes_template_vars() {
        let step = RouteStep {
            name: "title".into(),
            action_type: ActionType::Type,
            selector: Some("#title".into()),
            coordinates: None,
            binding: Binding::TemplateVar("title".into()),
            post_wait_ms: 0,
            verify: VerifyCondition::TextPresent(Binding::TemplateVar("title".into())),
        };
        let (action, check) = step.resolve(0, &vars()).unwrap();
        assert_eq!(
            action,
            Action::Type {
                selector: Some("#title".into()),
                coordinates: None,
                text: "Hello".into()
            }
        );
        assert_eq!(check, Check::TextPresent("Hello".into()));
    }

    #[test]
    fn resolve_reports_unbound_variable() {
        let step = RouteStep {
            name: "body".into(),
            action_type: ActionType::Type,
            selector: None,
            coordinates: None,
            binding: Binding::TemplateVar("body".into()),
            post_wait_ms: 0,
            verify: VerifyCondition::ActionSucceeded,
        };
        let err = step.resolve(4, &vars()).unwrap_err();
        assert!(matches!(
            err,
            AgentError::UnboundVariable { index: 4, ref var, .. } if var == "body"
        ));
    }

    #[test]
    fn wait_step_rejects_non_numeric_duration() {
        let err = Action::assemble(ActionType::Wait, None, None, "soon").unwrap_err();
        assert!(err.contains("soon"));
        let ok = Action::assemble(ActionType::Wait, None, None, "250").unwrap();
        assert_eq!(ok, Action::Wait { ms: 250 });
    }

    #[test]
    fn check_evaluates_against_snapshot() {
        let state = ObservedState {
            url: "https://blog.example.com/PostView?logNo=1".into(),
            title: "My Blog".into(),
            dom_snapshot: "[e0] button \"Publish\"".into(),
            screenshot: None,
        };
        assert_eq!(Check::UrlContains("PostView".into()).evaluate(&state), Some(true));
        assert_eq!(Check::TextPresent("Draft".into()).evaluate(&state), Some(false));
        assert_eq!(Check::ElementPresent("#x".into()).evaluate(&state), None);
    }

    #[test]
    fn template_vars_cover_bindings_and_checks() {
        let step = |var: &str, check: &str| RouteStep {
            name: var.into(),
            action_type: ActionType::Type,
            selector: Some(format!("#{var}")),
            coordinates: None,
            binding: Binding::TemplateVar(var.into()),
            post_wait_ms: 0,
            verify: VerifyCondition::UrlContains(Binding::TemplateVar(check.into())),
        };
        let route = Route {
            workflow_id: "w".into(),
            schema_version: ROUTE_SCHEMA_VERSION,
            last_compiled_at: Utc::now(),
            success_count: 0,
            failure_count: 0,
            steps: vec![step("title", "blog_url"), step("body", "title")],
        };
        assert_eq!(
            route.template_vars().into_iter().collect::<Vec<_>>(),
            ["blog_url", "body", "title"]
        );
    }
}
