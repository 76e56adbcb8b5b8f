//! In-memory page, session factory and scripted providers shared by the
//! integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use publish_agent::{
    Action, ActionExecutor, ActionProposal, ActionResult, AgentConfig, AgentError, Check, Decision,
    HistoryEntry, ObservedState, SessionFactory, VisionDecisionProvider,
};

pub const EDITOR_URL: &str = "https://blog.example/editor";

/// A tiny publishing page: a few text fields and a publish button.
#[derive(Debug, Default)]
pub struct Page {
    pub url: String,
    pub title: String,
    /// Selector -> current value. Only these selectors exist.
    pub fields: BTreeMap<String, String>,
    pub buttons: BTreeSet<String>,
    pub published: Vec<BTreeMap<String, String>>,
    /// Every action attempted, in order.
    pub log: Vec<Action>,
    /// The next action on this selector hangs instead of running.
    pub stall_once: Option<String>,
}

impl Page {
    pub fn editor() -> Self {
        Self {
            fields: ["#title", "#body", "#tags"]
                .into_iter()
                .map(|s| (s.to_string(), String::new()))
                .collect(),
            buttons: BTreeSet::from(["#publish".to_string()]),
            ..Default::default()
        }
    }

    fn apply(&mut self, action: &Action) -> Result<(), String> {
        self.log.push(action.clone());
        match action {
            Action::Navigate { url } => {
                self.url = url.clone();
                self.title = "Editor".into();
                for v in self.fields.values_mut() {
                    v.clear();
                }
            }
            Action::Type { selector, text, .. } => {
                let sel = selector.as_deref().unwrap_or_default();
                let field = self
                    .fields
                    .get_mut(sel)
                    .ok_or_else(|| format!("no element matches {sel}"))?;
                *field = text.clone();
            }
            Action::Click { selector, .. } => {
                let sel = selector.as_deref().unwrap_or_default();
                if !self.buttons.contains(sel) {
                    return Err(format!("no element matches {sel}"));
                }
                if sel == "#publish" {
                    self.published.push(self.fields.clone());
                    self.title = "Published".into();
                    // every post gets its own id
                    self.url = format!(
                        "https://blog.example/PostView?blogId=me&logNo={}",
                        1000 + self.published.len()
                    );
                }
            }
            Action::Upload { .. } | Action::Wait { .. } => {}
        }
        Ok(())
    }

    fn check(&self, check: &Check) -> bool {
        match check {
            Check::UrlContains(s) => self.url.contains(s.as_str()),
            Check::TitleContains(s) => self.title.contains(s.as_str()),
            Check::ElementPresent(s) => self.fields.contains_key(s) || self.buttons.contains(s),
            Check::TextPresent(s) => self.fields.values().any(|v| v.contains(s.as_str())),
            Check::ActionSucceeded => true,
        }
    }

    fn state(&self) -> ObservedState {
        ObservedState {
            url: self.url.clone(),
            title: self.title.clone(),
            dom_snapshot: self
                .fields
                .iter()
                .map(|(k, v)| format!("{k} input value=\"{v}\""))
                .chain(self.buttons.iter().map(|b| format!("{b} button")))
                .collect::<Vec<_>>()
                .join("\n"),
            screenshot: None,
        }
    }

    /// Text fields typed into, in order, ignoring navigation.
    pub fn typed(&self) -> Vec<(String, String)> {
        self.log
            .iter()
            .filter_map(|a| match a {
                Action::Type { selector, text, .. } => {
                    Some((selector.clone().unwrap_or_default(), text.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

pub type SharedPage = Arc<Mutex<Page>>;

pub fn shared_page() -> SharedPage {
    Arc::new(Mutex::new(Page::editor()))
}

pub struct FakeExecutor {
    page: SharedPage,
}

#[async_trait]
impl ActionExecutor for FakeExecutor {
    async fn perform(&self, action: &Action) -> ActionResult {
        let stall = {
            let mut page = self.page.lock().unwrap();
            let hit = page.stall_once.is_some() && page.stall_once.as_deref() == action.selector();
            if hit {
                page.stall_once = None;
            }
            hit
        };
        if stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let mut page = self.page.lock().unwrap();
        let outcome = page.apply(action);
        ActionResult {
            success: outcome.is_ok(),
            state: page.state(),
            error: outcome.err(),
        }
    }

    async fn verify(&self, check: &Check) -> Result<bool, AgentError> {
        Ok(self.page.lock().unwrap().check(check))
    }

    async fn observe(&self) -> Result<ObservedState, AgentError> {
        Ok(self.page.lock().unwrap().state())
    }
}

pub struct FakeSessions {
    page: SharedPage,
    /// When set, `open` waits for a notification first.
    hold: Option<Arc<Notify>>,
    pub opened: AtomicUsize,
}

impl FakeSessions {
    pub fn new(page: SharedPage) -> Self {
        Self {
            page,
            hold: None,
            opened: AtomicUsize::new(0),
        }
    }

    pub fn held(page: SharedPage, hold: Arc<Notify>) -> Self {
        Self {
            hold: Some(hold),
            ..Self::new(page)
        }
    }
}

#[async_trait]
impl SessionFactory for FakeSessions {
    async fn open(&self, _workflow_id: &str) -> Result<Arc<dyn ActionExecutor>, AgentError> {
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeExecutor {
            page: self.page.clone(),
        }))
    }
}

/// Hands out a fixed list of decisions, then reports the goal satisfied.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<Decision, AgentError>>>,
    pub calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &str, script: Vec<Decision>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into_iter().map(Ok).collect()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn with_results(name: &str, script: Vec<Result<Decision, AgentError>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionDecisionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn decide(
        &self,
        _state: &ObservedState,
        _goal: &str,
        _history: &[HistoryEntry],
        _timeout: Duration,
    ) -> Result<Decision, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(Decision::GoalSatisfied {
                    summary: "published".into(),
                })
            })
    }
}

pub fn act(name: &str, action: Action) -> Decision {
    Decision::Act(ActionProposal {
        name: name.to_string(),
        action,
        post_wait_ms: 0,
        expect: None,
        confidence: 0.9,
    })
}

pub fn type_into(name: &str, selector: &str, text: &str) -> Decision {
    act(
        name,
        Action::Type {
            selector: Some(selector.to_string()),
            coordinates: None,
            text: text.to_string(),
        },
    )
}

pub fn navigate(name: &str, url: &str) -> Decision {
    act(
        name,
        Action::Navigate {
            url: url.to_string(),
        },
    )
}

pub fn click(name: &str, selector: &str) -> Decision {
    act(
        name,
        Action::Click {
            selector: Some(selector.to_string()),
            coordinates: None,
        },
    )
}

/// The three field entries a provider would propose for a publish task.
pub fn publish_script(title: &str, body: &str, tags: &str) -> Vec<Decision> {
    vec![
        type_into("title", "#title", title),
        type_into("body", "#body", body),
        type_into("tags", "#tags", tags),
    ]
}

pub fn fast_config() -> AgentConfig {
    AgentConfig {
        action_timeout: Duration::from_secs(2),
        provider_timeout: Duration::from_secs(2),
        verify_timeout: Duration::from_secs(2),
        store_timeout: Duration::from_secs(2),
        exploration_budget: Duration::from_secs(10),
        attempts_per_point: 1,
        ..AgentConfig::default()
    }
}

pub fn step(name: &str, selector: &str, var: &str) -> publish_agent::RouteStep {
    use publish_agent::{ActionType, Binding, RouteStep, VerifyCondition};
    RouteStep {
        name: name.to_string(),
        action_type: ActionType::Type,
        selector: Some(selector.to_string()),
        coordinates: None,
        binding: Binding::TemplateVar(var.to_string()),
        post_wait_ms: 0,
        verify: VerifyCondition::TextPresent(Binding::TemplateVar(var.to_string())),
    }
}

/// A learned publish_v1 route: title, body, tags.
pub fn publish_route(failure_count: u32) -> publish_agent::Route {
    publish_agent::Route {
        workflow_id: "publish_v1".into(),
        schema_version: publish_agent::ROUTE_SCHEMA_VERSION,
        last_compiled_at: chrono::Utc::now(),
        success_count: 4,
        failure_count,
        steps: vec![
            step("title", "#title", "title"),
            step("body", "#body", "body"),
            step("tags", "#tags", "tags"),
        ],
    }
}

pub fn publish_task(title: &str, body: &str, tags: &str) -> publish_agent::Task {
    publish_agent::Task::new("publish_v1", "Publish a post")
        .with_var("title", title)
        .with_var("body", body)
        .with_var("tags", tags)
}
