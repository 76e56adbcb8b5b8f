//! Turns a successful exploration into a replayable route.
//!
//! Literals that equal a bound task variable become template variables, so
//! the next task instance can replay the same steps with its own values.
//! When a literal equals several variables the longest variable name wins,
//! then the lexicographically smallest one.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::types::{
    ActionType, Binding, Check, ExplorationTrace, ROUTE_SCHEMA_VERSION, Route, RouteStep,
    VerifyCondition,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct RouteCompiler;

impl RouteCompiler {
    pub fn new() -> Self {
        Self
    }

    /// Compile a fully successful trace. Counters start at zero.
    pub fn compile(
        &self,
        workflow_id: &str,
        trace: &ExplorationTrace,
        variables: &BTreeMap<String, String>,
    ) -> Route {
        let steps = trace
            .entries()
            .iter()
            .map(|entry| RouteStep {
                name: entry.name.clone(),
                action_type: entry.action.action_type(),
                selector: entry.action.selector().map(str::to_string),
                coordinates: entry.action.coordinates(),
                binding: match entry.action.action_type() {
                    // durations are not input values
                    ActionType::Wait => Binding::Value(entry.action.literal()),
                    _ => bind(&entry.action.literal(), variables),
                },
                post_wait_ms: entry.post_wait_ms,
                verify: templatize(&entry.signal, variables),
            })
            .collect();

        Route {
            workflow_id: workflow_id.to_string(),
            schema_version: ROUTE_SCHEMA_VERSION,
            last_compiled_at: Utc::now(),
            success_count: 0,
            failure_count: 0,
            steps,
        }
    }
}

fn bind(literal: &str, variables: &BTreeMap<String, String>) -> Binding {
    if literal.is_empty() {
        return Binding::Value(String::new());
    }
    variables
        .iter()
        .filter(|(_, value)| value.as_str() == literal)
        .map(|(name, _)| name)
        .max_by(|a, b| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
        .map(|name| Binding::TemplateVar(name.clone()))
        .unwrap_or_else(|| Binding::Value(literal.to_string()))
}

fn templatize(signal: &Check, variables: &BTreeMap<String, String>) -> VerifyCondition {
    match signal {
        Check::UrlContains(s) => VerifyCondition::UrlContains(bind(s, variables)),
        Check::TitleContains(s) => VerifyCondition::TitleContains(s.clone()),
        Check::ElementPresent(s) => VerifyCondition::ElementPresent(s.clone()),
        Check::TextPresent(s) => VerifyCondition::TextPresent(bind(s, variables)),
        Check::ActionSucceeded => VerifyCondition::ActionSucceeded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, TraceEntry};

    fn typed(name: &str, selector: &str, text: &str) -> TraceEntry {
        TraceEntry {
            name: name.into(),
            action: Action::Type {
                selector: Some(selector.into()),
                coordinates: None,
                text: text.into(),
            },
            post_wait_ms: 100,
            signal: Check::TextPresent(text.into()),
        }
    }

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn literals_matching_variables_become_template_vars() {
        let mut trace = ExplorationTrace::new();
        trace.record(TraceEntry {
            name: "open editor".into(),
            action: Action::Navigate {
                url: "https://blog.example.com/write".into(),
            },
            post_wait_ms: 0,
            signal: Check::UrlContains("/write".into()),
        });
        trace.record(typed("title", "#title", "A"));
        trace.record(typed("body", "#body", "B"));

        let route = RouteCompiler::new().compile(
            "publish_v1",
            &trace,
            &vars(&[("title", "A"), ("body", "B")]),
        );

        assert_eq!(route.workflow_id, "publish_v1");
        assert_eq!(route.schema_version, ROUTE_SCHEMA_VERSION);
        assert_eq!(route.steps.len(), 3);
        assert_eq!(
            route.steps[0].binding,
            Binding::Value("https://blog.example.com/write".into())
        );
        assert_eq!(route.steps[1].binding, Binding::TemplateVar("title".into()));
        assert_eq!(
            route.steps[1].verify,
            VerifyCondition::TextPresent(Binding::TemplateVar("title".into()))
        );
        assert_eq!(route.steps[2].action_type, ActionType::Type);
        assert_eq!(route.steps[2].post_wait_ms, 100);
        assert_eq!(route.steps[2].selector.as_deref(), Some("#body"));
    }

    #[test]
    fn ambiguous_literal_prefers_longest_variable_name() {
        let mut trace = ExplorationTrace::new();
        trace.record(typed("tags", "#tags", "x"));
        let route = RouteCompiler::new().compile(
            "w",
            &trace,
            &vars(&[("t", "x"), ("tag_list", "x"), ("category", "x")]),
        );
        // "category" and "tag_list" tie on length; the smaller name wins.
        assert_eq!(route.steps[0].binding, Binding::TemplateVar("category".into()));
    }

    #[test]
    fn partial_matches_and_clicks_stay_literal() {
        let mut trace = ExplorationTrace::new();
        trace.record(typed("title", "#title", "Hello world"));
        trace.record(TraceEntry {
            name: "publish".into(),
            action: Action::Click {
                selector: Some("button.publish".into()),
                coordinates: None,
            },
            post_wait_ms: 0,
            signal: Check::ActionSucceeded,
        });
        let route = RouteCompiler::new().compile("w", &trace, &vars(&[("title", "Hello"), ("empty", "")]));
        assert_eq!(route.steps[0].binding, Binding::Value("Hello world".into()));
        assert_eq!(route.steps[1].binding, Binding::Value(String::new()));
        assert_eq!(route.steps[1].verify, VerifyCondition::ActionSucceeded);
    }

    #[test]
    fn wait_durations_are_never_templated() {
        let mut trace = ExplorationTrace::new();
        trace.record(TraceEntry {
            name: "settle".into(),
            action: Action::Wait { ms: 500 },
            post_wait_ms: 0,
            signal: Check::ActionSucceeded,
        });
        trace.record(typed("tags", "#tags", "500"));

        let route = RouteCompiler::new().compile("w", &trace, &vars(&[("tags", "500")]));

        assert_eq!(route.steps[0].action_type, ActionType::Wait);
        assert_eq!(route.steps[0].binding, Binding::Value("500".into()));
        assert_eq!(route.steps[1].binding, Binding::TemplateVar("tags".into()));
        let (action, _) = route.steps[0]
            .resolve(0, &vars(&[("tags", "news")]))
            .unwrap();
        assert_eq!(action, Action::Wait { ms: 500 });
    }
}
