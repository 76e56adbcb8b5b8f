mod common;

use std::sync::Arc;

use publish_agent::{
    ActionExecutor, AgentError, Binding, ExplorationTrace, RouteCompiler, RouteReplayer,
    SessionFactory, TraceEntry, VerifyCondition,
};

use common::*;

async fn executor(page: &SharedPage) -> Arc<dyn ActionExecutor> {
    FakeSessions::new(page.clone()).open("publish_v1").await.unwrap()
}

#[tokio::test]
async fn full_replay_yields_every_step_in_order() {
    let page = shared_page();
    let replayer = RouteReplayer::new(executor(&page).await, &fast_config());
    let route = publish_route(0);
    let vars = publish_task("C", "D", "z").variables;

    let mut replay = replayer.replay(&route, &vars);
    let mut seen = Vec::new();
    while let Some((index, outcome)) = replay.next_step().await {
        outcome.unwrap();
        seen.push(index);
    }

    assert_eq!(seen, [0, 1, 2]);
    assert!(replay.is_finished());
    assert_eq!(page.lock().unwrap().fields["#body"], "D");
}

#[tokio::test]
async fn replay_stops_at_first_failure() {
    let page = shared_page();
    let replayer = RouteReplayer::new(executor(&page).await, &fast_config());
    let mut route = publish_route(0);
    route.steps[1].verify = VerifyCondition::TitleContains("Preview".into());
    let vars = publish_task("C", "D", "z").variables;

    let mut replay = replayer.replay(&route, &vars);
    let mut outcomes = Vec::new();
    while let Some((index, outcome)) = replay.next_step().await {
        outcomes.push((index, outcome.is_ok()));
    }

    assert_eq!(outcomes, [(0, true), (1, false)]);
    assert!(replay.next_step().await.is_none());
    // the tags step never ran
    assert_eq!(page.lock().unwrap().log.len(), 2);
    assert_eq!(page.lock().unwrap().fields["#tags"], "");
}

#[tokio::test]
async fn missing_element_is_an_action_failure() {
    let page = shared_page();
    page.lock().unwrap().fields.remove("#title");
    let replayer = RouteReplayer::new(executor(&page).await, &fast_config());
    let route = publish_route(0);
    let vars = publish_task("C", "D", "z").variables;

    let mut replay = replayer.replay(&route, &vars);
    let (index, outcome) = replay.next_step().await.unwrap();

    assert_eq!(index, 0);
    let err = outcome.unwrap_err();
    assert!(matches!(err, AgentError::ActionFailed { index: 0, .. }));
    assert!(err.is_recoverable());
    assert!(replay.is_finished());
}

#[tokio::test]
async fn unbound_variable_is_reported_before_the_step_acts() {
    let page = shared_page();
    let replayer = RouteReplayer::new(executor(&page).await, &fast_config());
    let route = publish_route(0);
    let vars = publish_agent::Task::new("publish_v1", "publish")
        .with_var("body", "D")
        .variables;

    let mut replay = replayer.replay(&route, &vars);
    let (_, outcome) = replay.next_step().await.unwrap();

    match outcome {
        Err(AgentError::UnboundVariable { index, var, .. }) => {
            assert_eq!(index, 0);
            assert_eq!(var, "title");
        }
        other => panic!("expected unbound variable, got {other:?}"),
    }
    assert!(page.lock().unwrap().log.is_empty());
}

#[tokio::test]
async fn compiled_trace_replays_the_same_actions() {
    let page = shared_page();
    let exec = executor(&page).await;
    let task = publish_task("A", "B", "x,y");

    // Record a trace by hand, the way exploration would.
    let mut trace = ExplorationTrace::new();
    for decision in publish_script("A", "B", "x,y") {
        let publish_agent::Decision::Act(p) = decision else {
            unreachable!()
        };
        let result = exec.perform(&p.action).await;
        assert!(result.success);
        let literal = p.action.literal();
        trace.record(TraceEntry {
            name: p.name,
            action: p.action,
            post_wait_ms: 0,
            signal: publish_agent::Check::TextPresent(literal),
        });
    }
    let recorded = page.lock().unwrap().log.clone();

    let route = RouteCompiler::new().compile("publish_v1", &trace, &task.variables);
    assert_eq!(
        route.steps[2].binding,
        Binding::TemplateVar("tags".into())
    );

    page.lock().unwrap().log.clear();
    let replayer = RouteReplayer::new(exec, &fast_config());
    let mut replay = replayer.replay(&route, &task.variables);
    while let Some((_, outcome)) = replay.next_step().await {
        outcome.unwrap();
    }

    assert_eq!(page.lock().unwrap().log, recorded);
}
