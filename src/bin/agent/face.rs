use anyhow::{Result, anyhow};
use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use publish_agent::{AgentError, AgentEvent, AgentOrchestrator, Task};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

pub struct AppState {
    pub orchestrator: Arc<AgentOrchestrator>,
    pub events: broadcast::Sender<AgentEvent>,
    cancels: RunCancels,
}

impl AppState {
    pub fn new(orchestrator: Arc<AgentOrchestrator>, events: broadcast::Sender<AgentEvent>) -> Self {
        Self {
            orchestrator,
            events,
            cancels: RunCancels::default(),
        }
    }
}

/// Cancellation handles of runs started through the web front, keyed by
/// workflow id. Each registration gets its own number so a finished run
/// never removes the handle of a later run for the same workflow.
#[derive(Default)]
struct RunCancels {
    next: AtomicU64,
    tokens: Mutex<HashMap<String, (u64, CancellationToken)>>,
}

impl RunCancels {
    fn register(&self, workflow_id: &str) -> (u64, CancellationToken) {
        let number = self.next.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(workflow_id.to_string(), (number, token.clone()));
        (number, token)
    }

    fn finish(&self, workflow_id: &str, number: u64) {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        if tokens.get(workflow_id).is_some_and(|(n, _)| *n == number) {
            tokens.remove(workflow_id);
        }
    }

    fn cancel(&self, workflow_id: &str) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        match tokens.get(workflow_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/run", post(run_handler))
        .route("/cancel/{workflow_id}", post(cancel_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state)
}

/// Serve on `port`, or the first free port from 3000 to 3009.
pub async fn serve(state: Arc<AppState>, port: Option<u16>) -> Result<()> {
    let ports: Vec<u16> = match port {
        Some(p) => vec![p],
        None => (3000..3010).collect(),
    };

    let mut bound = None;
    for p in ports {
        if let Ok(l) = tokio::net::TcpListener::bind(("127.0.0.1", p)).await {
            bound = Some((l, p));
            break;
        }
    }
    let (listener, port) =
        bound.ok_or_else(|| anyhow!("could not bind a port, is another agent running?"))?;

    tracing::info!("[Web] UI running at http://localhost:{}", port);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Json(task): Json<Task>,
) -> impl IntoResponse {
    let slot = match state.orchestrator.try_start(&task.workflow_id) {
        Ok(slot) => slot,
        Err(e @ AgentError::Busy(_)) => return (StatusCode::CONFLICT, e.to_string()),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    tracing::info!("[Web] POST /run '{}'", task.workflow_id);

    let (number, cancel) = state.cancels.register(&task.workflow_id);

    let bg = state.clone();
    tokio::spawn(async move {
        if let Err(e) = bg.orchestrator.run_in(slot, &task, &cancel).await {
            let _ = bg.events.send(AgentEvent::TaskError {
                workflow_id: task.workflow_id.clone(),
                message: e.to_string(),
            });
        }
        bg.cancels.finish(&task.workflow_id, number);
    });

    (StatusCode::ACCEPTED, "started".to_string())
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> StatusCode {
    if state.cancels.cancel(&workflow_id) {
        tracing::info!("[Web] Cancelling '{}'", workflow_id);
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| {
        let event = result.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok::<_, Infallible>(
            Event::default().event(event.name()).data(data),
        ))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>Publish Agent</title>
<style>
  body { background: #0a0a0f; color: #e0e0e0; font-family: system-ui, sans-serif; margin: 0; }
  .main { max-width: 800px; margin: 0 auto; padding: 24px 32px; display: flex; flex-direction: column; gap: 12px; }
  input, textarea { background: #111118; border: 1px solid #222; border-radius: 8px; padding: 10px 14px; color: #fff; font-size: 14px; }
  textarea { min-height: 60px; font-family: monospace; }
  button { background: #6366f1; color: #fff; border: none; border-radius: 8px; padding: 10px 20px; font-weight: 600; cursor: pointer; }
  button.stop { background: #ef4444; }
  #log { display: flex; flex-direction: column; gap: 6px; }
  .entry { padding: 8px 12px; border-radius: 6px; font-size: 13px; background: #111118; border-left: 3px solid #3b82f6; }
  .entry.error { border-color: #ef4444; color: #fca5a5; }
  .entry.done { border-color: #22c55e; color: #86efac; }
  .entry.thinking { border-color: #f59e0b; color: #fcd34d; }
</style>
</head>
<body>
<div class="main">
  <h1>Publish Agent</h1>
  <input id="wf" placeholder="workflow id, e.g. publish_v1" />
  <input id="goal" placeholder="goal" />
  <textarea id="vars" placeholder='{"title": "...", "body": "..."}'></textarea>
  <div>
    <button onclick="run()">Run</button>
    <button class="stop" onclick="cancel()">Cancel</button>
  </div>
  <div id="log"></div>
</div>
<script>
  const log = document.getElementById('log');
  function add(cls, text) {
    const d = document.createElement('div');
    d.className = 'entry ' + cls;
    d.textContent = text;
    log.prepend(d);
  }
  async function run() {
    let variables = {};
    const raw = document.getElementById('vars').value.trim();
    if (raw) {
      try { variables = JSON.parse(raw); } catch (e) { add('error', 'variables: ' + e); return; }
    }
    const body = {
      workflow_id: document.getElementById('wf').value.trim(),
      goal: document.getElementById('goal').value.trim(),
      variables,
    };
    const r = await fetch('/run', { method: 'POST', headers: {'Content-Type': 'application/json'}, body: JSON.stringify(body) });
    if (!r.ok) add('error', await r.text());
  }
  async function cancel() {
    await fetch('/cancel/' + encodeURIComponent(document.getElementById('wf').value.trim()), { method: 'POST' });
  }
  const es = new EventSource('/events');
  const on = (name, cls, fmt) => es.addEventListener(name, e => add(cls, fmt(JSON.parse(e.data))));
  on('state', '', d => d.workflow_id + ': ' + d.state);
  on('step', '', d => d.workflow_id + ' step ' + d.number + ': ' + d.description);
  on('step_error', 'error', d => d.workflow_id + ': ' + d.message);
  on('thinking', 'thinking', d => d.workflow_id + ': thinking...');
  on('route_saved', 'done', d => d.workflow_id + ': route saved (' + d.steps + ' steps)');
  on('task_complete', 'done', d => d.workflow_id + ': done via ' + d.mode + ' in ' + d.steps_executed + ' step(s)');
  on('task_error', 'error', d => d.workflow_id + ' failed: ' + d.message);
</script>
</body>
</html>
"##;
