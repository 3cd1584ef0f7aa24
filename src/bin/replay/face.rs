use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rpa_replay::{ReplayEvent, Script};

/// A script accepted by the UI, with the token that cancels it.
pub struct RunRequest {
    pub script: Script,
    pub cancel: CancellationToken,
}

/// Handle the run loop uses to release the busy slot.
#[derive(Clone)]
pub struct RunControl {
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl RunControl {
    pub fn finish_run(&self) {
        self.current.lock().take();
    }
}

struct AppState {
    run_tx: mpsc::Sender<RunRequest>,
    event_tx: broadcast::Sender<ReplayEvent>,
    current: Arc<Mutex<Option<CancellationToken>>>,
}

fn replay_event_to_sse(event: &ReplayEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.name()).data(data)
}

/// Start the progress UI on the first free port of `first_port..first_port + 10`.
pub async fn start_server(
    first_port: u16,
    event_tx: broadcast::Sender<ReplayEvent>,
) -> Result<(mpsc::Receiver<RunRequest>, RunControl)> {
    let (run_tx, run_rx) = mpsc::channel::<RunRequest>(1);
    let current = Arc::new(Mutex::new(None));

    let state = Arc::new(AppState {
        run_tx,
        event_tx,
        current: current.clone(),
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/run", post(run_handler))
        .route("/cancel", post(cancel_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state);

    let last_port = first_port.saturating_add(10);
    let mut bound = None;
    for port in first_port..last_port {
        match tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await {
            Ok(listener) => {
                bound = Some((listener, port));
                break;
            }
            Err(e) => debug!(port, error = %e, "Port busy"),
        }
    }
    let (listener, port) = bound.ok_or_else(|| {
        anyhow!(
            "Could not bind to any port {}-{}. Stop the old replay server first.",
            first_port,
            last_port - 1
        )
    })?;

    info!("Web UI running at http://localhost:{}", port);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "Web UI stopped");
        }
    });

    Ok((run_rx, RunControl { current }))
}

async fn index_handler() -> Html<&'static str> {
    debug!("GET /");
    Html(INDEX_HTML)
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Json(script): Json<Script>,
) -> (StatusCode, String) {
    let script = match script.validated() {
        Ok(script) => script,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()),
    };

    let cancel = CancellationToken::new();
    {
        let mut current = state.current.lock();
        if current.is_some() {
            return (StatusCode::CONFLICT, "A script is already running".to_string());
        }
        *current = Some(cancel.clone());
    }

    info!(title = %script.title, steps = script.steps.len(), "POST /run");
    if state.run_tx.send(RunRequest { script, cancel }).await.is_err() {
        state.current.lock().take();
        return (StatusCode::SERVICE_UNAVAILABLE, "Runner is not accepting scripts".to_string());
    }
    (StatusCode::ACCEPTED, "started".to_string())
}

async fn cancel_handler(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    match state.current.lock().as_ref() {
        Some(token) => {
            info!("POST /cancel");
            token.cancel();
            (StatusCode::OK, "cancelling")
        }
        None => (StatusCode::NOT_FOUND, "nothing is running"),
    }
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(Ok::<_, Infallible>(replay_event_to_sse(&event))),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Script Replay</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0a0a0f;
    color: #e0e0e0;
    font-family: 'Segoe UI', system-ui, -apple-system, sans-serif;
    height: 100vh;
    display: flex;
    flex-direction: column;
  }
  header { padding: 20px 32px; border-bottom: 1px solid #1e1e2e; }
  header h1 { font-size: 18px; font-weight: 600; color: #fff; }
  main { flex: 1; display: flex; gap: 24px; padding: 24px 32px; min-height: 0; }
  section { flex: 1; display: flex; flex-direction: column; min-height: 0; }
  textarea {
    flex: 1;
    background: #12121a;
    color: #e0e0e0;
    border: 1px solid #2a2a3a;
    border-radius: 8px;
    padding: 12px;
    font-family: ui-monospace, monospace;
    font-size: 13px;
    resize: none;
  }
  .buttons { display: flex; gap: 12px; margin-top: 12px; }
  button {
    padding: 10px 20px;
    border: none;
    border-radius: 8px;
    font-size: 14px;
    cursor: pointer;
    background: #6366f1;
    color: #fff;
  }
  button.secondary { background: #2a2a3a; }
  #log { flex: 1; overflow-y: auto; font-size: 13px; }
  .entry { padding: 8px 12px; border-left: 3px solid #2a2a3a; margin-bottom: 6px; }
  .entry.ok { border-color: #22c55e; }
  .entry.fail { border-color: #ef4444; }
  .entry.info { border-color: #6366f1; }
  #status { margin-top: 8px; font-size: 12px; color: #888; }
</style>
</head>
<body>
<header><h1>Script Replay</h1></header>
<main>
  <section>
    <textarea id="script" placeholder='{"title": "...", "url": "...", "steps": [...]}'></textarea>
    <div class="buttons">
      <button id="run">Run</button>
      <button id="cancel" class="secondary">Cancel</button>
    </div>
    <div id="status"></div>
  </section>
  <section><div id="log"></div></section>
</main>
<script>
  const log = document.getElementById('log');
  const status = document.getElementById('status');

  function add(cls, text) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.textContent = text;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
  }

  document.getElementById('run').onclick = async () => {
    log.innerHTML = '';
    const res = await fetch('/run', {
      method: 'POST',
      headers: { 'Content-Type': 'application/json' },
      body: document.getElementById('script').value,
    });
    status.textContent = res.status + ' ' + await res.text();
  };

  document.getElementById('cancel').onclick = async () => {
    const res = await fetch('/cancel', { method: 'POST' });
    status.textContent = res.status + ' ' + await res.text();
  };

  const es = new EventSource('/events');
  es.addEventListener('run_started', e => {
    const d = JSON.parse(e.data);
    add('info', 'Running "' + d.title + '" (' + d.total_steps + ' steps)');
  });
  es.addEventListener('step_started', e => {
    const d = JSON.parse(e.data);
    add('info', 'Step ' + d.step_number + ': ' + d.instruction);
  });
  es.addEventListener('iteration', e => {
    const d = JSON.parse(e.data);
    const what = d.action || d.error || 'no action';
    add(d.succeeded ? 'ok' : 'fail', '  #' + (d.iteration + 1) + ' ' + what);
  });
  es.addEventListener('step_finished', e => {
    const d = JSON.parse(e.data);
    add(d.status === 'success' ? 'ok' : 'fail', 'Step ' + d.stepNumber + ' ' + d.status + ': ' + d.message);
  });
  es.addEventListener('run_finished', e => {
    const d = JSON.parse(e.data);
    add(d.status === 'completed' ? 'ok' : 'fail', 'Run ' + d.status);
  });
</script>
</body>
</html>
"##;
