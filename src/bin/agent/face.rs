use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use navigator_agent::{CycleReport, MemoryStore};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

/// Events streamed to the console via SSE.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    Thinking { command: String },
    Report(CycleReport),
    Error { message: String },
    Ready,
}

impl AgentEvent {
    fn to_sse_event(&self) -> Event {
        match self {
            AgentEvent::Thinking { command } => Event::default()
                .event("thinking")
                .data(json!({ "command": command }).to_string()),
            AgentEvent::Report(report) => Event::default()
                .event("report")
                .data(serde_json::to_string(report).unwrap_or_else(|_| "{}".into())),
            AgentEvent::Error { message } => Event::default()
                .event("agent_error")
                .data(json!({ "message": message }).to_string()),
            AgentEvent::Ready => Event::default().event("ready").data("{}"),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub cmd_tx: mpsc::Sender<String>,
    pub event_tx: broadcast::Sender<AgentEvent>,
    pub memory: Arc<MemoryStore>,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

#[derive(Deserialize)]
struct KnowledgePayload {
    text: String,
    #[serde(default)]
    source: Option<String>,
}

/// Start the operator console on the first free port from `port` upward.
/// Returns the command queue and the event channel.
pub async fn start_server(
    port: u16,
    memory: Arc<MemoryStore>,
) -> anyhow::Result<(mpsc::Receiver<String>, broadcast::Sender<AgentEvent>)> {
    // One command at a time: the queue holds what arrives while one runs.
    let (cmd_tx, cmd_rx) = mpsc::channel::<String>(16);
    let (event_tx, _) = broadcast::channel::<AgentEvent>(64);

    let state = Arc::new(AppState {
        cmd_tx,
        event_tx: event_tx.clone(),
        memory,
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/knowledge", post(knowledge_handler))
        .route("/cache/clear", post(clear_cache_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state);

    let mut bound = None;
    for p in port..port.saturating_add(10) {
        if let Ok(l) = tokio::net::TcpListener::bind(("127.0.0.1", p)).await {
            bound = Some((l, p));
            break;
        }
    }
    let Some((listener, port)) = bound else {
        anyhow::bail!(
            "could not bind any port in {}..{}; is another agent running?",
            port,
            port.saturating_add(10)
        );
    };

    info!("Operator console at http://localhost:{}", port);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Console server stopped: {}", e);
        }
    });

    Ok((cmd_rx, event_tx))
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> StatusCode {
    let command = payload.command.trim().to_string();
    if command.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    info!("Command received: {}", command);
    match state.cmd_tx.send(command).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn knowledge_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<KnowledgePayload>,
) -> (StatusCode, Json<serde_json::Value>) {
    let source = payload.source.unwrap_or_else(|| "console".to_string());
    match state.memory.add_knowledge(&payload.text, &source).await {
        Ok(Some(id)) => (StatusCode::CREATED, Json(json!({ "id": id }))),
        Ok(None) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "text was empty or could not be embedded" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn clear_cache_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.memory.clear_actions() {
        Ok(()) => {
            info!("Action cache cleared from the console");
            StatusCode::NO_CONTENT
        }
        Err(e) => {
            warn!("Could not clear the action cache: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<AgentEvent, _>| match result {
            Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
            Err(_) => None,
        });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="pt-BR">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Navigator Agent</title>
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
  header {
    padding: 20px 32px;
    border-bottom: 1px solid #1a1a2e;
    display: flex;
    align-items: center;
    gap: 12px;
  }
  header h1 { font-size: 20px; font-weight: 600; color: #fff; flex: 1; }
  header .dot {
    width: 8px; height: 8px;
    border-radius: 50%;
    background: #22c55e;
  }
  header .dot.busy { background: #f59e0b; animation: pulse 1.2s infinite; }
  @keyframes pulse { 0%, 100% { opacity: 1; } 50% { opacity: 0.4; } }
  .main {
    flex: 1;
    display: flex;
    flex-direction: column;
    max-width: 860px;
    width: 100%;
    margin: 0 auto;
    padding: 20px 32px;
    gap: 12px;
    overflow: hidden;
  }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 8px; }
  .entry {
    padding: 10px 14px;
    border-radius: 8px;
    font-size: 14px;
    line-height: 1.5;
    white-space: pre-wrap;
  }
  .entry.user { background: #1a1a2e; border-left: 3px solid #6366f1; }
  .entry.agent { background: #0a1a0a; border-left: 3px solid #22c55e; color: #bbf7d0; }
  .entry.thinking { background: #111118; border-left: 3px solid #f59e0b; color: #fcd34d; }
  .entry.error { background: #1a0a0a; border-left: 3px solid #ef4444; color: #fca5a5; }
  .entry .tag { color: #818cf8; font-family: monospace; font-size: 12px; margin-right: 8px; }
  .macros, .input-area { display: flex; gap: 8px; flex-wrap: wrap; }
  #cmd, #knowledge {
    flex: 1;
    background: #111118;
    border: 1px solid #222;
    border-radius: 8px;
    padding: 12px 16px;
    color: #fff;
    font-size: 15px;
    outline: none;
  }
  #cmd:focus, #knowledge:focus { border-color: #6366f1; }
  button {
    background: #6366f1;
    color: #fff;
    border: none;
    border-radius: 8px;
    padding: 10px 18px;
    font-size: 14px;
    font-weight: 600;
    cursor: pointer;
  }
  button.secondary { background: #1f2937; }
  button:hover { background: #4f46e5; }
</style>
</head>
<body>
  <header>
    <div class="dot" id="status-dot"></div>
    <h1>Navigator Agent</h1>
    <button class="secondary" onclick="clearCache()">Clear learned actions</button>
  </header>
  <div class="main">
    <div id="log"></div>
    <div class="macros">
      <button class="secondary" onclick="quick('Abra o Google Ads')">Google Ads</button>
      <button class="secondary" onclick="quick('Analise as campanhas do Google Ads')">Audit campaigns</button>
      <button class="secondary" onclick="quick('Abra a Doctoralia')">Doctoralia</button>
      <button class="secondary" onclick="quick('Vá para o WhatsApp')">WhatsApp</button>
    </div>
    <div class="input-area">
      <input type="text" id="cmd" placeholder="Tell the agent what to do..." autofocus />
      <button onclick="send()">Send</button>
    </div>
    <div class="input-area">
      <input type="text" id="knowledge" placeholder="Teach a fact to the agent's memory..." />
      <button class="secondary" onclick="teach()">Remember</button>
    </div>
  </div>
<script>
  const log = document.getElementById('log');
  const cmd = document.getElementById('cmd');
  const knowledge = document.getElementById('knowledge');
  const dot = document.getElementById('status-dot');
  const esc = s => String(s).replace(/&/g,'&amp;').replace(/</g,'&lt;');

  function addEntry(cls, html) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = html;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
  }

  async function post(path, body) {
    return fetch(path, {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: body === undefined ? undefined : JSON.stringify(body),
    });
  }

  async function quick(text) {
    addEntry('user', '<strong>You:</strong> ' + esc(text));
    await post('/command', {command: text});
  }

  async function send() {
    const text = cmd.value.trim();
    if (!text) return;
    cmd.value = '';
    await quick(text);
  }

  async function teach() {
    const text = knowledge.value.trim();
    if (!text) return;
    knowledge.value = '';
    const res = await post('/knowledge', {text});
    addEntry(res.ok ? 'agent' : 'error', res.ok ? 'Remembered.' : 'Could not store that fact.');
  }

  async function clearCache() {
    const res = await fetch('/cache/clear', {method: 'POST'});
    addEntry(res.ok ? 'agent' : 'error', res.ok ? 'Learned actions cleared.' : 'Could not clear learned actions.');
  }

  cmd.addEventListener('keydown', e => { if (e.key === 'Enter') send(); });
  knowledge.addEventListener('keydown', e => { if (e.key === 'Enter') teach(); });

  const es = new EventSource('/events');

  es.addEventListener('thinking', e => {
    const d = JSON.parse(e.data);
    dot.className = 'dot busy';
    addEntry('thinking', 'Working on: ' + esc(d.command));
  });

  es.addEventListener('report', e => {
    const d = JSON.parse(e.data);
    addEntry('agent', '<span class="tag">' + esc(d.action_taken) + '</span>' + esc(d.response));
  });

  es.addEventListener('agent_error', e => {
    const d = JSON.parse(e.data);
    addEntry('error', '<strong>Error:</strong> ' + esc(d.message));
  });

  es.addEventListener('ready', () => { dot.className = 'dot'; });

  addEntry('agent', 'Agent ready. Type a command to begin.');
</script>
</body>
</html>
"##;
