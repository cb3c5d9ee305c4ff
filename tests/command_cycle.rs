//! End-to-end command cycles against a scripted page and scripted backends.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use navigator_agent::llm::{EmbeddingBackend, GenerateRequest, InferenceBackend, VisionBackend};
use navigator_agent::memory::{ActionKind, CachedAction};
use navigator_agent::motion::Point;
use navigator_agent::synthesis::VISION_PLACEHOLDER;
use navigator_agent::{
    AgentConfig, Brain, Decision, DomObserver, Error, MemoryStore, PageHandle, Result,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;

#[derive(Default)]
struct FakePage {
    url: Mutex<String>,
    candidates: Value,
    campaign_rows: Vec<String>,
    navigations: Mutex<Vec<String>>,
    locator_clicks: Mutex<Vec<String>>,
    fills: Mutex<Vec<(String, String)>>,
    pointer_clicks: Mutex<Vec<Point>>,
    moves: AtomicUsize,
    typed: Mutex<Vec<String>>,
    screenshots: AtomicUsize,
    scripts_fail: bool,
}

impl FakePage {
    fn at(url: &str) -> Self {
        Self {
            url: Mutex::new(url.to_string()),
            candidates: json!([]),
            ..Default::default()
        }
    }

    fn with_candidates(mut self, candidates: Value) -> Self {
        self.candidates = candidates;
        self
    }

    fn with_campaign_rows(mut self, rows: &[&str]) -> Self {
        self.campaign_rows = rows.iter().map(|r| r.to_string()).collect();
        self
    }

    /// Every script evaluation errors, as on a crashed or detached tab.
    fn with_failing_scripts(mut self) -> Self {
        self.scripts_fail = true;
        self
    }
}

#[async_trait]
impl PageHandle for FakePage {
    async fn url(&self) -> Result<String> {
        Ok(self.url.lock().clone())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.navigations.lock().push(url.to_string());
        *self.url.lock() = url.to_string();
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        if self.scripts_fail {
            return Err(Error::Backend("Execution context was destroyed".into()));
        }
        if script.contains("div[role='row']") && script.contains(".length") {
            return Ok(json!(self.campaign_rows.len()));
        }
        if script.contains("div[role='row']") {
            return Ok(json!(self.campaign_rows));
        }
        if script.contains("getBoundingClientRect") {
            return Ok(self.candidates.clone());
        }
        Ok(Value::Null)
    }

    async fn click_locator(&self, locator: &str) -> Result<()> {
        self.locator_clicks.lock().push(locator.to_string());
        Ok(())
    }

    async fn fill_locator(&self, locator: &str, text: &str) -> Result<()> {
        self.fills.lock().push((locator.to_string(), text.to_string()));
        Ok(())
    }

    async fn mouse_move(&self, _to: Point) -> Result<()> {
        self.moves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn mouse_click(&self, at: Point) -> Result<()> {
        self.pointer_clicks.lock().push(at);
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        self.typed.lock().push(text.to_string());
        Ok(())
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        self.screenshots.fetch_add(1, Ordering::SeqCst);
        std::fs::write(path, b"\x89PNG")?;
        Ok(())
    }

    async fn scroll_by(&self, _dx: f64, _dy: f64) -> Result<()> {
        Ok(())
    }
}

/// Answers with queued responses in order and keeps every request.
struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedLlm {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn request(&self, index: usize) -> GenerateRequest {
        self.requests.lock()[index].clone()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedLlm {
    async fn generate(&self, request: GenerateRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Backend("no scripted response left".into()))
    }
}

struct ConstantEmbedder;

#[async_trait]
impl EmbeddingBackend for ConstantEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0, 0.0])
    }
}

struct FixedVision;

#[async_trait]
impl VisionBackend for FixedVision {
    async fn describe(&self, _image: &Path, _prompt: &str) -> Result<String> {
        Ok("Clicks 120, impressions 4.300, no warnings.".into())
    }
}

struct Harness {
    _dir: TempDir,
    page: Arc<FakePage>,
    llm: Arc<ScriptedLlm>,
    memory: Arc<MemoryStore>,
    brain: Brain,
}

fn harness(page: FakePage, responses: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig::default().with_data_dir(dir.path());
    let page = Arc::new(page);
    let llm = ScriptedLlm::new(responses);
    let memory = Arc::new(MemoryStore::open(&config, Arc::new(ConstantEmbedder)));
    let brain = Brain::new(
        config,
        Some(page.clone() as Arc<dyn PageHandle>),
        memory.clone(),
        llm.clone(),
        Some(Arc::new(FixedVision)),
    );
    Harness {
        _dir: dir,
        page,
        llm,
        memory,
        brain,
    }
}

#[tokio::test]
async fn test_navigation_reflex_skips_inference() {
    let mut h = harness(FakePage::at("about:blank"), &[]);

    let report = h.brain.handle_command("vá para o whatsapp").await;

    assert_eq!(report.action_taken, "navigate");
    assert_eq!(*h.page.navigations.lock(), vec!["https://web.whatsapp.com"]);
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test]
async fn test_fast_path_replays_cached_action() {
    let mut h = harness(
        FakePage::at("https://ads.example.com/aw/campaigns?ocid=42"),
        &[],
    );
    h.memory
        .save_action(
            "https://ads.example.com/aw/campaigns",
            "baixar relatorio",
            CachedAction {
                locator: "//*[@id='x']".into(),
                action: ActionKind::Click,
                text: None,
            },
        )
        .unwrap();

    let report = h.brain.handle_command("  Baixar Relatorio ").await;

    assert_eq!(report.action_taken, "fast_path");
    assert_eq!(*h.page.locator_clicks.lock(), vec!["//*[@id='x']"]);
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test]
async fn test_decide_prefers_cache_over_reflex() {
    let h = harness(FakePage::at("https://example.com"), &[]);
    h.memory
        .save_action(
            "https://example.com",
            "abra o whatsapp",
            CachedAction {
                locator: "//a[@id='zap']".into(),
                action: ActionKind::Click,
                text: None,
            },
        )
        .unwrap();

    let cached = h.brain.decide("abra o whatsapp", "https://example.com?x=1").await;
    assert!(matches!(cached, Decision::FastPath(ref a) if a.locator == "//a[@id='zap']"));

    let reflex = h.brain.decide("abra o whatsapp", "https://other.com").await;
    assert_eq!(
        reflex,
        Decision::Navigate {
            url: "https://web.whatsapp.com".into()
        }
    );
    assert_eq!(h.llm.calls(), 0);
}

#[tokio::test]
async fn test_unparseable_model_output_takes_no_action() {
    let mut h = harness(FakePage::at("https://example.com"), &["not json at all"]);

    let report = h.brain.handle_command("faça alguma coisa").await;

    assert_eq!(report.action_taken, "none");
    assert!(h.page.navigations.lock().is_empty());
    assert!(h.page.locator_clicks.lock().is_empty());
    assert_eq!(h.llm.calls(), 1);
}

#[tokio::test]
async fn test_inference_failure_is_reported_not_raised() {
    let mut h = harness(FakePage::at("https://example.com"), &[]);

    let report = h.brain.handle_command("qual o status?").await;

    assert_eq!(report.action_taken, "none");
    assert!(report.response.contains("did not answer"));
}

#[tokio::test]
async fn test_tool_missing_argument_never_touches_browser() {
    let mut h = harness(
        FakePage::at("https://example.com"),
        &[r#"{"tool": "doctoralia_ranking", "args": {"specialty": "psicologo"}}"#],
    );

    let report = h.brain.handle_command("ranking de psicólogos").await;

    assert_eq!(report.action_taken, "doctoralia_ranking");
    assert!(report.response.starts_with("Execution error"));
    assert!(report.response.contains("city"));
    assert!(h.page.navigations.lock().is_empty());
}

#[tokio::test]
async fn test_analytical_reply_is_presented_as_extraction() {
    let mut h = harness(
        FakePage::at("https://example.com"),
        &[r#"{"intent": "REPLY", "args": {"text": "CTR abaixo da média."}}"#],
    );

    let report = h.brain.handle_command("analise esta página").await;

    assert_eq!(report.action_taken, "extract");
    assert!(report.response.contains("CTR abaixo da média."));
}

#[tokio::test]
async fn test_act_clicks_element_and_learns_fast_path() {
    let candidates = json!([
        {
            "tag": "button", "inner_text": "Ir", "left": 100.0, "top": 200.0,
            "width": 50.0, "height": 20.0, "locator": "//*[@id=\"go\"]"
        },
        {
            "tag": "a", "inner_text": "Escondido", "left": 0.0, "top": 0.0,
            "width": 0.0, "height": 0.0, "locator": "//*[@id=\"hidden\"]"
        }
    ]);
    let mut h = harness(
        FakePage::at("https://example.com/form?step=1").with_candidates(candidates),
        &[r#"{"intent": "ACT", "args": {"id": 0, "action": "click"}}"#],
    );

    let report = h.brain.handle_command("clique em ir").await;

    assert_eq!(report.action_taken, "act");
    assert_eq!(*h.page.pointer_clicks.lock(), vec![Point::new(125.0, 210.0)]);
    assert!(h.page.moves.load(Ordering::SeqCst) >= 15);

    let learned = h
        .memory
        .get_action("https://example.com/form", "clique em ir")
        .unwrap();
    assert_eq!(learned.locator, "//*[@id=\"go\"]");
    assert_eq!(learned.action, ActionKind::Click);

    // Same command again: replayed from the cache, no second inference.
    let again = h.brain.handle_command("Clique em ir").await;
    assert_eq!(again.action_taken, "fast_path");
    assert_eq!(*h.page.locator_clicks.lock(), vec!["//*[@id=\"go\"]"]);
    assert_eq!(h.llm.calls(), 1);
}

#[tokio::test]
async fn test_act_on_unknown_element_is_refused() {
    let mut h = harness(
        FakePage::at("https://example.com"),
        &[r#"{"intent": "ACT", "args": {"id": 9, "action": "click"}}"#],
    );

    let report = h.brain.handle_command("clique no botão").await;

    assert!(report.response.contains("[9]"));
    assert!(h.page.pointer_clicks.lock().is_empty());
    assert_eq!(h.memory.action_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ads_audit_end_to_end() {
    let page = FakePage::at("https://ads.google.com/aw/campaigns?ocid=1").with_campaign_rows(&[
        "Campanha Hipnose Clinica\nAtiva\nR$ 50,00/dia\n1.234 cliques",
        "Total: todas as campanhas\n--\nR$ 50,00",
    ]);
    let mut h = harness(
        page,
        &[
            r#"{"tool": "google_ads_visual", "args": {}}"#,
            r#"{"intent": "REPLY", "args": {"text": "Aumente o lance nas palavras de maior conversão."}}"#,
        ],
    );

    let report = h.brain.handle_command("auditar campanhas do google ads").await;

    assert_eq!(report.action_taken, "google_ads_visual");
    assert!(report.response.contains("Active campaigns identified: 1"));
    assert!(report.response.contains("Clicks 120"));
    assert!(report.response.ends_with("Aumente o lance nas palavras de maior conversão."));
    assert_eq!(h.page.screenshots.load(Ordering::SeqCst), 1);
    assert!(h.page.navigations.lock().is_empty());

    let data = report.data.unwrap();
    assert_eq!(data["kind"], "dashboard");
    assert_eq!(data["data"]["table_data"][0]["name"], "Campanha Hipnose Clinica");
    assert_eq!(h.llm.calls(), 2);
}

#[tokio::test]
async fn test_history_is_bounded() {
    let responses: Vec<String> = (0..10)
        .map(|i| format!(r#"{{"intent": "REPLY", "args": {{"text": "resposta {i}"}}}}"#))
        .collect();
    let refs: Vec<&str> = responses.iter().map(String::as_str).collect();
    let mut h = harness(FakePage::at("https://example.com"), &refs);

    for i in 0..10 {
        h.brain.handle_command(&format!("pergunta {i}")).await;
    }

    let history: Vec<&str> = h.brain.history().collect();
    assert_eq!(history.len(), 8);
    assert_eq!(history.last().copied(), Some("Agent (reply): resposta 9"));
}

#[tokio::test]
async fn test_without_browser_actions_degrade_to_messages() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig::default().with_data_dir(dir.path());
    let memory = Arc::new(MemoryStore::open(&config, Arc::new(ConstantEmbedder)));
    let llm = ScriptedLlm::new(&[r#"{"tool": "google_ads_visual", "args": {}}"#]);
    let mut brain = Brain::new(config, None, memory, llm.clone(), None);

    let report = brain.handle_command("abra o whatsapp").await;
    assert_eq!(report.response, "Browser not connected.");

    let report = brain.handle_command("extraia os dados das campanhas").await;
    assert_eq!(report.response, "Execution error: browser not connected");
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn test_type_action_is_learned_with_its_text() {
    let candidates = json!([{
        "tag": "input", "input_type": "search", "placeholder": "Buscar",
        "left": 10.0, "top": 10.0, "width": 200.0, "height": 30.0,
        "locator": "//*[@id=\"q\"]"
    }]);
    let mut h = harness(
        FakePage::at("https://www.doctoralia.com.br/").with_candidates(candidates),
        &[r#"{"intent": "ACT", "args": {"id": 0, "action": "type", "text": "hipnoterapia"}}"#],
    );

    let report = h.brain.handle_command("busque hipnoterapia").await;
    assert_eq!(report.action_taken, "act");
    assert_eq!(*h.page.typed.lock(), vec!["hipnoterapia"]);

    h.brain.handle_command("busque hipnoterapia").await;
    assert_eq!(
        *h.page.fills.lock(),
        vec![("//*[@id=\"q\"]".to_string(), "hipnoterapia".to_string())]
    );
    assert_eq!(h.llm.calls(), 1);
}

#[tokio::test]
async fn test_prompt_carries_grounding_catalog_and_bounded_context() {
    let candidates: Vec<Value> = (0..45)
        .map(|i| {
            json!({
                "tag": "button", "inner_text": format!("Opção {i}"),
                "left": 10.0, "top": 10.0 + i as f64 * 30.0, "width": 80.0, "height": 20.0,
                "locator": format!("//*[@id=\"b{i}\"]")
            })
        })
        .collect();
    let mut h = harness(
        FakePage::at("https://example.com/menu").with_candidates(Value::Array(candidates)),
        &[r#"{"intent": "REPLY", "args": {"text": "Ok."}}"#],
    );
    for fact in ["horário de atendimento", "valor da consulta", "endereço da clínica"] {
        h.memory.add_knowledge(fact, "manual.md").await.unwrap();
    }

    let report = h.brain.handle_command("qual opção escolher?").await;
    assert_eq!(report.action_taken, "reply");

    let request = h.llm.request(0);
    assert_eq!(request.format.as_deref(), Some("json"));
    let system = request.system.unwrap_or_default();
    assert!(system.contains("strategic browsing copilot"));
    assert!(system.contains("GROUNDING"));

    let prompt = request.prompt;
    assert!(prompt.contains("AVAILABLE TOOLS:"));
    assert!(prompt.contains("\"google_ads_visual\""));
    assert!(prompt.contains("\"doctoralia_profile\""));
    assert!(prompt.contains("CURRENT URL: https://example.com/menu"));
    assert!(prompt.contains("[39] button \"Opção 39\""));
    assert!(!prompt.contains("[40] button"));
    assert!(prompt.contains("... [5 more elements omitted]"));
    assert!(prompt.ends_with("OPERATOR COMMAND: qual opção escolher?\nAGENT (JSON):"));

    let knowledge_lines = prompt.lines().filter(|l| l.starts_with("- (manual.md)")).count();
    assert_eq!(knowledge_lines, 2);
}

#[tokio::test]
async fn test_failed_observation_leaves_cycle_running() {
    let page = FakePage::at("https://example.com").with_failing_scripts();
    assert!(DomObserver::new().observe(&page).await.is_empty());

    let mut h = harness(page, &[r#"{"intent": "REPLY", "args": {"text": "Sigo aqui."}}"#]);
    let report = h.brain.handle_command("o que tem na tela?").await;

    assert_eq!(report.response, "Sigo aqui.");
    assert!(h.llm.request(0).prompt.contains("(no interactive elements observed)"));
}

#[tokio::test]
async fn test_malformed_observation_is_treated_as_empty() {
    let page = FakePage::at("https://example.com")
        .with_candidates(json!({"error": "not a list of elements"}));
    assert!(DomObserver::new().observe(&page).await.is_empty());

    let mut h = harness(page, &[r#"{"intent": "REPLY", "args": {"text": "Página vazia."}}"#]);
    let report = h.brain.handle_command("liste os botões").await;

    assert_eq!(report.response, "Página vazia.");
    assert!(h.llm.request(0).prompt.contains("(no interactive elements observed)"));
}

#[tokio::test]
async fn test_visual_question_screenshots_and_answers() {
    let mut h = harness(
        FakePage::at("https://ads.google.com/aw/overview"),
        &[r#"{"intent": "ASK_VISION", "args": {"question": "Quantos cliques hoje?"}}"#],
    );

    let report = h.brain.handle_command("olhe o gráfico de cliques").await;

    assert_eq!(report.action_taken, "ask_vision");
    assert!(report.response.contains("Clicks 120"));
    assert_eq!(h.page.screenshots.load(Ordering::SeqCst), 1);
    assert!(h._dir.path().join("screenshots/vision_query.png").exists());
}

#[tokio::test]
async fn test_visual_question_without_vision_backend_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig::default().with_data_dir(dir.path());
    let page = Arc::new(FakePage::at("https://example.com"));
    let memory = Arc::new(MemoryStore::open(&config, Arc::new(ConstantEmbedder)));
    let llm = ScriptedLlm::new(&[r#"{"intent": "ASK_VISION", "args": {}}"#]);
    let mut brain = Brain::new(
        config,
        Some(page.clone() as Arc<dyn PageHandle>),
        memory,
        llm,
        None,
    );

    let report = brain.handle_command("descreva a tela").await;

    assert_eq!(report.action_taken, "ask_vision");
    assert!(report.response.contains(VISION_PLACEHOLDER));
}
