//! The decision engine: one command in, one action out.
//!
//! Every command runs the same cycle. The fast-path cache is checked first,
//! then the navigation reflexes. Only when neither matches does the engine
//! assemble context and ask the model. Whatever is decided gets executed
//! here, and every failure along the way ends up as text in the
//! [`CycleReport`] instead of an error.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::AgentConfig;
use crate::decision::{Decision, parse_decision};
use crate::error::Result;
use crate::interpreter::{ActionInterpreter, ToolResult};
use crate::llm::{GenerateRequest, InferenceBackend, VisionBackend};
use crate::memory::{ActionKind, CachedAction, KnowledgeHit, MemoryStore};
use crate::motion::HumanMouse;
use crate::page::PageHandle;
use crate::perception::{DomObserver, InteractiveElement, render_for_prompt};
use crate::synthesis::{Synthesizer, VISION_PLACEHOLDER};
use crate::tools::{NO_TOOL, ToolRegistry, catalog_json};

const PERSONA: &str = "You are a strategic browsing copilot for a health-care practice: \
a data-driven digital marketing analyst who operates the operator's own browser. \
You are objective, you read numbers carefully and you never make things up.";

const GROUNDING_RULE: &str = "GROUNDING: you may only act on elements listed under PAGE ELEMENTS, \
referring to them by their numeric id. Never invent ids, selectors or URLs that are not given to you.";

const RESPONSE_RULES: &str = r#"RESPONSE FORMAT:
1. Answer ONLY with a single valid JSON object. No markdown, no commentary.
2. To run a tool: {"tool": "<tool name>", "args": {...}}
3. To click or type on the page: {"intent": "ACT", "args": {"id": <element id>, "action": "click" | "type", "text": "<text to type>"}}
4. To open an address: {"intent": "NAVIGATE", "args": {"url": "https://..."}}
5. To present an analysis of what is on screen: {"intent": "EXTRACT", "args": {"data": "<analysis>"}}
6. To answer in words: {"intent": "REPLY", "args": {"text": "<answer>"}}
7. To look at the screen itself (charts, images, layout): {"intent": "ASK_VISION", "args": {"question": "<what to look for>"}}
8. If nothing applies: {"tool": "none", "args": {}}

Example:
Operator: "Rank psychologists in Goiania on Doctoralia"
Agent: {"tool": "doctoralia_ranking", "args": {"specialty": "psicologo", "city": "goiania"}}"#;

/// Verbs that mark a command as a request to go somewhere.
const NAVIGATION_VERBS: &[&str] = &[
    "vá para",
    "va para",
    "vai para",
    "ir para",
    "abra",
    "abrir",
    "abre",
    "navegue",
    "acesse",
    "acessar",
    "go to",
    "open",
    "navigate",
];

/// Words that mark a command as asking for analysis rather than chat.
const ANALYTICAL_MARKERS: &[&str] = &[
    "analise",
    "analisar",
    "análise",
    "analyze",
    "analyse",
    "relatório",
    "relatorio",
    "report",
    "diagnóstico",
    "diagnostico",
    "auditoria",
    "audit",
];

const HISTORY_ENTRY_CHARS: usize = 200;

/// What one command produced, ready for the console.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub response: String,
    pub action_taken: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CycleReport {
    fn new(action_taken: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            action_taken: action_taken.into(),
            data: None,
        }
    }

    fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether `phrase` occurs in `tokens` as whole consecutive words.
fn has_phrase(tokens: &[String], phrase: &str) -> bool {
    let wanted = words(phrase);
    !wanted.is_empty() && tokens.windows(wanted.len()).any(|w| w == wanted.as_slice())
}

/// Find a shortcut destination for a plain navigation command.
pub fn reflex_destination(config: &AgentConfig, command: &str) -> Option<String> {
    let tokens = words(command);
    if !NAVIGATION_VERBS.iter().any(|v| has_phrase(&tokens, v)) {
        return None;
    }
    config
        .shortcuts
        .iter()
        .find(|s| s.phrases.iter().any(|p| has_phrase(&tokens, p)))
        .map(|s| s.url.clone())
}

pub fn is_analytical(command: &str) -> bool {
    let lower = command.to_lowercase();
    ANALYTICAL_MARKERS.iter().any(|m| lower.contains(m))
}

/// An analytical command must not be answered with small talk.
fn coerce_analytical(command: &str, decision: Decision) -> Decision {
    match decision {
        Decision::Reply { text } if is_analytical(command) => {
            debug!("Coercing reply into extraction for analytical command");
            Decision::Extract { analysis: text }
        }
        other => other,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max).collect();
    cut.push('…');
    cut
}

/// Page state captured while deciding, reused when executing.
#[derive(Debug, Default)]
struct Snapshot {
    url: String,
    elements: Vec<InteractiveElement>,
}

pub struct Brain {
    config: AgentConfig,
    page: Option<Arc<dyn PageHandle>>,
    memory: Arc<MemoryStore>,
    llm: Arc<dyn InferenceBackend>,
    interpreter: ActionInterpreter,
    synthesizer: Synthesizer,
    vision: Option<Arc<dyn VisionBackend>>,
    observer: DomObserver,
    mouse: HumanMouse,
    history: VecDeque<String>,
}

impl Brain {
    pub fn new(
        config: AgentConfig,
        page: Option<Arc<dyn PageHandle>>,
        memory: Arc<MemoryStore>,
        llm: Arc<dyn InferenceBackend>,
        vision: Option<Arc<dyn VisionBackend>>,
    ) -> Self {
        let registry = Arc::new(ToolRegistry::new(page.clone(), &config));
        let synthesizer = Synthesizer::new(llm.clone(), vision.clone(), config.model.clone());

        Self {
            page,
            memory,
            llm,
            interpreter: ActionInterpreter::new(registry),
            synthesizer,
            vision,
            observer: DomObserver::new(),
            mouse: HumanMouse::new(),
            history: VecDeque::with_capacity(config.history_lines),
            config,
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }

    async fn current_url(&self) -> String {
        let Some(page) = &self.page else {
            return String::new();
        };
        match page.url().await {
            Ok(url) => url,
            Err(e) => {
                warn!("Could not read the current URL: {}", e);
                String::new()
            }
        }
    }

    /// Decide what to do with `command` on the page at `url`.
    pub async fn decide(&self, command: &str, url: &str) -> Decision {
        let mut snapshot = Snapshot {
            url: url.to_string(),
            ..Default::default()
        };
        self.decide_with(command, &mut snapshot).await
    }

    async fn decide_with(&self, command: &str, snapshot: &mut Snapshot) -> Decision {
        if let Some(action) = self.memory.get_action(&snapshot.url, command) {
            info!(locator = %action.locator, "Fast path hit");
            return Decision::FastPath(action);
        }

        if let Some(url) = reflex_destination(&self.config, command) {
            info!(url = %url, "Navigation reflex");
            return Decision::Navigate { url };
        }

        if let Some(page) = &self.page {
            if !snapshot.url.is_empty() && snapshot.url != "about:blank" {
                snapshot.elements = self.observer.observe(page.as_ref()).await;
            }
        }
        let knowledge = self
            .memory
            .query_knowledge(command, self.config.knowledge_limit)
            .await;
        let prompt = self.compose_prompt(command, snapshot, &knowledge);

        let request = GenerateRequest::new(self.config.model.clone(), prompt)
            .with_system(format!("{PERSONA}\n\n{GROUNDING_RULE}"))
            .json();

        let raw = match self.llm.generate(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Inference failed: {}", e);
                return Decision::no_action(format!("The language model did not answer: {e}"));
            }
        };
        debug!(raw = %raw, "Model answered");

        coerce_analytical(command, parse_decision(&raw))
    }

    fn compose_prompt(
        &self,
        command: &str,
        snapshot: &Snapshot,
        knowledge: &[KnowledgeHit],
    ) -> String {
        let elements = if snapshot.elements.is_empty() {
            "(no interactive elements observed)".to_string()
        } else {
            render_for_prompt(&snapshot.elements, self.config.max_prompt_elements)
        };

        let knowledge = if knowledge.is_empty() {
            "No historical data.".to_string()
        } else {
            knowledge
                .iter()
                .map(|hit| format!("- ({}) {}", hit.source, hit.text))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let history = if self.history.is_empty() {
            "(none)".to_string()
        } else {
            self.history.iter().cloned().collect::<Vec<_>>().join("\n")
        };

        let url = if snapshot.url.is_empty() {
            "(no page loaded)"
        } else {
            snapshot.url.as_str()
        };

        format!(
            "AVAILABLE TOOLS:\n{}\n\n{}\n\nCURRENT URL: {}\n\nPAGE ELEMENTS:\n{}\n\n\
             RETRIEVED KNOWLEDGE:\n{}\n\nRECENT CONVERSATION:\n{}\n\n\
             OPERATOR COMMAND: {}\nAGENT (JSON):",
            catalog_json(),
            RESPONSE_RULES,
            url,
            elements,
            knowledge,
            history,
            command
        )
    }

    /// Run one full cycle for `command`. Never fails.
    #[instrument(skip_all, fields(command = %command))]
    pub async fn handle_command(&mut self, command: &str) -> CycleReport {
        let command = command.trim();
        if command.is_empty() {
            return CycleReport::new(NO_TOOL, "Empty command.");
        }

        let mut snapshot = Snapshot {
            url: self.current_url().await,
            ..Default::default()
        };
        let decision = self.decide_with(command, &mut snapshot).await;
        info!(decision = %decision.label(), "Decision made");

        let report = self.execute(command, &snapshot, decision).await;
        self.remember(command, &report);
        report
    }

    async fn execute(&self, command: &str, snapshot: &Snapshot, decision: Decision) -> CycleReport {
        let label = decision.label();
        let instruction = decision.to_instruction();
        match decision {
            Decision::FastPath(action) => self.replay(&action).await,
            Decision::Navigate { url } => self.navigate(&url).await,
            Decision::Act {
                element_id,
                action,
                text,
            } => {
                self.act(command, snapshot, element_id, action, text)
                    .await
            }
            Decision::Tool { tool, .. } => match instruction {
                Some(instruction) => self.run_tool(&tool, &instruction).await,
                None => CycleReport::new(label, "No action taken."),
            },
            Decision::AskVision { question } => self.ask_vision(&question).await,
            Decision::Extract { analysis } => {
                CycleReport::new(label, format!("📊 ANALYSIS:\n{analysis}"))
            }
            Decision::Reply { text } => CycleReport::new(label, text),
            Decision::NoAction { reason } => CycleReport::new(label, reason),
        }
    }

    async fn replay(&self, action: &CachedAction) -> CycleReport {
        let Some(page) = &self.page else {
            return CycleReport::new("fast_path", "Browser not connected.");
        };

        let result = match action.action {
            ActionKind::Click => page.click_locator(&action.locator).await,
            ActionKind::Type => {
                page.fill_locator(&action.locator, action.text.as_deref().unwrap_or_default())
                    .await
            }
        };

        match result {
            Ok(()) => CycleReport::new(
                "fast_path",
                format!("⚡ Repeated a learned action on {}.", action.locator),
            ),
            Err(e) => {
                warn!(locator = %action.locator, "Fast path replay failed: {}", e);
                CycleReport::new(
                    "fast_path",
                    format!(
                        "The learned action no longer works ({}): {}. Clear the action cache if the page changed.",
                        action.locator, e
                    ),
                )
            }
        }
    }

    async fn ask_vision(&self, question: &str) -> CycleReport {
        let Some(page) = &self.page else {
            return CycleReport::new("ask_vision", "Browser not connected.");
        };
        let answer = match self.look(page.as_ref(), question).await {
            Ok(Some(text)) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => VISION_PLACEHOLDER.to_string(),
            Err(e) => {
                warn!("Visual question failed: {}", e);
                VISION_PLACEHOLDER.to_string()
            }
        };
        CycleReport::new("ask_vision", format!("👁️ VISION:\n{answer}"))
    }

    /// Screenshot the viewport and put `question` to the vision backend.
    async fn look(&self, page: &dyn PageHandle, question: &str) -> Result<Option<String>> {
        let Some(vision) = &self.vision else {
            return Ok(None);
        };
        let dir = self.config.screenshots_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("vision_query.png");
        page.screenshot(&path).await?;
        info!("Asking the vision backend about {}", path.display());
        Ok(Some(vision.describe(&path, question).await?))
    }

    async fn navigate(&self, url: &str) -> CycleReport {
        let Some(page) = &self.page else {
            return CycleReport::new("navigate", "Browser not connected.");
        };
        match page.navigate(url).await {
            Ok(()) => CycleReport::new("navigate", format!("Navigating to {url}.")),
            Err(e) => CycleReport::new("navigate", format!("Navigation to {url} failed: {e}")),
        }
    }

    async fn act(
        &self,
        command: &str,
        snapshot: &Snapshot,
        element_id: usize,
        action: ActionKind,
        text: Option<String>,
    ) -> CycleReport {
        let Some(page) = &self.page else {
            return CycleReport::new("act", "Browser not connected.");
        };
        let Some(element) = snapshot.elements.iter().find(|e| e.id == element_id) else {
            return CycleReport::new(
                "act",
                format!("Element [{element_id}] is not on the current page."),
            );
        };
        if action == ActionKind::Type && text.as_deref().is_none_or(str::is_empty) {
            return CycleReport::new("act", "Nothing to type.");
        }

        if let Err(e) = self.mouse.click_at(page.as_ref(), element.center()).await {
            return CycleReport::new("act", format!("Could not click [{element_id}]: {e}"));
        }
        if let (ActionKind::Type, Some(text)) = (action, text.as_deref()) {
            if let Err(e) = page.type_text(text).await {
                return CycleReport::new("act", format!("Could not type into [{element_id}]: {e}"));
            }
        }

        let learned = CachedAction {
            locator: element.locator.clone(),
            action,
            text: text.clone(),
        };
        if let Err(e) = self.memory.save_action(&snapshot.url, command, learned) {
            warn!("Could not save learned action: {}", e);
        }

        let response = match action {
            ActionKind::Click => format!("Clicked \"{}\".", element.text),
            ActionKind::Type => format!(
                "Typed \"{}\" into \"{}\".",
                text.unwrap_or_default(),
                element.text
            ),
        };
        CycleReport::new("act", response)
    }

    async fn run_tool(&self, tool: &str, instruction: &str) -> CycleReport {
        match self.interpreter.execute_action(instruction).await {
            ToolResult::Success { tool, result } => {
                let response = self.synthesizer.synthesize(&result).await;
                let data = serde_json::to_value(&result).unwrap_or(Value::Null);
                CycleReport::new(tool, response).with_data(data)
            }
            ToolResult::Error { message } => {
                CycleReport::new(tool, format!("Execution error: {message}"))
            }
            ToolResult::NoAction => CycleReport::new(NO_TOOL, "No action taken."),
        }
    }

    fn remember(&mut self, command: &str, report: &CycleReport) {
        let limit = self.config.history_lines.max(2);
        self.history.push_back(format!("Operator: {command}"));
        self.history.push_back(format!(
            "Agent ({}): {}",
            report.action_taken,
            truncate_chars(&report.response, HISTORY_ENTRY_CHARS)
        ));
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}
