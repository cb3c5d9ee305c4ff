use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::{ActionKind, CachedAction};
use crate::tools::NO_TOOL;

/// What the decision engine settled on for one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Replay a cached low-level action without asking the model.
    FastPath(CachedAction),
    Navigate { url: String },
    /// Act on an element of the current perception snapshot.
    Act {
        element_id: usize,
        action: ActionKind,
        text: Option<String>,
    },
    /// Run a catalog tool. The name is checked by the interpreter.
    Tool {
        tool: String,
        args: Map<String, Value>,
    },
    /// Answer a question about the current screen from a screenshot.
    AskVision { question: String },
    /// Present analysis the model produced instead of a tool run.
    Extract { analysis: String },
    Reply { text: String },
    /// `tool: "none"`: nothing to do, with the reason shown to the operator.
    NoAction { reason: String },
}

impl Decision {
    pub fn no_action(reason: impl Into<String>) -> Self {
        Self::NoAction {
            reason: reason.into(),
        }
    }

    /// Short label for logs and the console.
    pub fn label(&self) -> String {
        match self {
            Self::FastPath(_) => "fast_path".to_string(),
            Self::Navigate { .. } => "navigate".to_string(),
            Self::Act { .. } => "act".to_string(),
            Self::Tool { tool, .. } => tool.clone(),
            Self::AskVision { .. } => "ask_vision".to_string(),
            Self::Extract { .. } => "extract".to_string(),
            Self::Reply { .. } => "reply".to_string(),
            Self::NoAction { .. } => NO_TOOL.to_string(),
        }
    }

    /// The tool name carried by this decision, `"none"` for everything that
    /// is not a tool run.
    pub fn tool_name(&self) -> &str {
        match self {
            Self::Tool { tool, .. } => tool,
            _ => NO_TOOL,
        }
    }

    /// JSON handed to the interpreter for tool decisions.
    pub fn to_instruction(&self) -> Option<String> {
        match self {
            Self::Tool { tool, args } => {
                Some(serde_json::json!({ "tool": tool, "args": args }).to_string())
            }
            _ => None,
        }
    }
}

/// Asked when the model wants a look at the screen but names no question.
pub const DEFAULT_VISION_QUESTION: &str = "Describe what is on this screen.";

/// The shape the model is asked to answer in. Every field is optional
/// because local models drift.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawDecision {
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub text: Option<String>,
}

impl RawDecision {
    fn arg_str(&self, key: &str) -> Option<String> {
        match self.args.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }

    fn reply_text(&self) -> Option<String> {
        self.arg_str("text")
            .or_else(|| self.text.clone().filter(|t| !t.trim().is_empty()))
            .or_else(|| self.arg_str("reply"))
    }

    pub fn into_decision(self) -> Decision {
        let intent = self
            .intent
            .as_deref()
            .map(|i| i.trim().to_uppercase())
            .unwrap_or_default();

        match intent.as_str() {
            "REPLY" => {
                return match self.reply_text() {
                    Some(text) => Decision::Reply { text },
                    None => Decision::no_action("The model replied with no text."),
                };
            }
            "NAVIGATE" => {
                return match self.arg_str("url") {
                    Some(url) => Decision::Navigate { url },
                    None => Decision::no_action("Navigation requested without a URL."),
                };
            }
            "ACT" | "CLICK" | "TYPE" => return self.into_act(&intent),
            "ASK_VISION" => {
                let question = self
                    .arg_str("question")
                    .or_else(|| self.reply_text())
                    .unwrap_or_else(|| DEFAULT_VISION_QUESTION.to_string());
                return Decision::AskVision { question };
            }
            "EXTRACT" => {
                if let Some(analysis) = self.arg_str("data").or_else(|| self.reply_text()) {
                    return Decision::Extract { analysis };
                }
            }
            _ => {}
        }

        match self.tool.as_deref().map(str::trim) {
            Some(tool) if !tool.is_empty() && tool != NO_TOOL => Decision::Tool {
                tool: tool.to_string(),
                args: self.args,
            },
            _ => match self.reply_text() {
                Some(text) => Decision::Reply { text },
                None => Decision::no_action("I could not decide on an action for that command."),
            },
        }
    }

    fn into_act(self, intent: &str) -> Decision {
        let element_id = match self.args.get("id") {
            Some(Value::Number(n)) => n.as_u64().map(|n| n as usize),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        let Some(element_id) = element_id else {
            return Decision::no_action("Element action requested without an element id.");
        };

        let wants_type = intent == "TYPE"
            || self
                .arg_str("action")
                .is_some_and(|a| a.eq_ignore_ascii_case("type"));
        let text = self.arg_str("text");

        Decision::Act {
            element_id,
            action: if wants_type {
                ActionKind::Type
            } else {
                ActionKind::Click
            },
            text,
        }
    }
}

/// Find the first balanced `{...}` block in `text`, honouring string
/// literals so braces inside quoted values do not end the block early.
fn first_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Strict parse first, then one attempt on the first bracketed block found
/// in the text. Only JSON objects count.
pub fn extract_json_block(text: &str) -> Option<Map<String, Value>> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text.trim()) {
        return Some(map);
    }
    match serde_json::from_str::<Value>(first_object_span(text)?) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Parse a raw model response into a decision. Unparseable output becomes a
/// `tool: "none"` decision.
pub fn parse_decision(raw: &str) -> Decision {
    let Some(map) = extract_json_block(raw) else {
        return Decision::no_action("I could not understand the model's answer.");
    };
    match serde_json::from_value::<RawDecision>(Value::Object(map)) {
        Ok(raw) => raw.into_decision(),
        Err(_) => Decision::no_action("I could not understand the model's answer."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_becomes_no_action() {
        let decision = parse_decision("not json at all");
        assert_eq!(decision.tool_name(), "none");
        assert!(matches!(decision, Decision::NoAction { .. }));
    }

    #[test]
    fn test_strict_tool_decision() {
        let decision =
            parse_decision(r#"{"tool": "doctoralia_serp", "args": {"query": "psicologo goiania"}}"#);
        match decision {
            Decision::Tool { tool, args } => {
                assert_eq!(tool, "doctoralia_serp");
                assert_eq!(args["query"], "psicologo goiania");
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_fallback_extracts_embedded_object() {
        let raw = "Sure! Here you go:\n```json\n{\"intent\": \"REPLY\", \"args\": {\"text\": \"Olá {Maestro}\"}}\n```\nAnything else?";
        assert_eq!(
            parse_decision(raw),
            Decision::Reply {
                text: "Olá {Maestro}".into()
            }
        );
    }

    #[test]
    fn test_fallback_runs_once() {
        // The first block is malformed; later valid blocks are not searched.
        let raw = r#"{"tool": oops} then {"tool": "google_ads_visual"}"#;
        assert!(extract_json_block(raw).is_none());
    }

    #[test]
    fn test_none_tool_with_text_is_reply() {
        let decision = parse_decision(r#"{"tool": "none", "args": {"text": "Nada a fazer."}}"#);
        assert_eq!(
            decision,
            Decision::Reply {
                text: "Nada a fazer.".into()
            }
        );
        let empty = parse_decision(r#"{"tool": "none", "args": {}}"#);
        assert!(matches!(empty, Decision::NoAction { .. }));
    }

    #[test]
    fn test_act_and_navigate_intents() {
        assert_eq!(
            parse_decision(r#"{"intent": "ACT", "args": {"id": 3, "action": "type", "text": "hipnose"}}"#),
            Decision::Act {
                element_id: 3,
                action: ActionKind::Type,
                text: Some("hipnose".into())
            }
        );
        assert_eq!(
            parse_decision(r#"{"intent": "click", "args": {"id": "7"}}"#),
            Decision::Act {
                element_id: 7,
                action: ActionKind::Click,
                text: None
            }
        );
        assert_eq!(
            parse_decision(r#"{"intent": "NAVIGATE", "args": {"url": "https://ads.google.com"}}"#),
            Decision::Navigate {
                url: "https://ads.google.com".into()
            }
        );
    }

    #[test]
    fn test_ask_vision_intent() {
        let decision = parse_decision(
            r#"{"intent": "ASK_VISION", "args": {"question": "Há algum alerta vermelho?"}}"#,
        );
        assert_eq!(
            decision,
            Decision::AskVision {
                question: "Há algum alerta vermelho?".into()
            }
        );
        assert_eq!(decision.label(), "ask_vision");
        assert_eq!(decision.tool_name(), "none");

        assert_eq!(
            parse_decision(r#"{"intent": "ask_vision", "args": {}}"#),
            Decision::AskVision {
                question: DEFAULT_VISION_QUESTION.into()
            }
        );
    }

    #[test]
    fn test_non_object_json_is_rejected() {
        assert!(extract_json_block("[1, 2, 3]").is_none());
        assert!(extract_json_block("\"just a string\"").is_none());
    }

    #[test]
    fn test_instruction_round_trips_through_parser() {
        let decision = parse_decision(r#"{"tool": "doctoralia_profile", "args": {"url": "https://x"}}"#);
        let instruction = decision.to_instruction().unwrap();
        assert_eq!(parse_decision(&instruction), decision);
    }
}
