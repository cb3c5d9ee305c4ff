use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::page::PageHandle;

/// Longest label kept for an element, in characters.
pub const MAX_LABEL_CHARS: usize = 60;

/// JavaScript injected into the page to list interactive candidates.
///
/// Read-only: it measures nodes and builds locators but never touches the
/// DOM. Filtering and labelling happen on the Rust side so the rules stay
/// testable without a browser.
const OBSERVE_JS: &str = r#"
(() => {
  const SELECTOR = 'a, button, input, select, textarea, [role="button"], [role="link"], '
    + '[role="checkbox"], [role="menuitem"], [role="tab"], [role="option"], [tabindex]:not([tabindex^="-"])';

  function locatorFor(el) {
    if (el.id && document.querySelectorAll('#' + CSS.escape(el.id)).length === 1) {
      return '//*[@id="' + el.id + '"]';
    }
    const parts = [];
    let node = el;
    while (node && node.nodeType === Node.ELEMENT_NODE) {
      let index = 1;
      let sib = node.previousElementSibling;
      while (sib) {
        if (sib.nodeName === node.nodeName) index++;
        sib = sib.previousElementSibling;
      }
      parts.unshift(node.nodeName.toLowerCase() + '[' + index + ']');
      node = node.parentNode;
    }
    return parts.length ? '/' + parts.join('/') : null;
  }

  const out = [];
  for (const el of document.querySelectorAll(SELECTOR)) {
    const rect = el.getBoundingClientRect();
    const style = window.getComputedStyle(el);
    out.push({
      tag: el.tagName.toLowerCase(),
      input_type: el.getAttribute('type'),
      inner_text: el.innerText || null,
      value: typeof el.value === 'string' ? el.value : null,
      placeholder: el.getAttribute('placeholder'),
      aria_label: el.getAttribute('aria-label'),
      title: el.getAttribute('title'),
      left: rect.left,
      top: rect.top,
      width: rect.width,
      height: rect.height,
      visibility: style.visibility,
      display: style.display,
      opacity: style.opacity,
      locator: locatorFor(el),
    });
  }
  return out;
})()
"#;

/// One candidate as measured in the page, before filtering.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCandidate {
    pub tag: String,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub inner_text: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub aria_label: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub opacity: Option<String>,
    #[serde(default)]
    pub locator: Option<String>,
}

impl RawCandidate {
    fn is_rendered(&self) -> bool {
        self.width > 0.0
            && self.height > 0.0
            && self.visibility.as_deref() != Some("hidden")
            && self.display.as_deref() != Some("none")
            && self.opacity.as_deref().map(str::trim) != Some("0")
    }

    /// Inputs the operator can fill even when nothing labels them.
    fn is_recognized_input(&self) -> bool {
        match self.tag.as_str() {
            "textarea" => true,
            "input" => !matches!(
                self.input_type.as_deref(),
                Some("hidden") | Some("submit") | Some("button") | Some("image") | Some("reset")
            ),
            _ => false,
        }
    }

    fn label(&self) -> String {
        [
            &self.inner_text,
            &self.value,
            &self.placeholder,
            &self.aria_label,
            &self.title,
        ]
        .into_iter()
        .flatten()
        .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
        .find(|s| !s.is_empty())
        .map(|s| s.chars().take(MAX_LABEL_CHARS).collect())
        .unwrap_or_default()
    }
}

/// An interactive element from one perception snapshot.
///
/// `id` is an ordinal inside its snapshot only; use `locator` to find the
/// same node again later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveElement {
    pub id: usize,
    pub tag: String,
    pub text: String,
    pub x: f64,
    pub y: f64,
    pub locator: String,
}

impl InteractiveElement {
    pub fn center(&self) -> crate::motion::Point {
        crate::motion::Point::new(self.x, self.y)
    }
}

/// Filter raw candidates down to visible, labelled elements with sequential
/// ids. Lazy: nothing is computed until the iterator is consumed.
pub fn interactive_elements(
    raw: impl IntoIterator<Item = RawCandidate>,
) -> impl Iterator<Item = InteractiveElement> {
    raw.into_iter()
        .filter(RawCandidate::is_rendered)
        .filter_map(|c| {
            let text = c.label();
            if text.is_empty() && !c.is_recognized_input() {
                return None;
            }
            let locator = c.locator.clone()?;
            Some((c, text, locator))
        })
        .enumerate()
        .map(|(id, (c, text, locator))| InteractiveElement {
            id,
            tag: c.tag,
            text,
            x: c.left + c.width / 2.0,
            y: c.top + c.height / 2.0,
            locator,
        })
}

/// Compact one-line-per-element view for the model prompt.
pub fn render_for_prompt(elements: &[InteractiveElement], max: usize) -> String {
    let mut lines: Vec<String> = elements
        .iter()
        .take(max)
        .map(|el| format!("[{}] {} \"{}\"", el.id, el.tag, el.text))
        .collect();

    if elements.len() > max {
        lines.push(format!("... [{} more elements omitted]", elements.len() - max));
    }
    lines.join("\n")
}

/// Takes perception snapshots of a live page.
#[derive(Debug, Default, Clone, Copy)]
pub struct DomObserver;

impl DomObserver {
    pub fn new() -> Self {
        Self
    }

    /// Snapshot the current page. Best-effort: any failure is logged and
    /// yields an empty list.
    pub async fn observe(&self, page: &dyn PageHandle) -> Vec<InteractiveElement> {
        let value = match page.evaluate(OBSERVE_JS).await {
            Ok(v) => v,
            Err(e) => {
                warn!("DOM observation failed: {}", e);
                return Vec::new();
            }
        };

        let raw: Vec<RawCandidate> = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("DOM observation returned unexpected data: {}", e);
                return Vec::new();
            }
        };

        let elements: Vec<InteractiveElement> = interactive_elements(raw).collect();
        debug!("Observed {} interactive elements", elements.len());
        elements
    }
}
