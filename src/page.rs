use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::motion::Point;

/// The live page the agent perceives and acts on.
///
/// The core never launches or closes the page; whoever owns the browser hands
/// one of these in. Every method is a suspension point.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Current URL, or an empty string before the first navigation.
    async fn url(&self) -> Result<String>;

    async fn navigate(&self, url: &str) -> Result<()>;

    /// Evaluate a script and return its value as JSON (`Null` when the
    /// script yields nothing serialisable).
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    /// Resolve an XPath locator and click the first match.
    async fn click_locator(&self, locator: &str) -> Result<()>;

    /// Resolve an XPath locator, clear it and type `text` into it.
    async fn fill_locator(&self, locator: &str, text: &str) -> Result<()>;

    async fn mouse_move(&self, to: Point) -> Result<()>;

    async fn mouse_click(&self, at: Point) -> Result<()>;

    /// Type into whatever currently has keyboard focus.
    async fn type_text(&self, text: &str) -> Result<()>;

    /// Capture the viewport as PNG into `path`.
    async fn screenshot(&self, path: &Path) -> Result<()>;

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()>;
}
