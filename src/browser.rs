//! Chrome-backed [`PageHandle`]. headless_chrome is synchronous, so every
//! driver call hops onto tokio's blocking pool.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use headless_chrome::browser::tab::point::Point as ChromePoint;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::motion::Point;
use crate::page::PageHandle;

pub const DEFAULT_DEBUG_PORT: u16 = 9222;
pub const WINDOW_SIZE: (u32, u32) = (1280, 720);

const LOCATOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a blocking driver call against the tab.
async fn blocking<T, F>(tab: &Arc<Tab>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
{
    let tab = tab.clone();
    tokio::task::spawn_blocking(move || f(&tab))
        .await
        .map_err(|e| Error::Browser(anyhow!("browser task panicked: {e}")))?
        .map_err(Error::Browser)
}

fn chrome_point(p: Point) -> ChromePoint {
    ChromePoint { x: p.x, y: p.y }
}

/// One Chrome tab seen through [`PageHandle`].
pub struct ChromePage {
    tab: Arc<Tab>,
}

impl ChromePage {
    pub fn new(tab: Arc<Tab>) -> Self {
        Self { tab }
    }
}

#[async_trait]
impl PageHandle for ChromePage {
    async fn url(&self) -> Result<String> {
        blocking(&self.tab, |tab| Ok(tab.get_url())).await
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        blocking(&self.tab, move |tab| {
            tab.navigate_to(&url)?.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        // Objects only come back by value once serialised in the page.
        let wrapped = format!("JSON.stringify(({}))", script.trim());
        let remote = blocking(&self.tab, move |tab| Ok(tab.evaluate(&wrapped, true)?)).await?;

        match remote.value {
            Some(serde_json::Value::String(json)) => Ok(serde_json::from_str(&json)?),
            _ => Ok(serde_json::Value::Null),
        }
    }

    async fn click_locator(&self, locator: &str) -> Result<()> {
        let locator = locator.to_string();
        blocking(&self.tab, move |tab| {
            tab.wait_for_xpath_with_custom_timeout(&locator, LOCATOR_TIMEOUT)
                .with_context(|| format!("locator not found: {locator}"))?
                .click()?;
            Ok(())
        })
        .await
    }

    async fn fill_locator(&self, locator: &str, text: &str) -> Result<()> {
        let locator = locator.to_string();
        let text = text.to_string();
        blocking(&self.tab, move |tab| {
            let element = tab
                .wait_for_xpath_with_custom_timeout(&locator, LOCATOR_TIMEOUT)
                .with_context(|| format!("locator not found: {locator}"))?;
            element.call_js_fn("function() { this.value = ''; }", vec![], false)?;
            element.type_into(&text)?;
            Ok(())
        })
        .await
    }

    async fn mouse_move(&self, to: Point) -> Result<()> {
        blocking(&self.tab, move |tab| {
            tab.move_mouse_to_point(chrome_point(to))?;
            Ok(())
        })
        .await
    }

    async fn mouse_click(&self, at: Point) -> Result<()> {
        blocking(&self.tab, move |tab| {
            tab.click_point(chrome_point(at))?;
            Ok(())
        })
        .await
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        let text = text.to_string();
        blocking(&self.tab, move |tab| {
            tab.type_str(&text)?;
            Ok(())
        })
        .await
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        let png = blocking(&self.tab, |tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
        })
        .await?;
        tokio::fs::write(path, png).await?;
        Ok(())
    }

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()> {
        self.evaluate(&format!("window.scrollBy({dx}, {dy})")).await?;
        Ok(())
    }
}

/// How to get hold of a browser.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    /// Attach to a Chrome already listening on this debug port first.
    pub attach_port: Option<u16>,
    pub headless: bool,
    pub profile_dir: PathBuf,
}

/// Owns the browser for as long as the agent runs.
pub struct BrowserSession {
    _browser: Browser,
    page: Arc<ChromePage>,
}

impl BrowserSession {
    /// Attach when a debug port is given and answers, otherwise launch Chrome
    /// on the persistent profile so logins survive restarts. Blocking.
    pub fn launch(settings: &LaunchSettings) -> anyhow::Result<Self> {
        if let Some(port) = settings.attach_port {
            info!("Attempting to attach to Chrome on port {}", port);
            match Browser::connect(format!("http://127.0.0.1:{port}")) {
                Ok(browser) => {
                    let existing = browser
                        .get_tabs()
                        .lock()
                        .ok()
                        .and_then(|tabs| tabs.first().cloned());
                    let tab = match existing {
                        Some(tab) => tab,
                        None => browser.new_tab()?,
                    };
                    info!("Attached to running Chrome");
                    return Ok(Self {
                        _browser: browser,
                        page: Arc::new(ChromePage::new(tab)),
                    });
                }
                Err(e) => warn!("Could not attach ({}), launching a new browser", e),
            }
        }

        std::fs::create_dir_all(&settings.profile_dir)?;
        let options = LaunchOptions {
            headless: settings.headless,
            path: find_chrome(),
            user_data_dir: Some(settings.profile_dir.clone()),
            window_size: Some(WINDOW_SIZE),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(60 * 60),
            ..Default::default()
        };

        info!(profile = %settings.profile_dir.display(), "Starting Chrome");
        let browser = Browser::new(options).context("browser launch failed")?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        info!("Chrome ready");

        Ok(Self {
            _browser: browser,
            page: Arc::new(ChromePage::new(tab)),
        })
    }

    pub fn page(&self) -> Arc<ChromePage> {
        self.page.clone()
    }
}

/// Locate a Chrome binary. `None` lets headless_chrome fall back to its own
/// search.
fn find_chrome() -> Option<PathBuf> {
    if let Ok(path) = headless_chrome::browser::default_executable() {
        return Some(path);
    }

    let mut candidates = vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
    ];
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(local.join("Google").join("Chrome").join("Application").join("chrome.exe"));
    }
    candidates.into_iter().find(|p| p.exists())
}
