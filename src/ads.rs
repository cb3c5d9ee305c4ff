//! Visual extraction from the Google Ads campaign dashboard, read straight
//! off the authenticated page (no API token).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::page::PageHandle;

pub const ADS_DASHBOARD_URL: &str = "https://ads.google.com/aw/campaigns";

const ROW_TEXTS_JS: &str =
    r#"Array.from(document.querySelectorAll("div[role='row']")).map(r => r.innerText || '')"#;
const ROW_COUNT_JS: &str = r#"document.querySelectorAll("div[role='row']").length"#;
const SCROLL_TOP_JS: &str = "window.scrollTo(0, 0)";

const TABLE_WAIT: Duration = Duration::from_secs(15);
const TABLE_POLL: Duration = Duration::from_millis(500);

/// Markers of total, draft and help rows rather than real campaigns.
const SYSTEM_ROW_MARKERS: &[&str] = &["total", "rascunho", "draft", "help_outline", "ajuda"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignRow {
    pub name: String,
    pub status: String,
    pub budget: String,
    pub metrics_raw: String,
}

/// What the dashboard tool hands back: the table plus a KPI screenshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardExtraction {
    pub table_data: Vec<CampaignRow>,
    pub snapshot_path: PathBuf,
}

/// Parse rendered row texts into campaigns, skipping anything that is not a
/// campaign with at least name, status and budget.
pub fn parse_campaign_rows<I, S>(rows: I) -> Vec<CampaignRow>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    rows.into_iter()
        .filter_map(|row| {
            let lines: Vec<&str> = row
                .as_ref()
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect();
            if lines.len() < 3 {
                return None;
            }

            let name = lines[0].to_lowercase();
            if SYSTEM_ROW_MARKERS.iter().any(|m| name.contains(m)) {
                return None;
            }

            Some(CampaignRow {
                name: lines[0].to_string(),
                status: lines[1].to_string(),
                budget: lines[2].to_string(),
                metrics_raw: lines[3..].join(" | "),
            })
        })
        .collect()
}

pub struct VisualAds {
    page: Arc<dyn PageHandle>,
    screenshots_dir: PathBuf,
}

impl VisualAds {
    pub fn new(page: Arc<dyn PageHandle>, screenshots_dir: PathBuf) -> Self {
        Self {
            page,
            screenshots_dir,
        }
    }

    /// Make sure the campaigns view is open and its table has rendered.
    pub async fn navigate_to_campaigns(&self) -> Result<()> {
        let url = self.page.url().await?;
        if !url.contains("campaigns") {
            info!("Navigating to the campaigns dashboard");
            self.page.navigate(ADS_DASHBOARD_URL).await?;
        }

        let settle = 2.0 + rand::random::<f64>() * 3.0;
        tokio::time::sleep(Duration::from_secs_f64(settle)).await;

        let deadline = tokio::time::Instant::now() + TABLE_WAIT;
        loop {
            let rows = self.page.evaluate(ROW_COUNT_JS).await?.as_u64().unwrap_or(0);
            if rows > 0 {
                info!("Campaign table detected ({} rows)", rows);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Campaign table did not appear within {:?}", TABLE_WAIT);
                return Ok(());
            }
            tokio::time::sleep(TABLE_POLL).await;
        }
    }

    pub async fn extract_campaigns_data(&self) -> Result<Vec<CampaignRow>> {
        self.navigate_to_campaigns().await?;

        let texts: Vec<String> = serde_json::from_value(self.page.evaluate(ROW_TEXTS_JS).await?)?;
        let rows = parse_campaign_rows(&texts);
        info!("{} campaigns kept out of {} rows", rows.len(), texts.len());
        Ok(rows)
    }

    /// Screenshot the top of the dashboard, where the KPI cards live.
    pub async fn capture_kpi_snapshot(&self) -> Result<PathBuf> {
        self.page.evaluate(SCROLL_TOP_JS).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;

        tokio::fs::create_dir_all(&self.screenshots_dir).await?;
        let path = self.screenshots_dir.join("kpi_snapshot.png");
        self.page.screenshot(&path).await?;
        info!("KPI snapshot saved to {}", path.display());
        Ok(path)
    }
}
