//! The fixed tool catalog and the registry that routes calls to it.
//!
//! The registry does no interpretation: it checks required arguments, calls
//! the capability and returns its output untouched.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

use crate::ads::{DashboardExtraction, VisualAds};
use crate::config::AgentConfig;
use crate::doctoralia::{
    DEFAULT_MAX_PAGES, DoctoraliaIntel, ProfileReport, RankingEntry, SerpResult,
};
use crate::error::{Error, Result};
use crate::page::PageHandle;

/// Sentinel the model uses when no tool applies.
pub const NO_TOOL: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    DoctoraliaRanking,
    DoctoraliaSerp,
    DoctoraliaProfile,
    GoogleAdsVisual,
}

impl ToolName {
    pub const ALL: [ToolName; 4] = [
        Self::DoctoraliaRanking,
        Self::DoctoraliaSerp,
        Self::DoctoraliaProfile,
        Self::GoogleAdsVisual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DoctoraliaRanking => "doctoralia_ranking",
            Self::DoctoraliaSerp => "doctoralia_serp",
            Self::DoctoraliaProfile => "doctoralia_profile",
            Self::GoogleAdsVisual => "google_ads_visual",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::DoctoraliaRanking => {
                "Direct competitive ranking scan on Doctoralia with humanlike browsing. Args: specialty, city."
            }
            Self::DoctoraliaSerp => {
                "Indirect scan through Google Search (safer against blocking). Args: query."
            }
            Self::DoctoraliaProfile => "Analyze a single Doctoralia profile page. Args: url.",
            Self::GoogleAdsVisual => {
                "Extract campaign data and a KPI screenshot from the Google Ads dashboard currently open. No args."
            }
        }
    }

    pub fn required_args(&self) -> &'static [&'static str] {
        match self {
            Self::DoctoraliaRanking => &["specialty", "city"],
            Self::DoctoraliaSerp => &["query"],
            Self::DoctoraliaProfile => &["url"],
            Self::GoogleAdsVisual => &[],
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| Error::UnknownTool(s.to_string()))
    }
}

/// Name → description for every tool, as shown to the model.
pub fn catalog() -> Vec<(&'static str, &'static str)> {
    ToolName::ALL
        .iter()
        .map(|t| (t.as_str(), t.description()))
        .collect()
}

/// The catalog as a JSON object for prompts.
pub fn catalog_json() -> String {
    let map: Map<String, Value> = catalog()
        .into_iter()
        .map(|(name, desc)| (name.to_string(), Value::String(desc.to_string())))
        .collect();
    serde_json::to_string_pretty(&map).unwrap_or_default()
}

/// A validated call into the catalog.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    DoctoraliaRanking { specialty: String, city: String },
    DoctoraliaSerp { query: String },
    DoctoraliaProfile { url: String },
    GoogleAdsVisual,
}

fn required(tool: ToolName, args: &Map<String, Value>, argument: &'static str) -> Result<String> {
    let missing = || Error::MissingArgument {
        tool: tool.as_str(),
        argument,
    };
    match args.get(argument) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(missing()),
    }
}

impl ToolCall {
    /// Validate `args` for the named tool.
    pub fn from_args(name: &str, args: &Map<String, Value>) -> Result<Self> {
        let tool: ToolName = name.parse()?;
        Ok(match tool {
            ToolName::DoctoraliaRanking => Self::DoctoraliaRanking {
                specialty: required(tool, args, "specialty")?,
                city: required(tool, args, "city")?,
            },
            ToolName::DoctoraliaSerp => Self::DoctoraliaSerp {
                query: required(tool, args, "query")?,
            },
            ToolName::DoctoraliaProfile => Self::DoctoraliaProfile {
                url: required(tool, args, "url")?,
            },
            ToolName::GoogleAdsVisual => Self::GoogleAdsVisual,
        })
    }

    pub fn name(&self) -> ToolName {
        match self {
            Self::DoctoraliaRanking { .. } => ToolName::DoctoraliaRanking,
            Self::DoctoraliaSerp { .. } => ToolName::DoctoraliaSerp,
            Self::DoctoraliaProfile { .. } => ToolName::DoctoraliaProfile,
            Self::GoogleAdsVisual => ToolName::GoogleAdsVisual,
        }
    }
}

/// Raw output of a tool, one variant per capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ToolOutput {
    Ranking(Vec<RankingEntry>),
    Serp(Vec<SerpResult>),
    Profile(ProfileReport),
    Dashboard(DashboardExtraction),
}

fn ensure_present(tool: ToolName, argument: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::MissingArgument {
            tool: tool.as_str(),
            argument,
        });
    }
    Ok(())
}

/// Lazily builds page-bound tools on first use. Without a page every tool
/// is unavailable, and calls fail with `BrowserUnavailable`.
pub struct ToolRegistry {
    page: Option<Arc<dyn PageHandle>>,
    screenshots_dir: PathBuf,
    doctoralia: OnceLock<DoctoraliaIntel>,
    ads: OnceLock<VisualAds>,
}

impl ToolRegistry {
    pub fn new(page: Option<Arc<dyn PageHandle>>, config: &AgentConfig) -> Self {
        Self {
            page,
            screenshots_dir: config.screenshots_dir(),
            doctoralia: OnceLock::new(),
            ads: OnceLock::new(),
        }
    }

    pub fn doctoralia(&self) -> Option<&DoctoraliaIntel> {
        let page = self.page.as_ref()?;
        Some(
            self.doctoralia
                .get_or_init(|| DoctoraliaIntel::new(page.clone())),
        )
    }

    pub fn ads(&self) -> Option<&VisualAds> {
        let page = self.page.as_ref()?;
        Some(
            self.ads
                .get_or_init(|| VisualAds::new(page.clone(), self.screenshots_dir.clone())),
        )
    }

    pub async fn run_doctoralia_scan(&self, specialty: &str, city: &str) -> Result<ToolOutput> {
        ensure_present(ToolName::DoctoraliaRanking, "specialty", specialty)?;
        ensure_present(ToolName::DoctoraliaRanking, "city", city)?;
        let intel = self.doctoralia().ok_or(Error::BrowserUnavailable)?;
        let ranking = intel
            .scan_ranking_direct(specialty, city, DEFAULT_MAX_PAGES)
            .await?;
        Ok(ToolOutput::Ranking(ranking))
    }

    pub async fn run_doctoralia_serp(&self, query: &str) -> Result<ToolOutput> {
        ensure_present(ToolName::DoctoraliaSerp, "query", query)?;
        let intel = self.doctoralia().ok_or(Error::BrowserUnavailable)?;
        Ok(ToolOutput::Serp(intel.scan_via_google_serp(query).await?))
    }

    pub async fn run_doctoralia_profile(&self, url: &str) -> Result<ToolOutput> {
        ensure_present(ToolName::DoctoraliaProfile, "url", url)?;
        let intel = self.doctoralia().ok_or(Error::BrowserUnavailable)?;
        Ok(ToolOutput::Profile(intel.analyze_competitor_profile(url).await?))
    }

    pub async fn run_ads_visual_extraction(&self) -> Result<ToolOutput> {
        let ads = self.ads().ok_or(Error::BrowserUnavailable)?;
        let table_data = ads.extract_campaigns_data().await?;
        let snapshot_path = ads.capture_kpi_snapshot().await?;
        Ok(ToolOutput::Dashboard(DashboardExtraction {
            table_data,
            snapshot_path,
        }))
    }

    pub async fn dispatch(&self, call: &ToolCall) -> Result<ToolOutput> {
        let result = match call {
            ToolCall::DoctoraliaRanking { specialty, city } => {
                self.run_doctoralia_scan(specialty, city).await
            }
            ToolCall::DoctoraliaSerp { query } => self.run_doctoralia_serp(query).await,
            ToolCall::DoctoraliaProfile { url } => self.run_doctoralia_profile(url).await,
            ToolCall::GoogleAdsVisual => self.run_ads_visual_extraction().await,
        };
        if let Err(ref e) = result {
            error!(tool = %call.name(), "Tool failed: {}", e);
        }
        result
    }
}
