//! Turns raw tool output into a report for the operator.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{info, warn};

use crate::ads::{CampaignRow, DashboardExtraction};
use crate::decision::{Decision, parse_decision};
use crate::doctoralia::{ProfileReport, RankingEntry, SerpResult};
use crate::llm::{GenerateRequest, InferenceBackend, VisionBackend};
use crate::tools::ToolOutput;

pub const VISION_PLACEHOLDER: &str = "Visual analysis unavailable.";
pub const ADVICE_PLACEHOLDER: &str =
    "The visual analysis finished, but the strategic feedback timed out. Try again.";

const VISION_PROMPT: &str = "Summarize the Clicks and Impressions figures on this screen. \
Is there any warning, error or pending configuration?";

const ADVICE_SYSTEM: &str = "You are a senior paid-traffic strategist. Answer ONLY with JSON in the form \
{\"intent\": \"REPLY\", \"args\": {\"text\": \"<one short piece of advice>\"}}.";

/// Material icon ligatures that leak into row text from the dashboard UI.
const UI_ICON_TOKENS: &[&str] = &[
    "expand_more",
    "expand_less",
    "more_vert",
    "arrow_drop_down",
    "arrow_drop_up",
    "help_outline",
    "keyboard_arrow_down",
    "chevron_right",
];

/// Rows with names this short are icons or column labels, not campaigns.
const MIN_CAMPAIGN_NAME_CHARS: usize = 5;

const MAX_LISTED: usize = 10;

/// Drop rows that are interface chrome rather than campaigns.
pub fn filter_interface_rows(rows: &[CampaignRow]) -> Vec<&CampaignRow> {
    rows.iter()
        .filter(|r| r.name.chars().count() > MIN_CAMPAIGN_NAME_CHARS)
        .filter(|r| !UI_ICON_TOKENS.iter().any(|t| r.name.contains(t)))
        .collect()
}

pub struct Synthesizer {
    llm: Arc<dyn InferenceBackend>,
    vision: Option<Arc<dyn VisionBackend>>,
    model: String,
}

impl Synthesizer {
    pub fn new(
        llm: Arc<dyn InferenceBackend>,
        vision: Option<Arc<dyn VisionBackend>>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            vision,
            model: model.into(),
        }
    }

    pub async fn synthesize(&self, output: &ToolOutput) -> String {
        match output {
            ToolOutput::Dashboard(extraction) => self.dashboard_report(extraction).await,
            ToolOutput::Ranking(entries) => ranking_summary(entries),
            ToolOutput::Serp(results) => serp_summary(results),
            ToolOutput::Profile(profile) => profile_summary(profile),
        }
    }

    async fn dashboard_report(&self, extraction: &DashboardExtraction) -> String {
        let rows = filter_interface_rows(&extraction.table_data);
        let visual = self.visual_analysis(extraction).await;

        let mut report = String::from("📊 GOOGLE ADS STRATEGIC AUDIT\n\n");
        let _ = writeln!(report, "Active campaigns identified: {}", rows.len());
        for row in &rows {
            let _ = writeln!(
                report,
                "- {}: status {} | budget {}",
                row.name, row.status, row.budget
            );
        }
        let _ = write!(report, "\n👁️ VISUAL ANALYSIS:\n{}\n", visual);
        let _ = write!(report, "\n💡 SPECIALIST INSIGHT:\n");
        report.push_str(&self.advice(&rows, &visual).await);
        report
    }

    async fn visual_analysis(&self, extraction: &DashboardExtraction) -> String {
        let Some(vision) = &self.vision else {
            return VISION_PLACEHOLDER.to_string();
        };
        if !extraction.snapshot_path.exists() {
            return VISION_PLACEHOLDER.to_string();
        }

        info!("Requesting qualitative analysis of the KPI snapshot");
        match vision.describe(&extraction.snapshot_path, VISION_PROMPT).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => VISION_PLACEHOLDER.to_string(),
            Err(e) => {
                warn!("Vision backend failed: {}", e);
                VISION_PLACEHOLDER.to_string()
            }
        }
    }

    async fn advice(&self, rows: &[&CampaignRow], visual: &str) -> String {
        let campaigns: Vec<String> = rows
            .iter()
            .map(|r| format!("{} ({}, {}, {})", r.name, r.status, r.budget, r.metrics_raw))
            .collect();
        let prompt = format!(
            "Based on these campaigns: [{}] and this visual reading: {}, give one short strategic piece of advice.",
            campaigns.join("; "),
            visual
        );
        let request = GenerateRequest::new(self.model.clone(), prompt)
            .with_system(ADVICE_SYSTEM)
            .json();

        match self.llm.generate(request).await {
            Ok(raw) => match parse_decision(&raw) {
                Decision::Reply { text } | Decision::Extract { analysis: text } => text,
                _ => ADVICE_PLACEHOLDER.to_string(),
            },
            Err(e) => {
                warn!("Advisory completion failed: {}", e);
                ADVICE_PLACEHOLDER.to_string()
            }
        }
    }
}

fn ranking_summary(entries: &[RankingEntry]) -> String {
    let mut summary = format!(
        "Doctoralia ranking scan complete. {} results found.",
        entries.len()
    );
    for entry in entries.iter().take(MAX_LISTED) {
        let _ = write!(summary, "\n{}. {}", entry.rank, entry.name);
        if entry.is_sponsored {
            summary.push_str(" [sponsored]");
        }
    }
    summary
}

fn serp_summary(results: &[SerpResult]) -> String {
    let mut summary = format!(
        "Google scan complete. {} Doctoralia results found.",
        results.len()
    );
    for result in results.iter().take(MAX_LISTED) {
        let _ = write!(
            summary,
            "\n#{} {} ({})",
            result.position_on_google, result.title, result.url
        );
    }
    summary
}

fn profile_summary(profile: &ProfileReport) -> String {
    let mut summary = format!("Profile analyzed: {}", profile.url);
    if !profile.name.is_empty() {
        let _ = write!(summary, "\nName: {}", profile.name);
    }
    if !profile.specialties.is_empty() {
        let _ = write!(summary, "\nSpecialties: {}", profile.specialties.join(", "));
    }
    if let Some(rating) = &profile.rating {
        let _ = write!(summary, "\nRating: {}", rating);
    }
    if let Some(reviews) = &profile.review_count {
        let _ = write!(summary, "\nReviews: {}", reviews);
    }
    if let Some(address) = &profile.address {
        let _ = write!(summary, "\nAddress: {}", address);
    }
    if !profile.prices.is_empty() {
        let _ = write!(summary, "\nPrices: {}", profile.prices.join(", "));
    }
    summary
}
