//! Competitive intelligence on the Doctoralia directory.
//!
//! Two ways in: a direct scan of the site's ranking pages, paced like a
//! person reading, and an indirect scan of Google results that never touches
//! the directory itself.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::DOCTORALIA_URL;
use crate::error::{Error, Result};
use crate::page::PageHandle;

const GOOGLE_SEARCH_URL: &str = "https://www.google.com.br/search";
const RESULTS_PER_PAGE: usize = 20;
pub const DEFAULT_MAX_PAGES: usize = 2;

const SERP_LINKS_JS: &str = r#"
(() => Array.from(document.querySelectorAll('div.g a')).map(a => ({
  href: a.getAttribute('href'),
  title: a.innerText || '',
})))()
"#;

const RANKING_CARDS_JS: &str = r#"
(() => Array.from(document.querySelectorAll('li[data-id]')).map(card => {
  const name = card.querySelector('a.rank-element-name');
  return {
    data_id: card.getAttribute('data-id'),
    name: name ? name.textContent : null,
    is_ad: card.querySelector('.badge-ad') !== null,
  };
}))()
"#;

const NEXT_PAGE_JS: &str = r#"document.querySelector("a[aria-label='next']") !== null"#;
const NEXT_PAGE_XPATH: &str = "//a[@aria-label='next']";

const PROFILE_JS: &str = r#"
(() => {
  const text = sel => {
    const el = document.querySelector(sel);
    return el ? el.textContent.trim() : null;
  };
  const all = sel => Array.from(document.querySelectorAll(sel))
    .map(el => el.textContent.trim())
    .filter(t => t.length > 0);
  return {
    name: text('h1') || document.title,
    specialties: all('[data-test-id="doctor-specializations"] a, .doctor-specializations a'),
    rating: text('[data-test-id="rating-value"], .rating-value'),
    review_count: text('[data-test-id="opinions-count"], .opinion-numeral'),
    address: text('[data-test-id="address-info"], .address-details'),
    prices: all('[data-test-id="service-price"], .service-price'),
  };
})()
"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerpResult {
    pub source: String,
    pub title: String,
    pub url: String,
    pub position_on_google: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub rank: usize,
    pub name: String,
    pub is_sponsored: bool,
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProfileReport {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub specialties: Vec<String>,
    #[serde(default)]
    pub rating: Option<String>,
    #[serde(default)]
    pub review_count: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub prices: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SerpLink {
    href: Option<String>,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct RankingCard {
    data_id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    is_ad: bool,
}

fn uniform(lo: f64, hi: f64) -> f64 {
    lo + rand::random::<f64>() * (hi - lo)
}

fn serp_results(links: Vec<SerpLink>) -> Vec<SerpResult> {
    let mut results: Vec<SerpResult> = Vec::new();
    for link in links {
        let Some(href) = link.href else { continue };
        if !href.contains("doctoralia.com.br") {
            continue;
        }
        results.push(SerpResult {
            source: "google_serp".to_string(),
            title: link.title.lines().next().unwrap_or_default().trim().to_string(),
            url: href,
            position_on_google: results.len() + 1,
        });
    }
    results
}

fn ranking_entries(cards: Vec<RankingCard>, page_number: usize) -> Vec<RankingEntry> {
    cards
        .into_iter()
        .enumerate()
        .filter_map(|(index, card)| {
            let name = card.name?.trim().to_string();
            Some(RankingEntry {
                rank: (page_number - 1) * RESULTS_PER_PAGE + index + 1,
                name,
                is_sponsored: card.is_ad,
                id: card.data_id,
            })
        })
        .collect()
}

pub struct DoctoraliaIntel {
    page: Arc<dyn PageHandle>,
}

impl DoctoraliaIntel {
    pub fn new(page: Arc<dyn PageHandle>) -> Self {
        Self { page }
    }

    /// Random pause, as if reading.
    async fn human_delay(&self, min_s: f64, max_s: f64) {
        tokio::time::sleep(Duration::from_secs_f64(uniform(min_s, max_s))).await;
    }

    /// Scroll in uneven blocks rather than one smooth sweep.
    async fn human_scroll(&self) -> Result<()> {
        let blocks = 3 + (rand::random::<f64>() * 4.0) as usize;
        for _ in 0..blocks {
            self.page.scroll_by(0.0, uniform(300.0, 700.0)).await?;
            tokio::time::sleep(Duration::from_secs_f64(uniform(0.5, 1.5))).await;
        }
        Ok(())
    }

    /// Which Doctoralia pages Google ranks for `query`.
    pub async fn scan_via_google_serp(&self, query: &str) -> Result<Vec<SerpResult>> {
        info!("Indirect SERP scan for: {}", query);
        let url = reqwest::Url::parse_with_params(GOOGLE_SEARCH_URL, &[("q", query)])
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;

        self.page.navigate(url.as_str()).await?;
        self.human_delay(2.0, 5.0).await;

        let links: Vec<SerpLink> = serde_json::from_value(self.page.evaluate(SERP_LINKS_JS).await?)?;
        let results = serp_results(links);
        info!("Found {} Doctoralia links on Google", results.len());
        Ok(results)
    }

    /// Walk the directory's own ranking for a specialty in a city. Partial
    /// results survive a failure midway.
    pub async fn scan_ranking_direct(
        &self,
        specialty: &str,
        city: &str,
        max_pages: usize,
    ) -> Result<Vec<RankingEntry>> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/pesquisa", DOCTORALIA_URL),
            &[("filters[specializations][0]", specialty), ("loc", city)],
        )
        .map_err(|e| Error::InvalidResponse(e.to_string()))?;

        info!("Direct ranking scan: {} in {}", specialty, city);
        let mut results = Vec::new();
        if let Err(e) = self.scan_pages(url.as_str(), max_pages, &mut results).await {
            error!("Direct scan stopped early: {}", e);
        }
        Ok(results)
    }

    async fn scan_pages(
        &self,
        url: &str,
        max_pages: usize,
        results: &mut Vec<RankingEntry>,
    ) -> Result<()> {
        self.page.navigate(url).await?;
        self.human_delay(3.0, 6.0).await;

        for page_number in 1..=max_pages {
            info!("Reading ranking page {}", page_number);
            self.human_scroll().await?;

            let cards: Vec<RankingCard> =
                serde_json::from_value(self.page.evaluate(RANKING_CARDS_JS).await?)?;
            results.extend(ranking_entries(cards, page_number));

            let has_next = self.page.evaluate(NEXT_PAGE_JS).await?.as_bool() == Some(true);
            if !has_next || page_number == max_pages {
                break;
            }
            self.human_delay(1.0, 2.0).await;
            self.page.click_locator(NEXT_PAGE_XPATH).await?;
            self.human_delay(2.0, 4.0).await;
        }
        Ok(())
    }

    /// Pull the public facts off a single profile page.
    pub async fn analyze_competitor_profile(&self, url: &str) -> Result<ProfileReport> {
        info!("Analyzing profile {}", url);
        self.page.navigate(url).await?;
        self.human_delay(2.0, 4.0).await;
        self.human_scroll().await?;

        let value = self.page.evaluate(PROFILE_JS).await?;
        let mut report: ProfileReport = serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("Profile page had unexpected shape: {}", e);
            ProfileReport::default()
        });
        report.url = url.to_string();
        Ok(report)
    }
}
