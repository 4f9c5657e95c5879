//! Scrape executor boundary: turns a listing site into a batch of job records.
//!
//! Executors are synchronous and may take seconds to minutes; the
//! orchestrator runs them on a blocking worker so the request path is never
//! stalled. The bundled [`HtmlListingScraper`] walks paginated listing pages
//! over plain HTTP and extracts job cards with CSS selectors.

use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use seekwatch_core::JobRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "seekwatch-scraper";

/// Effective configuration handed to an executor for one run: config-file
/// defaults with any request-level overrides already merged in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeConfig {
    pub base_url: String,
    pub search_path: String,
    /// Honored by executors that drive a real browser; the plain HTTP
    /// scraper has no window to hide and ignores it.
    pub headless: bool,
    pub max_pages: u32,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.seek.com.au".to_string(),
            search_path: "/jobs-in-human-resources-recruitment".to_string(),
            headless: true,
            max_pages: 5,
            timeout_secs: 30,
            user_agent: "seekwatch/0.1".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("http request failed: {0}")]
    Http(String),
    #[error("unexpected response status {status} for {url}")]
    InvalidResponse { status: u16, url: String },
    #[error("listing page parse failed: {0}")]
    Parse(String),
}

/// External collaborator producing raw job records. Blocking by contract.
pub trait ScrapeExecutor: Send + Sync {
    fn scrape(&self, config: &ScrapeConfig) -> Result<Vec<JobRecord>, ScrapeError>;
}

/// HTTP + CSS-selector scraper for Seek-style listing markup.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlListingScraper;

impl HtmlListingScraper {
    pub fn new() -> Self {
        Self
    }

    fn page_url(config: &ScrapeConfig, page: u32) -> String {
        format!("{}{}?page={page}", config.base_url, config.search_path)
    }
}

impl ScrapeExecutor for HtmlListingScraper {
    fn scrape(&self, config: &ScrapeConfig) -> Result<Vec<JobRecord>, ScrapeError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ScrapeError::Http(e.to_string()))?;

        let mut records = Vec::new();
        for page in 1..=config.max_pages.max(1) {
            let url = Self::page_url(config, page);
            let response = client
                .get(&url)
                .send()
                .map_err(|e| ScrapeError::Http(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(ScrapeError::InvalidResponse {
                    status: status.as_u16(),
                    url,
                });
            }
            let body = response.text().map_err(|e| ScrapeError::Http(e.to_string()))?;

            let page_records = parse_listing_page(&body, &config.base_url)?;
            if page_records.is_empty() {
                break;
            }
            records.extend(page_records);
        }
        Ok(records)
    }
}

struct CardSelectors {
    card: Selector,
    title: Selector,
    company: Selector,
    location: Selector,
    classification: Selector,
    subcategory: Selector,
    salary: Selector,
    posted: Selector,
    job_type: Selector,
    description: Selector,
}

impl CardSelectors {
    fn compile() -> Result<Self, ScrapeError> {
        Ok(Self {
            card: parse_selector(r#"article[data-card-type="JobCard"]"#)?,
            title: parse_selector(r#"a[data-automation="jobTitle"]"#)?,
            company: parse_selector(r#"a[data-automation="jobCompany"]"#)?,
            location: parse_selector(r#"a[data-automation="jobLocation"]"#)?,
            classification: parse_selector(r#"a[data-automation="jobClassification"]"#)?,
            subcategory: parse_selector(r#"a[data-automation="jobSubClassification"]"#)?,
            salary: parse_selector(r#"span[data-automation="jobSalary"]"#)?,
            posted: parse_selector(r#"span[data-automation="jobListingDate"]"#)?,
            job_type: parse_selector(r#"span[data-automation="jobWorkType"]"#)?,
            description: parse_selector(r#"span[data-automation="jobShortDescription"]"#)?,
        })
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(selector).map_err(|e| ScrapeError::Parse(e.to_string()))
}

/// Extract job records from one listing page. Cards without a title link are
/// skipped rather than failing the whole page.
pub fn parse_listing_page(html: &str, base_url: &str) -> Result<Vec<JobRecord>, ScrapeError> {
    let selectors = CardSelectors::compile()?;
    let document = Html::parse_document(html);
    let scraped_at = Utc::now();

    let mut records = Vec::new();
    for card in document.select(&selectors.card) {
        let Some(title) = child_text(&card, &selectors.title) else {
            continue;
        };
        let Some(href) = child_attr(&card, &selectors.title, "href") else {
            continue;
        };
        let job_url = absolute_url(base_url, &href);

        records.push(JobRecord {
            title,
            company: child_text(&card, &selectors.company)
                .unwrap_or_else(|| "Private Advertiser".to_string()),
            location: child_text(&card, &selectors.location).unwrap_or_default(),
            classification: child_text(&card, &selectors.classification).unwrap_or_default(),
            subcategory: child_text(&card, &selectors.subcategory).unwrap_or_default(),
            job_id: extract_job_id(&job_url),
            job_url,
            posted_date: child_text(&card, &selectors.posted),
            salary: child_text(&card, &selectors.salary),
            job_type: child_text(&card, &selectors.job_type),
            description: child_text(&card, &selectors.description),
            scraped_at,
        });
    }
    Ok(records)
}

fn child_text(card: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|node| text_or_none(node.text().collect::<String>()))
}

fn child_attr(card: &ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|node| node.value().attr(attr))
        .and_then(|value| text_or_none(value.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn absolute_url(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), href.trim_start_matches('/'))
    }
}

/// Numeric id from a listing URL, e.g. `/job/12345678?ref=search` -> `12345678`.
pub fn extract_job_id(job_url: &str) -> Option<String> {
    let path = job_url.split(['?', '#']).next().unwrap_or(job_url);
    let last = path.trim_end_matches('/').rsplit('/').next()?;
    let digits: String = last.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}
