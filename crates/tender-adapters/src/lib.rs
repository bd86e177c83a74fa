//! Detail-page extraction: HTML in, validated [`TenderRecord`] out.

use chrono::{DateTime, Utc};
use scraper::Html;
use tender_core::{ErrorKind, TenderRecord};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub mod attachments;
pub mod extract;
pub mod listing;
pub mod normalize;
pub mod sections;
pub mod stages;

pub use extract::{LabelTable, MatchStrategy};
pub use listing::{ListingCrawler, NprocureListingCrawler, StubCursor};
pub use sections::RawFields;

pub const CRATE_NAME: &str = "tender-adapters";

/// First characters of the page kept as `raw_html_snippet` when requested.
pub const RAW_SNIPPET_CHARS: usize = 1000;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("required field(s) not found on page: {}", .0.join(", "))]
    MissingRequired(Vec<&'static str>),
    #[error("required field(s) empty after normalization: {}", .0.join(", "))]
    Invalid(Vec<&'static str>),
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingRequired(_) | Self::Selector { .. } => ErrorKind::ParseError,
            Self::Invalid(_) => ErrorKind::ValidationError,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub source_url: String,
    /// Identifier from the listing row, used when the page omits its own.
    pub tender_id_hint: Option<String>,
    pub keep_raw_snippet: bool,
}

impl ExtractOptions {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            tender_id_hint: None,
            keep_raw_snippet: false,
        }
    }
}

/// Section parsers plus the lower-priority sources (inline script values, page
/// text contacts), merged into one raw map.
pub fn collect_raw_fields(document: &Html, html: &str) -> Result<RawFields, ExtractError> {
    let table = LabelTable::from_html(document)?;
    let mut raw = sections::merge_sections([
        sections::parse_procurement_summary(&table),
        sections::parse_calendar_details(&table),
        sections::parse_amount_details(&table),
        sections::parse_other_details(&table),
    ]);
    sections::fill_missing(&mut raw, sections::parse_script_values(html));

    let page_text = document.root_element().text().collect::<Vec<_>>().join(" ");
    sections::fill_missing(&mut raw, sections::parse_contact_fallback(&page_text));
    Ok(raw)
}

/// Run every extractor over one detail page and produce a validated record.
pub fn extract_tender(
    html: &str,
    opts: &ExtractOptions,
    ingested_at: DateTime<Utc>,
) -> Result<TenderRecord, ExtractError> {
    let document = Html::parse_document(html);
    let mut raw = collect_raw_fields(&document, html)?;

    if let Some(hint) = &opts.tender_id_hint {
        match raw.get("tender_id") {
            None => {
                raw.insert("tender_id", hint.clone());
            }
            Some(on_page) if on_page.trim() != hint => {
                warn!(page_id = %on_page, listing_id = %hint, "tender id on page differs from listing");
            }
            Some(_) => {}
        }
    }

    let mut record = normalize::normalize(&raw, &opts.source_url, ingested_at)?;
    record.stages = stages::assemble_stages(&document)?;

    match Url::parse(&opts.source_url) {
        Ok(base) => record.attachments = attachments::extract_attachments(&document, &base)?,
        Err(err) => warn!(url = %opts.source_url, error = %err, "source url not absolute, skipping attachments"),
    }
    if record.document_count.is_none() && !record.attachments.is_empty() {
        record.document_count = u32::try_from(record.attachments.len()).ok();
    }
    if opts.keep_raw_snippet {
        record.raw_html_snippet = Some(html.chars().take(RAW_SNIPPET_CHARS).collect());
    }

    debug!(
        tender_id = %record.tender_id,
        stages = record.stages.len(),
        attachments = record.attachments.len(),
        "extracted tender"
    );
    Ok(record)
}
