//! Core domain model for tender extraction runs.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "tender-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum TenderType {
    Goods,
    Works,
    Services,
    #[default]
    Unknown,
}

impl TenderType {
    pub const ALL: [TenderType; 4] = [Self::Goods, Self::Works, Self::Services, Self::Unknown];

    /// Case-insensitive match against the closed vocabulary; anything else is `Unknown`.
    pub fn parse(input: &str) -> Self {
        match input.trim().to_ascii_lowercase().as_str() {
            "goods" => Self::Goods,
            "works" => Self::Works,
            "services" => Self::Services,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Goods => "Goods",
            Self::Works => "Works",
            Self::Services => "Services",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for TenderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum TenderStatus {
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "awarded")]
    Awarded,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[default]
    Unknown,
}

impl TenderStatus {
    /// Case-insensitive; `_`, `-` and spaces are interchangeable in `in_progress`.
    pub fn parse(input: &str) -> Self {
        let key = input
            .trim()
            .to_ascii_lowercase()
            .replace(['_', '-'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        match key.as_str() {
            "in progress" => Self::InProgress,
            "awarded" => Self::Awarded,
            "closed" => Self::Closed,
            "cancelled" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Awarded => "awarded",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for TenderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calendar value parsed from the site's `DD-MM-YYYY[ HH:MM]` cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TenderDate {
    DateTime(NaiveDateTime),
    Date(NaiveDate),
}

impl TenderDate {
    pub fn date(&self) -> NaiveDate {
        match self {
            Self::DateTime(dt) => dt.date(),
            Self::Date(d) => *d,
        }
    }
}

/// Money value that could not always be read as a number.
///
/// The source sometimes writes a description ("Exempted", "As per NIT") where
/// an amount is expected; that text is kept as `Unparsed` instead of dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Amount {
    Parsed { value: f64 },
    Unparsed { text: String },
}

impl Amount {
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Parsed { value } => Some(*value),
            Self::Unparsed { .. } => None,
        }
    }

    pub fn is_unparsed(&self) -> bool {
        matches!(self, Self::Unparsed { .. })
    }
}

/// `exempted_fee` is either a yes/no flag or a free-text reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Exemption {
    Flag(bool),
    Reason(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: Option<String>,
    pub size: Option<String>,
    #[serde(rename = "type")]
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContactInfo {
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl ContactInfo {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Form {
    pub form_id: Option<String>,
    pub form_name: Option<String>,
    pub form_mode: Option<String>,
    pub submission_type: Option<String>,
    pub mandatory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub sr_no: Option<u32>,
    pub document_name: Option<String>,
    pub mandatory: bool,
}

/// One evaluation phase of a tender with its forms and required documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub stage_name: String,
    pub evaluation_date: Option<TenderDate>,
    #[serde(default)]
    pub minimum_forms: u32,
    #[serde(default)]
    pub forms: Vec<Form>,
    #[serde(default)]
    pub required_documents: Vec<Document>,
}

/// Canonical tender record produced by normalization and handed to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TenderRecord {
    pub tender_id: String,
    pub source_url: String,
    pub ifb_number: Option<String>,

    pub tender_type: TenderType,
    pub tender_status: TenderStatus,
    pub tender_category: Option<String>,
    pub sector_category: Option<String>,

    pub title: String,
    pub organization: String,
    pub location: Option<String>,
    pub department: Option<String>,
    pub sub_department: Option<String>,
    pub description: Option<String>,

    pub estimated_value: Option<Amount>,
    pub tender_fee: Option<Amount>,
    pub emd_amount: Option<Amount>,
    pub currency_type: Option<String>,
    pub currency_setting: Option<String>,

    pub bid_document_download_start: Option<TenderDate>,
    pub bid_document_download_end: Option<TenderDate>,
    pub bid_submission_start: Option<TenderDate>,
    pub bid_submission_end: Option<TenderDate>,
    pub tender_nit_view_date: Option<TenderDate>,
    pub pre_bid_meeting: Option<TenderDate>,
    pub bid_validity_days: Option<u32>,
    pub remarks: Option<String>,
    pub publish_date: Option<NaiveDate>,
    pub closing_date: Option<NaiveDate>,

    pub tender_fee_payable_to: Option<String>,
    pub tender_fee_payable_at: Option<String>,
    pub emd_payable_to: Option<String>,
    pub emd_payable_at: Option<String>,
    pub exempted_fee: Option<Exemption>,

    pub officer_inviting_bids: Option<String>,
    pub bid_opening_authority: Option<String>,
    pub address: Option<String>,

    pub attachments: Vec<Attachment>,
    pub stages: Vec<Stage>,
    pub contact_info: ContactInfo,

    pub document_count: Option<u32>,
    pub raw_html_snippet: Option<String>,
    pub ingested_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TenderRecord {
    /// Field-by-field comparison that ignores tracking timestamps and the debug snippet.
    pub fn same_content(&self, other: &Self) -> bool {
        self.content_view() == other.content_view()
    }

    fn content_view(&self) -> Self {
        let mut view = self.clone();
        view.ingested_at = DateTime::<Utc>::default();
        view.created_at = None;
        view.updated_at = None;
        view.raw_html_snippet = None;
        view
    }

    /// Names of required fields that are empty. A persisted record must return none.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (name, value) in [
            ("tender_id", &self.tender_id),
            ("title", &self.title),
            ("organization", &self.organization),
            ("source_url", &self.source_url),
        ] {
            if value.trim().is_empty() {
                missing.push(name);
            }
        }
        missing
    }
}

/// Minimal identifying record yielded by the listing crawler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenderStub {
    pub tender_id: String,
    pub source_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NavigationError,
    ParseError,
    ValidationError,
    StorageError,
    ConfigurationError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NavigationError => "NavigationError",
            Self::ParseError => "ParseError",
            Self::ValidationError => "ValidationError",
            Self::StorageError => "StorageError",
            Self::ConfigurationError => "ConfigurationError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted,
    Updated,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-execution counters and error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub scraper_version: String,
    pub config: JsonValue,
    pub pages_visited: u64,
    pub tenders_parsed: u64,
    pub tenders_saved: u64,
    pub failures: u64,
    pub deduped_count: u64,
    pub tender_types_processed: BTreeMap<TenderType, u64>,
    pub error_summary: BTreeMap<ErrorKind, Vec<ErrorEntry>>,
    pub output_file: Option<String>,
}

impl RunMetadata {
    pub fn new(
        run_id: impl Into<String>,
        scraper_version: impl Into<String>,
        config: JsonValue,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            start_time,
            end_time: None,
            duration_seconds: None,
            scraper_version: scraper_version.into(),
            config,
            pages_visited: 0,
            tenders_parsed: 0,
            tenders_saved: 0,
            failures: 0,
            deduped_count: 0,
            tender_types_processed: BTreeMap::new(),
            error_summary: BTreeMap::new(),
            output_file: None,
        }
    }

    pub fn error_count(&self, kind: ErrorKind) -> usize {
        self.error_summary.get(&kind).map(Vec::len).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SearchFilters {
    pub keyword: Option<String>,
    pub organization: Option<String>,
    pub tender_type: Option<TenderType>,
    pub tender_status: Option<TenderStatus>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("{field} must not be negative (got {value})")]
    NegativeValue { field: &'static str, value: f64 },
    #[error("min_value {min} is greater than max_value {max}")]
    InvertedRange { min: f64, max: f64 },
}

impl SearchFilters {
    pub fn has_filters(&self) -> bool {
        self.keyword.is_some()
            || self.organization.is_some()
            || self.tender_type.is_some()
            || self.tender_status.is_some()
            || self.min_value.is_some()
            || self.max_value.is_some()
    }

    pub fn validate(&self) -> Result<(), FilterError> {
        for (field, value) in [("min_value", self.min_value), ("max_value", self.max_value)] {
            if let Some(value) = value {
                if value < 0.0 || value.is_nan() {
                    return Err(FilterError::NegativeValue { field, value });
                }
            }
        }
        if let (Some(min), Some(max)) = (self.min_value, self.max_value) {
            if min > max {
                return Err(FilterError::InvertedRange { min, max });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> TenderRecord {
        TenderRecord {
            tender_id: "271843".into(),
            source_url: "https://tender.nprocure.com/view-nit-home?id=271843".into(),
            title: "Construction of quarters".into(),
            organization: "R&B Division".into(),
            ..Default::default()
        }
    }

    #[test]
    fn enum_parsing_is_case_insensitive_and_closed() {
        assert_eq!(TenderType::parse("WORKS"), TenderType::Works);
        assert_eq!(TenderType::parse(" goods "), TenderType::Goods);
        assert_eq!(TenderType::parse("Consultancy"), TenderType::Unknown);
        assert_eq!(TenderStatus::parse("In Progress"), TenderStatus::InProgress);
        assert_eq!(TenderStatus::parse("IN_PROGRESS"), TenderStatus::InProgress);
        assert_eq!(TenderStatus::parse("Cancelled"), TenderStatus::Cancelled);
        assert_eq!(TenderStatus::parse("pending"), TenderStatus::Unknown);
        assert_eq!(TenderStatus::parse(""), TenderStatus::Unknown);
    }

    #[test]
    fn same_content_ignores_tracking_fields() {
        let a = record();
        let mut b = record();
        b.ingested_at = Utc.with_ymd_and_hms(2026, 2, 1, 16, 45, 0).single().unwrap();
        b.updated_at = Some(b.ingested_at);
        b.raw_html_snippet = Some("<html>".into());
        assert!(a.same_content(&b));

        b.tender_fee = Some(Amount::Parsed { value: 2400.0 });
        assert!(!a.same_content(&b));
    }

    #[test]
    fn missing_required_reports_blank_fields() {
        let mut r = record();
        assert!(r.missing_required().is_empty());
        r.title = "  ".into();
        r.organization.clear();
        assert_eq!(r.missing_required(), vec!["title", "organization"]);
    }

    #[test]
    fn amount_serializes_as_tagged_value() {
        let parsed = serde_json::to_value(Amount::Parsed { value: 2400.0 }).unwrap();
        assert_eq!(parsed, serde_json::json!({"kind": "parsed", "value": 2400.0}));
        let text = serde_json::to_value(Amount::Unparsed { text: "Exempted".into() }).unwrap();
        assert_eq!(text, serde_json::json!({"kind": "unparsed", "text": "Exempted"}));
    }

    #[test]
    fn tender_date_round_trips_both_shapes() {
        let date = TenderDate::Date(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        let dt = TenderDate::DateTime(
            NaiveDate::from_ymd_opt(2026, 2, 10)
                .unwrap()
                .and_hms_opt(18, 0, 0)
                .unwrap(),
        );
        for value in [date, dt] {
            let text = serde_json::to_string(&value).unwrap();
            let back: TenderDate = serde_json::from_str(&text).unwrap();
            assert_eq!(back, value);
        }
        assert_eq!(serde_json::to_string(&date).unwrap(), "\"2026-02-10\"");
    }

    #[test]
    fn run_metadata_error_summary_uses_kind_names() {
        let mut meta = RunMetadata::new("run-1", "0.1.0", JsonValue::Null, Utc::now());
        meta.error_summary.insert(
            ErrorKind::NavigationError,
            vec![ErrorEntry {
                message: "timeout".into(),
                timestamp: Utc::now(),
            }],
        );
        let value = serde_json::to_value(&meta).unwrap();
        assert!(value["error_summary"].get("NavigationError").is_some());
        assert_eq!(meta.error_count(ErrorKind::NavigationError), 1);
    }

    #[test]
    fn filters_reject_inverted_range() {
        let filters = SearchFilters {
            min_value: Some(10.0),
            max_value: Some(5.0),
            ..Default::default()
        };
        assert_eq!(
            filters.validate(),
            Err(FilterError::InvertedRange { min: 10.0, max: 5.0 })
        );
        assert!(SearchFilters::default().validate().is_ok());
        assert!(!SearchFilters::default().has_filters());
    }
}
