//! Type coercion for raw field maps.
//!
//! Every rule here is deterministic and free of I/O: the same raw map and
//! timestamp always produce the same record.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use scraper::Html;
use tender_core::{Amount, ContactInfo, Exemption, TenderDate, TenderRecord, TenderStatus, TenderType};
use tracing::{debug, warn};

use crate::extract::collapse_whitespace;
use crate::sections::RawFields;
use crate::ExtractError;

/// Fields that must be present in the raw map for a record to exist.
pub const REQUIRED_FIELDS: [&str; 3] = ["tender_id", "title", "organization"];

pub const DESCRIPTION_LIMIT: usize = 5000;

static DATE_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{2})-(\d{2})-(\d{4})(?:\s+(\d{2}):(\d{2})(?::(\d{2}))?)?$")
        .expect("date pattern should compile")
});

static NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:\.\d+)?$").expect("numeric pattern should compile"));

static COUNT_WITH_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)(?:\s+[A-Za-z][A-Za-z.()]*)?$").expect("count pattern should compile")
});

static BOILERPLATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(for\s+more\s+details|please\s+visit|click\s+here|download\s+document)")
        .expect("boilerplate pattern should compile")
});

/// Tags stripped, entities decoded, whitespace collapsed; blank becomes `None`.
pub fn clean_text(input: &str) -> Option<String> {
    let text = if input.contains('<') || input.contains('&') {
        let fragment = Html::parse_fragment(input);
        fragment.root_element().text().collect::<String>()
    } else {
        input.to_string()
    };
    let collapsed = collapse_whitespace(&text);
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Accepts `DD-MM-YYYY` and `DD-MM-YYYY HH:MM[:SS]`. Anything else, including
/// impossible calendar values, is `None`.
pub fn parse_tender_date(input: &str) -> Option<TenderDate> {
    let caps = DATE_SHAPE.captures(input.trim())?;
    let num = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<u32>().ok());
    let date = NaiveDate::from_ymd_opt(num(3)? as i32, num(2)?, num(1)?)?;
    match (num(4), num(5)) {
        (Some(hour), Some(minute)) => {
            let time = NaiveTime::from_hms_opt(hour, minute, num(6).unwrap_or(0))?;
            Some(TenderDate::DateTime(NaiveDateTime::new(date, time)))
        }
        _ => Some(TenderDate::Date(date)),
    }
}

/// Strips currency markers and thousands separators. Non-numeric residue keeps
/// the original text as [`Amount::Unparsed`].
pub fn parse_amount(input: &str) -> Option<Amount> {
    let original = collapse_whitespace(input);
    if original.is_empty() {
        return None;
    }

    let mut residue = original.clone();
    for marker in ["₹", "Rs.", "Rs", "INR", "$"] {
        residue = residue.replace(marker, "");
    }
    let residue = residue.replace(',', "");
    let residue = residue.trim().trim_end_matches("/-").trim();

    if NUMERIC.is_match(residue) {
        if let Ok(value) = residue.parse::<f64>() {
            return Some(Amount::Parsed { value });
        }
    }
    Some(Amount::Unparsed { text: original })
}

/// Digits only, optionally followed by a unit word (`90 Days`, `3 Nos`).
pub fn parse_integer(input: &str) -> Option<u32> {
    let caps = COUNT_WITH_UNIT.captures(input.trim())?;
    caps[1].parse().ok()
}

pub fn parse_exemption(input: &str) -> Option<Exemption> {
    let text = clean_text(input)?;
    match text.to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" => Some(Exemption::Flag(true)),
        "no" | "n" | "false" => Some(Exemption::Flag(false)),
        _ => Some(Exemption::Reason(text)),
    }
}

/// Boilerplate tails are cut and the result capped at [`DESCRIPTION_LIMIT`] chars.
pub fn clean_description(input: &str) -> Option<String> {
    let text = clean_text(input)?;
    let kept = match BOILERPLATE.find(&text) {
        Some(m) => &text[..m.start()],
        None => text.as_str(),
    };
    let kept = kept.trim();
    if kept.is_empty() {
        return None;
    }
    if kept.chars().count() > DESCRIPTION_LIMIT {
        let mut capped: String = kept.chars().take(DESCRIPTION_LIMIT).collect();
        capped.push_str("...");
        return Some(capped);
    }
    Some(kept.to_string())
}

const WORKS_KEYWORDS: [&str; 6] = ["construction", "building", "road", "bridge", "repair", "maintenance"];
const GOODS_KEYWORDS: [&str; 5] = ["supply", "purchase", "procurement", "equipment", "goods"];
const SERVICES_KEYWORDS: [&str; 5] = ["consultancy", "service", "management", "operation", "audit"];

/// Keyword vote over free text. Ties go to Works, then Goods.
pub fn infer_tender_type(texts: &[Option<&str>]) -> TenderType {
    let haystack = texts
        .iter()
        .flatten()
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let hits = |keywords: &[&str]| keywords.iter().filter(|kw| haystack.contains(*kw)).count();

    let works = hits(&WORKS_KEYWORDS[..]);
    let goods = hits(&GOODS_KEYWORDS[..]);
    let services = hits(&SERVICES_KEYWORDS[..]);
    let best = works.max(goods).max(services);

    if best == 0 {
        TenderType::Unknown
    } else if works == best {
        TenderType::Works
    } else if goods == best {
        TenderType::Goods
    } else {
        TenderType::Services
    }
}

fn text(raw: &RawFields, key: &str) -> Option<String> {
    raw.get(key).and_then(|v| clean_text(v))
}

fn date(raw: &RawFields, key: &'static str) -> Option<TenderDate> {
    let value = raw.get(key)?;
    let parsed = parse_tender_date(value);
    if parsed.is_none() && clean_text(value).is_some() {
        warn!(field = key, value = %value, "discarding unparsable date");
    }
    parsed
}

fn amount(raw: &RawFields, key: &'static str) -> Option<Amount> {
    let parsed = parse_amount(raw.get(key)?)?;
    if let Amount::Unparsed { text } = &parsed {
        debug!(field = key, value = %text, "keeping non-numeric amount as text");
    }
    Some(parsed)
}

fn integer(raw: &RawFields, key: &'static str) -> Option<u32> {
    let value = raw.get(key)?;
    let parsed = parse_integer(value);
    if parsed.is_none() && clean_text(value).is_some() {
        warn!(field = key, value = %value, "discarding non-numeric integer");
    }
    parsed
}

/// Build a typed record from merged section output.
///
/// A required key absent from `raw` is a parse failure; a required value that
/// is present but normalizes to nothing is a validation failure.
pub fn normalize(
    raw: &RawFields,
    source_url: &str,
    ingested_at: DateTime<Utc>,
) -> Result<TenderRecord, ExtractError> {
    let mut missing: Vec<&'static str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|key| !raw.contains_key(key))
        .collect();
    if source_url.trim().is_empty() {
        missing.push("source_url");
    }
    if !missing.is_empty() {
        return Err(ExtractError::MissingRequired(missing));
    }

    let title = text(raw, "title");
    let organization = text(raw, "organization");
    let description = raw.get("description").and_then(|v| clean_description(v));

    let tender_type = match raw.get("tender_type") {
        Some(value) => TenderType::parse(value),
        None => infer_tender_type(&[
            title.as_deref(),
            organization.as_deref(),
            description.as_deref(),
        ]),
    };
    let tender_status = raw
        .get("tender_status")
        .map(|v| TenderStatus::parse(v))
        .unwrap_or_default();

    let bid_document_download_start = date(raw, "bid_document_download_start");
    let bid_submission_end = date(raw, "bid_submission_end");
    let tender_nit_view_date = date(raw, "tender_nit_view_date");

    let record = TenderRecord {
        tender_id: text(raw, "tender_id").unwrap_or_default(),
        source_url: source_url.trim().to_string(),
        ifb_number: text(raw, "ifb_number"),
        tender_type,
        tender_status,
        tender_category: text(raw, "tender_category"),
        sector_category: text(raw, "sector_category"),
        title: title.unwrap_or_default(),
        organization: organization.unwrap_or_default(),
        location: text(raw, "location"),
        department: text(raw, "department"),
        sub_department: text(raw, "sub_department"),
        description,
        estimated_value: amount(raw, "estimated_value"),
        tender_fee: amount(raw, "tender_fee"),
        emd_amount: amount(raw, "emd_amount"),
        currency_type: text(raw, "currency_type"),
        currency_setting: text(raw, "currency_setting"),
        bid_document_download_start,
        bid_document_download_end: date(raw, "bid_document_download_end"),
        bid_submission_start: date(raw, "bid_submission_start"),
        bid_submission_end,
        tender_nit_view_date,
        pre_bid_meeting: date(raw, "pre_bid_meeting"),
        bid_validity_days: integer(raw, "bid_validity_days"),
        remarks: text(raw, "remarks"),
        publish_date: tender_nit_view_date
            .or(bid_document_download_start)
            .map(|d| d.date()),
        closing_date: bid_submission_end.map(|d| d.date()),
        tender_fee_payable_to: text(raw, "tender_fee_payable_to"),
        tender_fee_payable_at: text(raw, "tender_fee_payable_at"),
        emd_payable_to: text(raw, "emd_payable_to"),
        emd_payable_at: text(raw, "emd_payable_at"),
        exempted_fee: raw.get("exempted_fee").and_then(|v| parse_exemption(v)),
        officer_inviting_bids: text(raw, "officer_inviting_bids"),
        bid_opening_authority: text(raw, "bid_opening_authority"),
        address: text(raw, "address"),
        attachments: Vec::new(),
        stages: Vec::new(),
        contact_info: ContactInfo {
            email: text(raw, "email"),
            phone: text(raw, "phone"),
        },
        document_count: integer(raw, "document_count"),
        raw_html_snippet: None,
        ingested_at,
        created_at: None,
        updated_at: None,
    };

    validate(&record)?;
    Ok(record)
}

/// Required-field invariant for a record about to be persisted.
pub fn validate(record: &TenderRecord) -> Result<(), ExtractError> {
    let blank = record.missing_required();
    if blank.is_empty() {
        Ok(())
    } else {
        Err(ExtractError::Invalid(blank))
    }
}
