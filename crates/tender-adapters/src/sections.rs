//! Section parsers: each maps a fixed label list onto raw field keys.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::extract::{LabelTable, MatchStrategy};

/// Raw, un-normalized field values keyed by record field name.
pub type RawFields = BTreeMap<&'static str, String>;

pub const PROCUREMENT_SUMMARY: &[(&str, &str)] = &[
    ("tender_id", "Tender Id"),
    ("ifb_number", "IFB No"),
    ("title", "Name Of Work"),
    ("organization", "Organization"),
    ("department", "Department"),
    ("sub_department", "Sub Department"),
    ("location", "Location"),
    ("tender_type", "Tender Type"),
    ("tender_category", "Tender Category"),
    ("sector_category", "Sector Category"),
    ("tender_status", "Tender Status"),
    ("description", "Description"),
    ("estimated_value", "Estimated Contract Value"),
];

pub const CALENDAR_DETAILS: &[(&str, &str)] = &[
    ("bid_document_download_start", "Bid Document Download Start Date"),
    ("bid_document_download_end", "Bid Document Download End Date"),
    ("bid_submission_start", "Bid Submission Start Date"),
    ("bid_submission_end", "Bid Submission End Date"),
    ("tender_nit_view_date", "Tender NIT View Date"),
    ("pre_bid_meeting", "Pre Bid Meeting Date"),
    ("bid_validity_days", "Bid Validity (Days)"),
    ("remarks", "Remarks"),
];

pub const AMOUNT_DETAILS: &[(&str, &str)] = &[
    ("tender_fee", "Tender Fee"),
    ("tender_fee_payable_to", "Tender Fee Payable To"),
    ("tender_fee_payable_at", "Tender Fee Payable At"),
    ("emd_amount", "EMD Amount"),
    ("emd_payable_to", "EMD Payable To"),
    ("emd_payable_at", "EMD Payable At"),
    ("exempted_fee", "Exempted Fee"),
    ("currency_type", "Currency Type"),
    ("currency_setting", "Currency Setting"),
];

pub const OTHER_DETAILS: &[(&str, &str)] = &[
    ("officer_inviting_bids", "Officer Inviting Bids"),
    ("bid_opening_authority", "Bid Opening Authority"),
    ("address", "Address"),
    ("email", "Email"),
    ("phone", "Phone"),
    ("document_count", "No. of Documents"),
];

fn parse_section(table: &LabelTable, labels: &[(&'static str, &str)]) -> RawFields {
    labels
        .iter()
        .filter_map(|(key, label)| {
            table
                .extract(label, MatchStrategy::Fallback)
                .map(|value| (*key, value))
        })
        .collect()
}

pub fn parse_procurement_summary(table: &LabelTable) -> RawFields {
    parse_section(table, PROCUREMENT_SUMMARY)
}

pub fn parse_calendar_details(table: &LabelTable) -> RawFields {
    parse_section(table, CALENDAR_DETAILS)
}

pub fn parse_amount_details(table: &LabelTable) -> RawFields {
    parse_section(table, AMOUNT_DETAILS)
}

pub fn parse_other_details(table: &LabelTable) -> RawFields {
    parse_section(table, OTHER_DETAILS)
}

/// Union of section outputs. Keys never overlap between sections; an overlap
/// is logged and the later section wins.
pub fn merge_sections(parts: impl IntoIterator<Item = RawFields>) -> RawFields {
    let mut merged = RawFields::new();
    for part in parts {
        for (key, value) in part {
            if let Some(previous) = merged.insert(key, value) {
                warn!(field = key, %previous, "two sections produced the same field");
            }
        }
    }
    merged
}

/// Copy values from `lower` for keys `raw` does not already have.
pub fn fill_missing(raw: &mut RawFields, lower: RawFields) {
    for (key, value) in lower {
        raw.entry(key).or_insert(value);
    }
}

static ECV_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"var\s+ecvvalue\s*=\s*'?([0-9][0-9.,]*)'?").expect("ecvvalue pattern should compile")
});
static TENDER_FEE_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"var\s+tenderfee\s*=\s*'?([0-9][0-9.,]*)'?").expect("tenderfee pattern should compile")
});
static EMD_FEE_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"var\s+emdfee\s*=\s*['"]([^'"]+)['"]"#).expect("emdfee pattern should compile")
});

/// Amounts some pages only carry in inline `<script>` variables.
pub fn parse_script_values(html: &str) -> RawFields {
    let mut raw = RawFields::new();
    for (key, re) in [
        ("estimated_value", &*ECV_VALUE),
        ("tender_fee", &*TENDER_FEE_VALUE),
        ("emd_amount", &*EMD_FEE_VALUE),
    ] {
        if let Some(caps) = re.captures(html) {
            let value = caps[1].trim();
            if !value.is_empty() {
                raw.insert(key, value.to_string());
            }
        }
    }
    raw
}

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\w.+-]+@[\w-]+(?:\.[\w-]+)*\.[A-Za-z]{2,}").expect("email pattern should compile")
});
static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{10}\b").expect("phone pattern should compile")
});
static PHONE_GROUPED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{3,5}[-\s]\d{3}[-\s]?\d{4}\b").expect("grouped phone pattern should compile")
});

/// First email address and phone number found anywhere in the page text.
pub fn parse_contact_fallback(page_text: &str) -> RawFields {
    let mut raw = RawFields::new();
    if let Some(m) = EMAIL.find(page_text) {
        raw.insert("email", m.as_str().to_string());
    }
    if let Some(m) = PHONE.find(page_text).or_else(|| PHONE_GROUPED.find(page_text)) {
        raw.insert("phone", m.as_str().to_string());
    }
    raw
}
