use std::path::PathBuf;

use chrono::{NaiveDate, TimeZone, Utc};
use tender_adapters::{extract_tender, listing, ExtractOptions};
use tender_core::{Amount, ErrorKind, Exemption, TenderDate, TenderStatus, TenderType};
use url::Url;

fn fixture(rel: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(rel);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn opts(id: &str) -> ExtractOptions {
    ExtractOptions::new(format!("https://tender.nprocure.com/view-nit-home?id={id}"))
}

#[test]
fn full_detail_page_extracts_every_section() {
    let ingested_at = Utc.with_ymd_and_hms(2026, 2, 1, 16, 45, 0).single().expect("ts");
    let record = extract_tender(&fixture("detail/271843.html"), &opts("271843"), ingested_at)
        .expect("record");

    assert_eq!(record.tender_id, "271843");
    assert_eq!(record.ifb_number.as_deref(), Some("RB/DIV-2/12/2025-26"));
    assert_eq!(record.title, "Construction of staff quarters at Gandhinagar");
    assert_eq!(record.organization, "Roads & Buildings Department");
    assert_eq!(record.department.as_deref(), Some("R&B Division No. 2"));
    assert_eq!(record.sub_department.as_deref(), Some("Sub Division Kalol"));
    assert_eq!(record.tender_type, TenderType::Works);
    assert_eq!(record.tender_status, TenderStatus::InProgress);
    assert_eq!(
        record.description.as_deref(),
        Some("Construction of G+4 staff quarters including internal electrification.")
    );

    // Table has no contract value; the inline script supplies it.
    assert_eq!(record.estimated_value, Some(Amount::Parsed { value: 12_500_000.0 }));
    assert_eq!(record.tender_fee, Some(Amount::Parsed { value: 2400.0 }));
    assert_eq!(record.emd_amount, Some(Amount::Unparsed { text: "Exempted".into() }));
    assert_eq!(record.exempted_fee, Some(Exemption::Flag(true)));
    assert_eq!(record.currency_setting.as_deref(), Some("INR"));

    let end = NaiveDate::from_ymd_opt(2026, 2, 10).expect("date");
    assert_eq!(
        record.bid_submission_end,
        Some(TenderDate::DateTime(end.and_hms_opt(18, 0, 0).expect("time")))
    );
    assert_eq!(
        record.tender_nit_view_date,
        Some(TenderDate::Date(NaiveDate::from_ymd_opt(2026, 1, 31).expect("date")))
    );
    assert_eq!(record.pre_bid_meeting, None);
    assert_eq!(record.bid_validity_days, Some(120));
    assert_eq!(record.remarks.as_deref(), Some("Bids to be submitted online only."));
    assert_eq!(record.publish_date, NaiveDate::from_ymd_opt(2026, 1, 31));
    assert_eq!(record.closing_date, Some(end));

    assert_eq!(record.contact_info.email.as_deref(), Some("ee.rnb2@gujarat.gov.in"));
    assert_eq!(record.contact_info.phone.as_deref(), Some("9876543210"));
    assert_eq!(
        record.address.as_deref(),
        Some("Block 14, 2nd Floor, Sachivalaya, Gandhinagar")
    );

    assert_eq!(record.stages.len(), 2);
    assert_eq!(record.stages[0].stage_name, "Preliminary");
    assert_eq!(record.stages[0].forms.len(), 1);
    assert_eq!(record.stages[0].required_documents.len(), 2);
    assert!(!record.stages[0].required_documents[1].mandatory);
    assert_eq!(record.stages[1].minimum_forms, 2);
    assert!(!record.stages[1].forms[1].mandatory);

    assert_eq!(record.attachments.len(), 2);
    assert_eq!(record.attachments[1].file_type.as_deref(), Some("xlsx"));
    assert_eq!(record.attachments[0].size.as_deref(), Some("245 KB"));
    assert_eq!(record.document_count, Some(2));
    assert_eq!(record.raw_html_snippet, None);
    assert_eq!(record.ingested_at, ingested_at);
    assert!(record.missing_required().is_empty());
}

#[test]
fn sparse_page_infers_type_and_nulls_bad_values() {
    let mut options = opts("271901");
    options.keep_raw_snippet = true;
    let record = extract_tender(&fixture("detail/271901_sparse.html"), &options, Utc::now())
        .expect("record");

    assert_eq!(record.tender_type, TenderType::Goods);
    assert_eq!(record.tender_status, TenderStatus::Awarded);
    assert_eq!(record.estimated_value, Some(Amount::Parsed { value: 850_000.0 }));
    assert_eq!(record.emd_amount, Some(Amount::Unparsed { text: "As per NIT".into() }));
    assert_eq!(record.bid_submission_end, None);
    assert_eq!(record.closing_date, None);
    assert_eq!(record.document_count, None);
    assert!(record.stages.is_empty());
    assert!(record.attachments.is_empty());
    assert_eq!(
        record.contact_info.email.as_deref(),
        Some("stores.hfw@gujarat.gov.in")
    );
    let snippet = record.raw_html_snippet.expect("snippet kept");
    assert!(snippet.starts_with("<!DOCTYPE html>"));
    assert!(snippet.chars().count() <= 1000);
}

#[test]
fn page_without_organization_is_a_parse_error() {
    let err = extract_tender(
        &fixture("detail/271902_missing_organization.html"),
        &opts("271902"),
        Utc::now(),
    )
    .expect_err("organization missing");
    assert_eq!(err.kind(), ErrorKind::ParseError);
    assert!(err.to_string().contains("organization"));
}

#[test]
fn listing_hint_fills_absent_tender_id() {
    let html = "<table><tr><td>Name Of Work</td><td>Bridge repair</td></tr>\
                <tr><td>Organization</td><td>Panchayat</td></tr></table>";
    let mut options = opts("300001");
    options.tender_id_hint = Some("300001".into());
    let record = extract_tender(html, &options, Utc::now()).expect("record");
    assert_eq!(record.tender_id, "300001");
}

#[test]
fn listing_fixture_yields_detail_urls() {
    let base = Url::parse("https://tender.nprocure.com").expect("base");
    let stubs = listing::parse_listing_page(&fixture("listing/page1.html"), &base);
    let ids: Vec<&str> = stubs.iter().map(|s| s.tender_id.as_str()).collect();
    assert_eq!(ids, vec!["271843", "271901"]);
    assert_eq!(
        stubs[1].source_url,
        "https://tender.nprocure.com/view-nit-home?id=271901"
    );
}

#[test]
fn extracted_record_serializes_with_tagged_emd() {
    let record = extract_tender(&fixture("detail/271843.html"), &opts("271843"), Utc::now())
        .expect("record");
    let value = serde_json::to_value(&record).expect("json");
    assert_eq!(value["emd_amount"]["kind"], "unparsed");
    assert_eq!(value["tender_status"], "in_progress");
    assert_eq!(value["attachments"][0]["type"], "pdf");
    assert_eq!(value["bid_validity_days"], 120);
}
