//! Stage blocks: one `.stage` / `[data-stage]` element per evaluation phase.

use scraper::{ElementRef, Html};
use tender_core::{Document, Form, Stage};
use tracing::warn;

use crate::extract::{header_keys, read_header_table, selector, LabelTable, MatchStrategy};
use crate::normalize::{clean_text, parse_integer, parse_tender_date};
use crate::ExtractError;

const STAGE_BLOCKS: &str = ".stage, [data-stage]";

/// Reads a yes/no style flag; anything unrecognized is `false` with a warning.
pub fn parse_mandatory(input: Option<&str>, context: &str) -> bool {
    let Some(raw) = input else {
        warn!(context, "mandatory flag missing, defaulting to false");
        return false;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "mandatory" | "1" => true,
        "no" | "n" | "false" | "optional" | "0" => false,
        other => {
            warn!(context, value = other, "unrecognized mandatory flag, defaulting to false");
            false
        }
    }
}

fn column<'a>(row: &'a [(String, String)], names: &[&str]) -> Option<&'a str> {
    row.iter()
        .find(|(key, _)| names.contains(&key.as_str()))
        .map(|(_, value)| value.as_str())
}

fn is_forms_table(keys: &[String]) -> bool {
    keys.iter().any(|k| k == "form id" || k == "form name")
}

fn is_documents_table(keys: &[String]) -> bool {
    keys.iter().any(|k| k == "document name")
}

fn parse_forms(table: ElementRef<'_>, stage_name: &str) -> Result<Vec<Form>, ExtractError> {
    Ok(read_header_table(table)?
        .into_iter()
        .filter(|row| !row.is_empty())
        .map(|row| Form {
            form_id: column(&row, &["form id"]).and_then(clean_text),
            form_name: column(&row, &["form name"]).and_then(clean_text),
            form_mode: column(&row, &["form mode", "mode"]).and_then(clean_text),
            submission_type: column(&row, &["submission type"]).and_then(clean_text),
            mandatory: parse_mandatory(
                column(&row, &["mandatory", "is mandatory"]),
                &format!("{stage_name} form"),
            ),
        })
        .collect())
}

fn parse_documents(table: ElementRef<'_>, stage_name: &str) -> Result<Vec<Document>, ExtractError> {
    Ok(read_header_table(table)?
        .into_iter()
        .filter(|row| !row.is_empty())
        .map(|row| Document {
            sr_no: column(&row, &["sr no", "sr", "s no"]).and_then(parse_integer),
            document_name: column(&row, &["document name"]).and_then(clean_text),
            mandatory: parse_mandatory(
                column(&row, &["mandatory", "is mandatory"]),
                &format!("{stage_name} document"),
            ),
        })
        .collect())
}

fn assemble_stage(block: ElementRef<'_>, position: usize) -> Result<Stage, ExtractError> {
    let labels = LabelTable::from_element(block)?;
    let stage_name = labels
        .extract("Stage Name", MatchStrategy::Exact)
        .and_then(|v| clean_text(&v))
        .or_else(|| {
            block
                .value()
                .attr("data-stage")
                .and_then(clean_text)
        })
        .unwrap_or_else(|| format!("Stage {position}"));

    let evaluation_date = labels
        .extract("Evaluation Date", MatchStrategy::Fallback)
        .and_then(|v| {
            let parsed = parse_tender_date(&v);
            if parsed.is_none() {
                warn!(stage = %stage_name, value = %v, "discarding unparsable evaluation date");
            }
            parsed
        });
    let minimum_forms = labels
        .extract("Minimum Forms", MatchStrategy::Fallback)
        .and_then(|v| parse_integer(&v))
        .unwrap_or(0);

    let mut forms = Vec::new();
    let mut required_documents = Vec::new();
    let table_sel = selector("table")?;
    for table in block.select(&table_sel) {
        let keys = header_keys(table)?;
        if is_forms_table(&keys) {
            forms.extend(parse_forms(table, &stage_name)?);
        } else if is_documents_table(&keys) {
            required_documents.extend(parse_documents(table, &stage_name)?);
        }
    }

    Ok(Stage {
        stage_name,
        evaluation_date,
        minimum_forms,
        forms,
        required_documents,
    })
}

/// Stages in page order. A page without stage blocks yields an empty list.
///
/// Blocks nested inside another stage block are part of their parent.
pub fn assemble_stages(document: &Html) -> Result<Vec<Stage>, ExtractError> {
    let block_sel = selector(STAGE_BLOCKS)?;
    let outermost: Vec<ElementRef<'_>> = document
        .select(&block_sel)
        .filter(|block| {
            !block
                .ancestors()
                .filter_map(ElementRef::wrap)
                .any(|ancestor| block_sel.matches(&ancestor))
        })
        .collect();

    outermost
        .into_iter()
        .enumerate()
        .map(|(idx, block)| assemble_stage(block, idx + 1))
        .collect()
}
