use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html};
use tender_core::Attachment;
use url::Url;

use crate::extract::{element_text, selector};
use crate::ExtractError;

const DOCUMENT_EXTENSIONS: [&str; 8] = ["pdf", "doc", "docx", "xls", "xlsx", "zip", "rar", "dwg"];
const LINK_HINTS: [&str; 3] = ["download", "document", "attachment"];

static EXTENSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.([A-Za-z0-9]{1,5})$").expect("extension pattern should compile")
});
static FILE_SIZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\d+(?:\.\d+)?\s*(?:bytes|kb|mb|gb)$").expect("size pattern should compile")
});

/// Lower-cased extension of the URL path, else of a `?file=NAME.ext` style query.
pub fn file_type(url: &Url) -> Option<String> {
    EXTENSION
        .captures(url.path())
        .or_else(|| url.query().and_then(|q| EXTENSION.captures(q)))
        .map(|caps| caps[1].to_ascii_lowercase())
}

fn looks_like_document(href: &str, url: &Url) -> bool {
    let lowered = href.to_ascii_lowercase();
    LINK_HINTS.iter().any(|hint| lowered.contains(hint))
        || file_type(url).is_some_and(|ext| DOCUMENT_EXTENSIONS.contains(&ext.as_str()))
}

fn size_in_row(link: ElementRef<'_>) -> Option<String> {
    let row = link
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "tr")?;
    row.children()
        .filter_map(ElementRef::wrap)
        .map(element_text)
        .find(|text| FILE_SIZE.is_match(text))
}

/// Document links on a detail page, made absolute against `base`, in page order.
pub fn extract_attachments(document: &Html, base: &Url) -> Result<Vec<Attachment>, ExtractError> {
    let link_sel = selector("a[href]")?;
    let mut seen = HashSet::new();
    let mut attachments = Vec::new();

    for link in document.select(&link_sel) {
        let Some(href) = link.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
            continue;
        }
        let Ok(url) = base.join(href) else {
            continue;
        };
        if !looks_like_document(href, &url) || !seen.insert(url.to_string()) {
            continue;
        }

        let name = element_text(link);
        let name = if name.is_empty() {
            format!("Document_{}", attachments.len() + 1)
        } else {
            name
        };
        attachments.push(Attachment {
            name,
            file_type: file_type(&url),
            size: size_in_row(link),
            url: Some(url.to_string()),
        });
    }
    Ok(attachments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://tender.nprocure.com/view-nit-home?id=271843").expect("base")
    }

    #[test]
    fn document_links_become_absolute_attachments() {
        let doc = Html::parse_document(
            r##"<table>
                <tr><td><a href="/download?file=NIT.pdf">NIT Document</a></td><td>1.2 MB</td></tr>
                <tr><td><a href="files/BOQ.XLSX"></a></td><td>n/a</td></tr>
                <tr><td><a href="/download?file=NIT.pdf">duplicate</a></td></tr>
               </table>
               <a href="/home">Home</a><a href="#top">Top</a>"##,
        );
        let found = extract_attachments(&doc, &base()).expect("attachments");
        assert_eq!(found.len(), 2);

        assert_eq!(found[0].name, "NIT Document");
        assert_eq!(
            found[0].url.as_deref(),
            Some("https://tender.nprocure.com/download?file=NIT.pdf")
        );
        assert_eq!(found[0].size.as_deref(), Some("1.2 MB"));
        assert_eq!(found[0].file_type.as_deref(), Some("pdf"));

        assert_eq!(found[1].name, "Document_2");
        assert_eq!(found[1].file_type.as_deref(), Some("xlsx"));
        assert_eq!(found[1].size, None);
    }
}
