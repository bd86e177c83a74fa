//! Label/value lookup over table-shaped markup.
//!
//! Detail pages lay fields out as rows of `<td>label</td><td>value</td>`, with
//! the occasional header-row layout (labels in one row, values in the row
//! below). [`LabelTable`] flattens every row of a page or block once, and
//! [`LabelTable::extract`] resolves one label against it with a fixed fallback
//! order:
//!
//! 1. a cell whose normalized text equals the label, value = next cell in the row;
//! 2. the shortest cell whose normalized text contains the label, value = next cell;
//! 3. a `<th>` equal to the label in an all-header row, value = same column in the next row.
//!
//! Cells that wrap a nested table are never treated as labels or values; the
//! nested rows are visited on their own. Empty values count as absent.

use scraper::{ElementRef, Html, Selector};

use crate::ExtractError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Exact, then contains, then header-row.
    #[default]
    Fallback,
    /// Exact label match only.
    Exact,
}

#[derive(Debug, Clone)]
struct Cell {
    text: String,
    key: String,
    header: bool,
    wraps_table: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    rows: Vec<Vec<Cell>>,
}

/// Lowercase, drop `.`, collapse whitespace, trim trailing `:` and `*`.
pub fn label_key(text: &str) -> String {
    let lowered = text.to_lowercase().replace('.', " ");
    let collapsed = collapse_whitespace(&lowered);
    collapsed
        .trim_end_matches(|c: char| c == ':' || c == '*' || c.is_whitespace())
        .trim()
        .to_string()
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

fn row_cells(row: ElementRef<'_>, table_sel: &Selector) -> Vec<Cell> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|el| matches!(el.value().name(), "td" | "th"))
        .map(|el| {
            let text = element_text(el);
            Cell {
                key: label_key(&text),
                text,
                header: el.value().name() == "th",
                wraps_table: el.select(table_sel).next().is_some(),
            }
        })
        .collect()
}

impl LabelTable {
    pub fn from_html(document: &Html) -> Result<Self, ExtractError> {
        Self::from_element(document.root_element())
    }

    pub fn from_element(scope: ElementRef<'_>) -> Result<Self, ExtractError> {
        let row_sel = selector("tr")?;
        let table_sel = selector("table")?;
        let rows = scope
            .select(&row_sel)
            .map(|row| row_cells(row, &table_sel))
            .filter(|cells| !cells.is_empty())
            .collect();
        Ok(Self { rows })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn extract(&self, label: &str, strategy: MatchStrategy) -> Option<String> {
        let wanted = label_key(label);
        if wanted.is_empty() {
            return None;
        }

        if let Some(value) = self.adjacent_value(|key| key == wanted) {
            return Some(value);
        }
        if strategy == MatchStrategy::Exact {
            return None;
        }
        self.shortest_containing(&wanted)
            .or_else(|| self.value_below(&wanted))
    }

    fn adjacent_value(&self, matches: impl Fn(&str) -> bool) -> Option<String> {
        self.rows.iter().find_map(|row| {
            let idx = row
                .iter()
                .position(|cell| !cell.wraps_table && matches(&cell.key))?;
            row.get(idx + 1)
                .filter(|cell| !cell.wraps_table && !cell.text.is_empty())
                .map(|cell| cell.text.clone())
        })
    }

    fn shortest_containing(&self, wanted: &str) -> Option<String> {
        let mut best: Option<(usize, &Cell)> = None;
        for row in &self.rows {
            for (idx, cell) in row.iter().enumerate() {
                if cell.wraps_table || !cell.key.contains(wanted) {
                    continue;
                }
                let Some(value) = row.get(idx + 1) else {
                    continue;
                };
                if value.wraps_table || value.text.is_empty() {
                    continue;
                }
                if best.map_or(true, |(len, _)| cell.key.len() < len) {
                    best = Some((cell.key.len(), value));
                }
            }
        }
        best.map(|(_, cell)| cell.text.clone())
    }

    fn value_below(&self, wanted: &str) -> Option<String> {
        self.rows.windows(2).find_map(|pair| {
            if !pair[0].iter().all(|cell| cell.header) {
                return None;
            }
            let col = pair[0]
                .iter()
                .position(|cell| !cell.wraps_table && cell.key == wanted)?;
            pair[1]
                .get(col)
                .filter(|cell| !cell.wraps_table && !cell.text.is_empty())
                .map(|cell| cell.text.clone())
        })
    }
}

/// Rows of a header-led table as `header key -> cell text` pairs.
///
/// The first row supplies the headers; rows with fewer cells simply lack the
/// trailing columns.
pub fn read_header_table(table: ElementRef<'_>) -> Result<Vec<Vec<(String, String)>>, ExtractError> {
    let row_sel = selector("tr")?;
    let table_sel = selector("table")?;
    let mut rows = table
        .select(&row_sel)
        .map(|row| row_cells(row, &table_sel))
        .filter(|cells| !cells.is_empty());

    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let keys: Vec<String> = header.into_iter().map(|c| c.key).collect();
    Ok(rows
        .map(|cells| {
            keys.iter()
                .cloned()
                .zip(cells.into_iter().map(|c| c.text))
                .collect()
        })
        .collect())
}

pub fn header_keys(table: ElementRef<'_>) -> Result<Vec<String>, ExtractError> {
    let row_sel = selector("tr")?;
    let table_sel = selector("table")?;
    Ok(table
        .select(&row_sel)
        .map(|row| row_cells(row, &table_sel))
        .find(|cells| !cells.is_empty())
        .map(|cells| cells.into_iter().map(|c| c.key).collect())
        .unwrap_or_default())
}
