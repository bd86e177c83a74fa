//! Search-result pages and the lazy cursor over them.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html};
use tender_core::{SearchFilters, TenderStub};
use tender_storage::{fetch_with_retry, BackoffPolicy, FetchError, PageFetcher};
use tracing::{debug, info, warn};
use url::Url;

use crate::extract::{element_text, selector};

pub const DEFAULT_PAGE_SIZE: u32 = 50;

static TENDER_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Tender[_ ]?Id\s*[:\s]\s*(\d+)").expect("tender id pattern should compile")
});

/// Query pairs understood by the search endpoint.
pub fn search_query(filters: &SearchFilters, page_number: u32, page_size: u32) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut push = |key: &str, value: String| pairs.push((key.to_string(), value));
    if let Some(keyword) = &filters.keyword {
        push("keyword", keyword.clone());
    }
    if let Some(organization) = &filters.organization {
        push("organization", organization.clone());
    }
    if let Some(kind) = filters.tender_type {
        push("tenderType", kind.as_str().to_string());
    }
    if let Some(status) = filters.tender_status {
        push("tenderStatus", status.as_str().to_string());
    }
    if let Some(min) = filters.min_value {
        push("minValue", min.to_string());
    }
    if let Some(max) = filters.max_value {
        push("maxValue", max.to_string());
    }
    push("pageNumber", page_number.to_string());
    push("pageSize", page_size.to_string());
    pairs
}

pub fn detail_url(base: &Url, tender_id: &str) -> String {
    let mut url = base.clone();
    url.set_path("/view-nit-home");
    url.set_query(None);
    url.query_pairs_mut().append_pair("id", tender_id);
    url.to_string()
}

fn row_stub(row: ElementRef<'_>, base: &Url) -> Option<TenderStub> {
    let text = element_text(row);
    let tender_id = TENDER_ID.captures(&text)?.get(1)?.as_str().to_string();
    Some(TenderStub {
        source_url: detail_url(base, &tender_id),
        tender_id,
    })
}

/// Stubs from the `tbody tr` rows of one result page, first occurrence wins.
pub fn parse_listing_page(html: &str, base: &Url) -> Vec<TenderStub> {
    let document = Html::parse_document(html);
    let Ok(row_sel) = selector("tbody tr") else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    document
        .select(&row_sel)
        .filter_map(|row| row_stub(row, base))
        .filter(|stub| seen.insert(stub.tender_id.clone()))
        .collect()
}

/// Source of candidate stubs, one result page at a time.
#[async_trait]
pub trait ListingCrawler: Send + Sync {
    async fn fetch_listing_page(
        &self,
        filters: &SearchFilters,
        page_number: u32,
    ) -> Result<Vec<TenderStub>, FetchError>;
}

pub struct NprocureListingCrawler {
    fetcher: Arc<dyn PageFetcher>,
    base_url: Url,
    page_size: u32,
    policy: BackoffPolicy,
}

impl NprocureListingCrawler {
    pub fn new(fetcher: Arc<dyn PageFetcher>, base_url: Url, policy: BackoffPolicy) -> Self {
        Self {
            fetcher,
            base_url,
            page_size: DEFAULT_PAGE_SIZE,
            policy,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn search_url(&self, filters: &SearchFilters, page_number: u32) -> String {
        let mut url = self.base_url.clone();
        url.set_path("/advanced-search");
        url.set_query(None);
        url.query_pairs_mut()
            .extend_pairs(search_query(filters, page_number, self.page_size));
        url.to_string()
    }
}

#[async_trait]
impl ListingCrawler for NprocureListingCrawler {
    async fn fetch_listing_page(
        &self,
        filters: &SearchFilters,
        page_number: u32,
    ) -> Result<Vec<TenderStub>, FetchError> {
        let url = self.search_url(filters, page_number);
        let page = fetch_with_retry(self.fetcher.as_ref(), &url, &self.policy).await?;
        let stubs = parse_listing_page(&page.body, &self.base_url);
        debug!(page_number, stubs = stubs.len(), "parsed listing page");
        Ok(stubs)
    }
}

/// Pulls listing pages on demand and yields each tender id once.
///
/// Stops at the first empty page, at a page with no unseen ids (the site
/// repeats its last page past the end), or after a listing failure.
pub struct StubCursor {
    crawler: Arc<dyn ListingCrawler>,
    filters: SearchFilters,
    next_page: u32,
    buffer: VecDeque<TenderStub>,
    seen: HashSet<String>,
    exhausted: bool,
}

impl StubCursor {
    pub fn new(crawler: Arc<dyn ListingCrawler>, filters: SearchFilters) -> Self {
        Self {
            crawler,
            filters,
            next_page: 1,
            buffer: VecDeque::new(),
            seen: HashSet::new(),
            exhausted: false,
        }
    }

    pub fn pages_fetched(&self) -> u32 {
        self.next_page - 1
    }

    pub async fn next(&mut self) -> Result<Option<TenderStub>, FetchError> {
        while self.buffer.is_empty() {
            if self.exhausted {
                return Ok(None);
            }
            let page_number = self.next_page;
            self.next_page += 1;

            let stubs = match self.crawler.fetch_listing_page(&self.filters, page_number).await {
                Ok(stubs) => stubs,
                Err(err) => {
                    self.exhausted = true;
                    warn!(page_number, error = %err, "listing page failed, stopping crawl");
                    return Err(err);
                }
            };

            let fresh: Vec<TenderStub> = stubs
                .into_iter()
                .filter(|stub| self.seen.insert(stub.tender_id.clone()))
                .collect();
            if fresh.is_empty() {
                info!(page_number, "listing exhausted");
                self.exhausted = true;
            }
            self.buffer.extend(fresh);
        }
        Ok(self.buffer.pop_front())
    }
}
