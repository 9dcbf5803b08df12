use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{
    TenderNotice, CATEGORY_FIELD, CLOSING_DATE_FIELD, CONTRACT_END_FIELD, CONTRACT_START_FIELD,
    PUBLICATION_DATE_FIELD, REFERENCE_NUMBER_FIELD, REGIONS_OF_DELIVERY_FIELD, STATUS_FIELD,
    TITLE_FIELD, UNSPSC_DESCRIPTION_FIELD,
};

pub const DEFAULT_PAGE_LIMIT: usize = 10;
pub const MAX_PAGE_LIMIT: usize = 100;
/// Highest page honoured; keeps `page * MAX_PAGE_LIMIT` inside an SQL BIGINT.
pub const MAX_PAGE: usize = 10_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenderSort {
    /// Open tenders first, then nearest closing date, then category.
    #[default]
    Relevance,
    Newest,
    Oldest,
}

impl TenderSort {
    /// Unknown values fall back to relevance ordering.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("newest") => TenderSort::Newest,
            Some("oldest") => TenderSort::Oldest,
            _ => TenderSort::Relevance,
        }
    }
}

/// Filters and paging for tender search. Dates compare as plain strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenderQuery {
    pub query: Option<String>,
    pub category: Option<String>,
    pub location: Option<String>,
    pub status: Option<String>,
    pub deadline_from: Option<String>,
    pub deadline_to: Option<String>,
    pub sort: TenderSort,
    pub page: usize,
    pub limit: usize,
}

impl TenderQuery {
    /// Clamps paging into range and turns blank filters into `None`.
    pub fn normalized(mut self) -> Self {
        for filter in [
            &mut self.query,
            &mut self.category,
            &mut self.location,
            &mut self.status,
            &mut self.deadline_from,
            &mut self.deadline_to,
        ] {
            if filter.as_deref().map(str::trim).is_some_and(str::is_empty) {
                *filter = None;
            }
        }
        self.page = self.page.clamp(1, MAX_PAGE);
        self.limit = if self.limit == 0 {
            DEFAULT_PAGE_LIMIT
        } else {
            self.limit.min(MAX_PAGE_LIMIT)
        };
        self
    }

    pub fn offset(&self) -> usize {
        (self.page.max(1) - 1).saturating_mul(self.limit)
    }

    pub fn matches(&self, notice: &TenderNotice) -> bool {
        let field = |name: &str| notice.get(name).unwrap_or_default();
        if let Some(q) = &self.query {
            if !contains_ignore_case(field(TITLE_FIELD), q) {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if field(CATEGORY_FIELD) != category.as_str() {
                return false;
            }
        }
        if let Some(location) = &self.location {
            if !contains_ignore_case(field(REGIONS_OF_DELIVERY_FIELD), location) {
                return false;
            }
        }
        if let Some(status) = &self.status {
            if field(STATUS_FIELD) != status.as_str() {
                return false;
            }
        }
        let closing = notice.get(CLOSING_DATE_FIELD);
        if let Some(from) = &self.deadline_from {
            if !closing.is_some_and(|c| c >= from.as_str()) {
                return false;
            }
        }
        if let Some(to) = &self.deadline_to {
            if !closing.is_some_and(|c| c <= to.as_str()) {
                return false;
            }
        }
        true
    }

    /// Ordering used for `sort`; absent values sort last in either direction.
    pub fn compare(&self, a: &TenderNotice, b: &TenderNotice) -> Ordering {
        match self.sort {
            TenderSort::Newest => by_field(a, b, PUBLICATION_DATE_FIELD, true),
            TenderSort::Oldest => by_field(a, b, PUBLICATION_DATE_FIELD, false),
            TenderSort::Relevance => by_field(a, b, STATUS_FIELD, true)
                .then_with(|| by_field(a, b, CLOSING_DATE_FIELD, false))
                .then_with(|| by_field(a, b, CATEGORY_FIELD, false)),
        }
    }
}

fn by_field(a: &TenderNotice, b: &TenderNotice, field: &str, descending: bool) -> Ordering {
    match (a.get(field), b.get(field)) {
        (Some(x), Some(y)) if descending => y.cmp(x),
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Compact, client-facing view of a notice used by search results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenderSummary {
    pub title: Option<String>,
    pub reference_number: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub closing_date: Option<String>,
    pub contract_start_date: Option<String>,
    pub contract_end_date: Option<String>,
    pub category: Option<String>,
    pub regions: Option<String>,
}

impl From<&TenderNotice> for TenderSummary {
    fn from(notice: &TenderNotice) -> Self {
        let field = |name: &str| notice.get(name).map(str::to_string);
        Self {
            title: field(TITLE_FIELD),
            reference_number: field(REFERENCE_NUMBER_FIELD),
            description: field(UNSPSC_DESCRIPTION_FIELD),
            status: field(STATUS_FIELD),
            closing_date: field(CLOSING_DATE_FIELD),
            contract_start_date: field(CONTRACT_START_FIELD),
            contract_end_date: field(CONTRACT_END_FIELD),
            category: field(CATEGORY_FIELD),
            regions: field(REGIONS_OF_DELIVERY_FIELD),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: u64,
    pub page: usize,
    pub limit: usize,
    pub total_pages: u64,
}

impl Pagination {
    pub fn new(total: u64, page: usize, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            total,
            page,
            limit,
            total_pages: total.div_ceil(limit as u64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenderPage {
    pub tenders: Vec<TenderSummary>,
    pub pagination: Pagination,
}
