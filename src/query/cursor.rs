// src/query/cursor.rs

use futures_util::stream::{self, Stream};
use serde_json::{json, Value};
use std::collections::VecDeque;

use crate::client::Parse;
use crate::error::ParseError;
use crate::object::ParseObject;
use crate::query::compiler::{CompiledQuery, Limit, SortDirection, SortKey};
use crate::query::ParseQuery;

/// Options for [`ParseQuery::each`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EachOptions {
    /// Objects requested per page.
    pub batch_size: usize,
}

impl Default for EachOptions {
    fn default() -> Self {
        EachOptions { batch_size: 100 }
    }
}

impl EachOptions {
    pub fn batch_size(batch_size: usize) -> Self {
        EachOptions { batch_size }
    }
}

#[derive(Debug, Clone)]
enum Paging {
    /// No caller order: sorted by objectId, each page starts after the last id seen.
    Keyset { last_id: Option<String> },
    /// Caller order: offset pages with objectId as a tie-breaker.
    Offset { next_skip: usize },
}

/// Lazy, page-at-a-time iteration over every object matching a query.
///
/// Nothing is requested until the first [`next`](QueryCursor::next) call, and
/// a page is only fetched once the previous one has been fully consumed, so
/// dropping the cursor stops all further requests. Each cursor owns its own
/// state; cursors built from the same query never interfere.
#[derive(Debug)]
pub struct QueryCursor {
    client: Parse,
    query: ParseQuery,
    base: CompiledQuery,
    paging: Paging,
    batch_size: usize,
    remaining: Option<usize>,
    buffer: VecDeque<ParseObject>,
    exhausted: bool,
    pages_fetched: usize,
}

impl QueryCursor {
    pub(crate) fn new(client: Parse, query: &ParseQuery, options: EachOptions) -> Result<Self, ParseError> {
        if options.batch_size == 0 {
            return Err(ParseError::InvalidInput(
                "batch size must be at least 1".to_string(),
            ));
        }
        let mut base = query.compile()?;
        let remaining = match base.limit {
            Limit::Count(n) => Some(n),
            Limit::Default | Limit::Unlimited => None,
        };

        let paging = if base.order.is_empty() {
            base.order.push(SortKey {
                key: "objectId".to_string(),
                direction: SortDirection::Ascending,
            });
            Paging::Keyset { last_id: None }
        } else {
            if !base.order.iter().any(|s| s.key == "objectId") {
                base.order.push(SortKey {
                    key: "objectId".to_string(),
                    direction: SortDirection::Ascending,
                });
            }
            Paging::Offset {
                next_skip: base.skip,
            }
        };

        Ok(QueryCursor {
            client,
            query: query.clone(),
            base,
            paging,
            batch_size: options.batch_size,
            exhausted: remaining == Some(0),
            remaining,
            buffer: VecDeque::new(),
            pages_fetched: 0,
        })
    }

    /// Number of page requests issued so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    fn page_size(&self) -> usize {
        match self.remaining {
            Some(left) => left.min(self.batch_size),
            None => self.batch_size,
        }
    }

    fn next_page_query(&self, page_size: usize) -> CompiledQuery {
        let mut page = self.base.clone();
        page.limit = Limit::Count(page_size);
        match &self.paging {
            Paging::Keyset { last_id: None } => {}
            Paging::Keyset {
                last_id: Some(last),
            } => {
                page.skip = 0;
                let after = json!({ "$gt": last });
                match page.where_clause.remove("objectId") {
                    None => {
                        page.where_clause.insert("objectId".to_string(), after);
                    }
                    Some(existing) => {
                        let mut own = page.where_clause.clone();
                        own.insert("objectId".to_string(), existing);
                        let clauses = vec![Value::Object(own), json!({ "objectId": after })];
                        page.where_clause.clear();
                        page.where_clause.insert("$and".to_string(), Value::Array(clauses));
                    }
                }
            }
            Paging::Offset { next_skip } => page.skip = *next_skip,
        }
        page
    }

    async fn fetch_next_page(&mut self) -> Result<(), ParseError> {
        let page_size = self.page_size();
        let page_query = self.next_page_query(page_size);
        log::debug!(
            "each: fetching page {} of {} (size {})",
            self.pages_fetched + 1,
            self.base.class_name,
            page_size
        );

        let page = self.query.fetch_page(&self.client, &page_query).await?;
        self.pages_fetched += 1;

        if page.len() < page_size {
            self.exhausted = true;
        }
        if let Some(left) = self.remaining.as_mut() {
            *left = left.saturating_sub(page.len());
            if *left == 0 {
                self.exhausted = true;
            }
        }
        match &mut self.paging {
            Paging::Keyset { last_id } => {
                if let Some(id) = page.last().and_then(ParseObject::object_id) {
                    *last_id = Some(id.to_string());
                } else if !page.is_empty() {
                    return Err(ParseError::UnexpectedResponse(
                        "each: page entry without objectId".to_string(),
                    ));
                }
            }
            Paging::Offset { next_skip } => *next_skip += page.len(),
        }
        self.buffer.extend(page);
        Ok(())
    }

    /// The next object, fetching a page when the buffer runs dry.
    ///
    /// A failed page request ends the iteration; the error is returned once.
    pub async fn next(&mut self) -> Result<Option<ParseObject>, ParseError> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_next_page().await {
                self.exhausted = true;
                self.buffer.clear();
                return Err(e);
            }
        }
        Ok(self.buffer.pop_front())
    }

    /// Drains the cursor into a vector.
    pub async fn collect(mut self) -> Result<Vec<ParseObject>, ParseError> {
        let mut all = Vec::new();
        while let Some(object) = self.next().await? {
            all.push(object);
        }
        Ok(all)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<ParseObject, ParseError>> {
        stream::unfold(Some(self), |cursor| async move {
            let mut cursor = cursor?;
            match cursor.next().await {
                Ok(Some(object)) => Some((Ok(object), Some(cursor))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
