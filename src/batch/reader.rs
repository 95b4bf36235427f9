//! Paged cursor over an ordered record source.
//!
//! The first page honours the restart skip-count through `OFFSET`; every later page is
//! a keyset read (`key > last_key`), so a large skip is paid for once and rows inserted
//! behind the cursor are never re-read.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::Stream;
use std::collections::VecDeque;
use std::sync::Arc;

/// One page round-trip
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    /// Sort key of the last record already returned, if any
    pub after: Option<i64>,
    /// Records to skip before the page starts (only non-zero for the first page)
    pub offset: u64,
    /// Maximum records in the page
    pub limit: u32,
}

impl PageRequest {
    /// Lower bound for a `key > ?` predicate
    pub fn after_key(&self) -> i64 {
        self.after.unwrap_or(i64::MIN)
    }
}

/// A source of records ordered by a strictly increasing `i64` key
///
/// Implementations must return records sorted by [`sort_key`](Self::sort_key) with
/// keys greater than `request.after`, skipping `request.offset` of them.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Raw record type
    type Record: Send + 'static;

    /// Name used in logs and ordering errors
    fn name(&self) -> &str;

    /// Sort key of a record
    fn sort_key(&self, record: &Self::Record) -> i64;

    /// Fetch one page
    async fn fetch_page(&self, request: PageRequest) -> Result<Vec<Self::Record>>;
}

/// Forward-only cursor that fetches pages on demand
pub struct PagedReader<S: PageSource> {
    source: Arc<S>,
    page_size: u32,
    pending_skip: u64,
    buffer: VecDeque<S::Record>,
    last_key: Option<i64>,
    exhausted: bool,
    pages_read: u64,
    records_read: u64,
}

impl<S: PageSource> PagedReader<S> {
    /// Open a cursor that skips the first `skip` records
    pub fn open(source: Arc<S>, page_size: usize, skip: u64) -> Result<Self> {
        let page_size = u32::try_from(page_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| Error::Config {
                message: format!("page size must be between 1 and {}", u32::MAX),
                key: Some("page_size".to_string()),
            })?;

        Ok(Self {
            source,
            page_size,
            pending_skip: skip,
            buffer: VecDeque::with_capacity(page_size as usize),
            last_key: None,
            exhausted: false,
            pages_read: 0,
            records_read: 0,
        })
    }

    /// Next record, or `None` once the source is exhausted
    pub async fn next(&mut self) -> Result<Option<S::Record>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_next_page().await?;
        }

        let record = self.buffer.pop_front();
        if record.is_some() {
            self.records_read += 1;
        }
        Ok(record)
    }

    /// Non-empty pages fetched so far
    pub fn pages_read(&self) -> u64 {
        self.pages_read
    }

    /// Records returned so far
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Expose the cursor as a stream
    pub fn into_stream(self) -> impl Stream<Item = Result<S::Record>> {
        futures::stream::try_unfold(self, |mut reader| async move {
            Ok(reader.next().await?.map(|record| (record, reader)))
        })
    }

    async fn fetch_next_page(&mut self) -> Result<()> {
        let request = PageRequest {
            after: self.last_key,
            offset: self.pending_skip,
            limit: self.page_size,
        };
        let page = self.source.fetch_page(request).await?;
        self.pending_skip = 0;

        if page.len() < self.page_size as usize {
            self.exhausted = true;
        }
        if page.is_empty() {
            tracing::trace!(source = self.source.name(), "Source exhausted");
            return Ok(());
        }

        let mut previous = self.last_key;
        for record in &page {
            let key = self.source.sort_key(record);
            if let Some(previous) = previous
                && key <= previous
            {
                return Err(Error::Ordering {
                    source_name: self.source.name().to_string(),
                    previous,
                    key,
                });
            }
            previous = Some(key);
        }
        self.last_key = previous;
        self.pages_read += 1;

        tracing::trace!(
            source = self.source.name(),
            page = self.pages_read,
            records = page.len(),
            last_key = ?self.last_key,
            "Fetched page"
        );

        self.buffer.extend(page);
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::test_support::VecSource;
    use futures::TryStreamExt;

    async fn drain(reader: &mut PagedReader<VecSource>) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(record) = reader.next().await.unwrap() {
            out.push(record);
        }
        out
    }

    #[tokio::test]
    async fn reads_every_record_once_in_order() {
        for (n, page_size) in [(0usize, 3usize), (1, 3), (9, 3), (10, 3), (10, 1), (7, 100)] {
            let keys: Vec<i64> = (1..=n as i64).map(|k| k * 10).collect();
            let source = Arc::new(VecSource::new(keys.clone()));
            let mut reader = PagedReader::open(source.clone(), page_size, 0).unwrap();

            let out = drain(&mut reader).await;
            assert_eq!(out, keys, "n={n} page_size={page_size}");
            assert_eq!(reader.records_read(), n as u64);
            assert_eq!(
                reader.pages_read(),
                n.div_ceil(page_size) as u64,
                "non-empty pages for n={n} page_size={page_size}"
            );
        }
    }

    #[tokio::test]
    async fn skip_applies_to_first_page_only() {
        let source = Arc::new(VecSource::new((1..=10).collect()));
        let mut reader = PagedReader::open(source.clone(), 3, 4).unwrap();

        assert_eq!(drain(&mut reader).await, vec![5, 6, 7, 8, 9, 10]);

        let requests = source.requests();
        assert_eq!(requests[0].offset, 4);
        assert_eq!(requests[0].after, None);
        assert!(requests[1..].iter().all(|r| r.offset == 0));
        assert_eq!(requests[1].after, Some(7));
    }

    #[tokio::test]
    async fn skip_past_the_end_yields_nothing() {
        let source = Arc::new(VecSource::new(vec![1, 2, 3]));
        let mut reader = PagedReader::open(source, 2, 5).unwrap();
        assert!(reader.next().await.unwrap().is_none());
        assert_eq!(reader.pages_read(), 0);
    }

    #[tokio::test]
    async fn short_page_stops_fetching() {
        let source = Arc::new(VecSource::new(vec![1, 2, 3, 4, 5]));
        let mut reader = PagedReader::open(source.clone(), 2, 0).unwrap();
        drain(&mut reader).await;
        assert!(reader.next().await.unwrap().is_none());
        // 2 + 2 + 1: the short third page ends the source
        assert_eq!(source.requests().len(), 3);
    }

    #[tokio::test]
    async fn unordered_page_is_rejected() {
        let source = Arc::new(VecSource::unchecked(vec![1, 3, 2]));
        let mut reader = PagedReader::open(source, 5, 0).unwrap();
        match reader.next().await {
            Err(Error::Ordering { previous, key, .. }) => {
                assert_eq!(previous, 3);
                assert_eq!(key, 2);
            }
            other => panic!("expected ordering error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_page_size_is_a_config_error() {
        let source = Arc::new(VecSource::new(vec![1]));
        assert!(matches!(
            PagedReader::open(source, 0, 0),
            Err(Error::Config { .. })
        ));
    }

    #[tokio::test]
    async fn stream_yields_all_records() {
        let source = Arc::new(VecSource::new((1..=7).collect()));
        let reader = PagedReader::open(source, 3, 0).unwrap();
        let records: Vec<i64> = reader.into_stream().try_collect().await.unwrap();
        assert_eq!(records, (1..=7).collect::<Vec<_>>());
    }
}
