//! Per-record transformation.

use crate::error::Result;
use async_trait::async_trait;
use std::marker::PhantomData;

/// Transforms one input record into at most one output record
///
/// Returning `Ok(None)` filters the record: it is counted but never reaches the writer.
/// Returning an error aborts the current chunk, unless the step tolerates skips and the
/// error is [skippable](crate::Error::is_skippable).
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Record read from the page source
    type Input: Send + 'static;
    /// Record handed to the writer
    type Output: Send + Sync + 'static;

    /// Resolve reference data once per step execution, before the first chunk
    ///
    /// A lookup that comes back empty must fail here so that the step fails before
    /// anything is written.
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Transform one record
    async fn process(&self, input: Self::Input) -> Result<Option<Self::Output>>;
}

/// Adapter for synchronous closures
pub struct FnProcessor<I, O, F> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O, F> FnProcessor<I, O, F>
where
    F: Fn(I) -> Result<Option<O>> + Send + Sync,
{
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<I, O, F> ItemProcessor for FnProcessor<I, O, F>
where
    I: Send + 'static,
    O: Send + Sync + 'static,
    F: Fn(I) -> Result<Option<O>> + Send + Sync,
{
    type Input = I;
    type Output = O;

    async fn process(&self, input: I) -> Result<Option<O>> {
        (self.f)(input)
    }
}
