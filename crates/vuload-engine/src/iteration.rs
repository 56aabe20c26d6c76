//! The workload seam: one call = one iteration of a virtual user.

use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use vuload_core::Outcome;

/// Identifies the virtual user and iteration being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationContext {
    pub vu_id: u64,
    pub iteration: u64,
}

/// What an iteration observed. Timing is measured by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationResult {
    pub outcome: Outcome,
    pub checks_passed: u32,
    pub checks_failed: u32,
}

impl IterationResult {
    pub fn status(code: u16) -> Self {
        Self {
            outcome: Outcome::Status(code),
            checks_passed: 0,
            checks_failed: 0,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Error(message.into()),
            checks_passed: 0,
            checks_failed: 0,
        }
    }

    #[must_use]
    pub fn with_checks(mut self, passed: u32, failed: u32) -> Self {
        self.checks_passed = passed;
        self.checks_failed = failed;
        self
    }
}

/// User-supplied iteration function, invoked repeatedly by every virtual user.
///
/// Implementations must not treat failures as panics: a refused connection or
/// a 5xx is an [`Outcome`] like any other.
#[async_trait]
pub trait Iteration: Send + Sync + 'static {
    async fn run(&self, ctx: IterationContext) -> IterationResult;
}

/// Adapter turning an async closure into an [`Iteration`].
pub struct FnIteration<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

/// Wrap `f` as an iteration function.
pub fn iteration_fn<F, Fut>(f: F) -> FnIteration<F, Fut>
where
    F: Fn(IterationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = IterationResult> + Send + 'static,
{
    FnIteration {
        f,
        _future: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> Iteration for FnIteration<F, Fut>
where
    F: Fn(IterationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = IterationResult> + Send + 'static,
{
    async fn run(&self, ctx: IterationContext) -> IterationResult {
        (self.f)(ctx).await
    }
}
