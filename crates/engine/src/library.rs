//! Job name → implementation lookup.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use conveyor_core::ProgramId;

/// A named unit of work, resolved at execution time.
///
/// Implementations are supplied by the caller. Failures are opaque to the
/// engine and propagate unchanged.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, program_id: ProgramId) -> anyhow::Result<()>;
}

/// Future returned by a closure-based job.
pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Capability-set lookup table mapping job names to implementations.
///
/// The engine only ever reads from a library it was handed.
#[derive(Default)]
pub struct JobLibrary {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl JobLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, job: Arc<dyn Job>) {
        self.jobs.insert(name.into(), job);
    }

    /// Register a closure-based job.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(ProgramId) -> JobFuture + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnJob(f)));
    }

    /// Look a job up by name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

struct FnJob<F>(F);

#[async_trait]
impl<F> Job for FnJob<F>
where
    F: Fn(ProgramId) -> JobFuture + Send + Sync,
{
    async fn run(&self, program_id: ProgramId) -> anyhow::Result<()> {
        (self.0)(program_id).await
    }
}
