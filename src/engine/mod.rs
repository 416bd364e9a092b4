mod chain;
mod dependencies;
mod goal;

use std::sync::Arc;

pub use crate::engine::chain::{Chain, ChainStream};
pub use crate::engine::dependencies::Dependencies;
pub use crate::engine::goal::{AnyGoal, Goal, GoalBinder, GoalContext, GoalState, join, join_map};
pub(crate) use crate::engine::goal::any_failed;

/// Chooses the rayon pool goal bodies are spawned on.
///
/// Goals derived from other goals inherit the dispatcher of their first
/// dependency, so a whole graph stays on the pool its sources were created
/// with.
#[derive(Clone, Default)]
pub struct Dispatcher {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl Dispatcher {
    /// Spawn on the global rayon pool.
    pub fn global() -> Self {
        Self { pool: None }
    }

    pub fn pool(pool: Arc<rayon::ThreadPool>) -> Self {
        Self { pool: Some(pool) }
    }

    /// Builds a dedicated pool with `threads` workers.
    pub fn with_threads(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("goalforge-{i}"))
            .build()?;

        Ok(Self::pool(Arc::new(pool)))
    }

    pub(crate) fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        match &self.pool {
            Some(pool) => pool.spawn(job),
            None => rayon::spawn(job),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.pool {
            Some(pool) => write!(f, "Dispatcher::Pool({})", pool.current_num_threads()),
            None => write!(f, "Dispatcher::Global"),
        }
    }
}
