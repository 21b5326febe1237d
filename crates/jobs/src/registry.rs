use std::collections::BTreeMap;
use std::sync::Arc;

use redline_core::{CoreError, CoreResult, Slug};

use crate::runner::JobRunner;

/// Named job runners, built once at startup.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: BTreeMap<Slug, Arc<JobRunner>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runner: JobRunner) -> CoreResult<Arc<JobRunner>> {
        let name = runner.name().clone();
        if self.jobs.contains_key(&name) {
            return Err(CoreError::duplicate(name.as_str()));
        }
        let runner = Arc::new(runner);
        self.jobs.insert(name, runner.clone());
        Ok(runner)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<JobRunner>> {
        self.jobs.get(name)
    }

    /// Job names in sorted order.
    pub fn names(&self) -> Vec<&Slug> {
        self.jobs.keys().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<JobRunner>> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
