//! A [`Task`] assembled from an ordered list of named phases.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::context::JobContext;
use crate::task::{PhaseInfo, RunOutcome, Task, TaskError};

type PhaseFn<S> = Box<dyn Fn(&JobContext, &S) -> Result<(), TaskError> + Send + Sync>;
type SessionFn<S> = Box<dyn Fn(&JobContext) -> Result<S, TaskError> + Send + Sync>;
type PreflightFn = Box<dyn Fn() -> Result<(), TaskError> + Send + Sync>;
type StopFn = Box<dyn Fn(&JobContext) + Send + Sync>;

struct Phase<S> {
    info: PhaseInfo,
    action: PhaseFn<S>,
}

/// Runs its phases in order, checking for a stop request before each one and
/// once more after the last.
///
/// `S` is a per-run session value (an HTTP client with its cookie jar, for
/// instance) created at the start of every run and shared by its phases.
/// Phases added with [`once_phase`](Self::once_phase) are skipped after their
/// first successful run.
///
/// A single phase run through [`Task::run_phase`] gets a fresh session, so a
/// phase that depends on session state (a login cookie) names the earlier
/// phases that establish it with [`requires`](Self::requires).
pub struct PhasedTask<S = ()> {
    phases: Vec<Phase<S>>,
    session: SessionFn<S>,
    preflight: Option<PreflightFn>,
    on_stop: Option<StopFn>,
    completed_once: Mutex<HashSet<String>>,
}

impl PhasedTask<()> {
    pub fn new() -> Self {
        Self::with_session(|_| Ok(()))
    }
}

impl Default for PhasedTask<()> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> PhasedTask<S> {
    pub fn with_session<F>(factory: F) -> Self
    where
        F: Fn(&JobContext) -> Result<S, TaskError> + Send + Sync + 'static,
    {
        Self {
            phases: Vec::new(),
            session: Box::new(factory),
            preflight: None,
            on_stop: None,
            completed_once: Mutex::new(HashSet::new()),
        }
    }

    pub fn phase<F>(self, name: impl Into<String>, description: impl Into<String>, action: F) -> Self
    where
        F: Fn(&JobContext, &S) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.push(name.into(), description.into(), false, Box::new(action))
    }

    pub fn once_phase<F>(self, name: impl Into<String>, description: impl Into<String>, action: F) -> Self
    where
        F: Fn(&JobContext, &S) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.push(name.into(), description.into(), true, Box::new(action))
    }

    pub fn preflight<F>(mut self, check: F) -> Self
    where
        F: Fn() -> Result<(), TaskError> + Send + Sync + 'static,
    {
        self.preflight = Some(Box::new(check));
        self
    }

    pub fn on_stop<F>(mut self, hook: F) -> Self
    where
        F: Fn(&JobContext) + Send + Sync + 'static,
    {
        self.on_stop = Some(Box::new(hook));
        self
    }

    /// Declare prerequisites of the most recently added phase.
    ///
    /// Only consulted by single-phase runs; a full run already executes every
    /// earlier phase on the same session.
    pub fn requires<I, T>(mut self, phases: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        if let Some(last) = self.phases.last_mut() {
            last.info.requires.extend(phases.into_iter().map(Into::into));
        }
        self
    }

    fn push(mut self, name: String, description: String, run_once: bool, action: PhaseFn<S>) -> Self {
        self.phases.push(Phase {
            info: PhaseInfo {
                name,
                description,
                run_once,
                requires: Vec::new(),
            },
            action,
        });
        self
    }

    /// Transitive prerequisites of the phase at `index`, in declaration order.
    ///
    /// A prerequisite must be declared before the phase that needs it.
    fn prerequisites(&self, index: usize) -> Result<Vec<&Phase<S>>, TaskError> {
        let earlier = &self.phases[..index];
        let mut needed = HashSet::new();
        let mut pending: Vec<(usize, &str)> = self.phases[index]
            .info
            .requires
            .iter()
            .map(|r| (index, r.as_str()))
            .collect();

        while let Some((owner, name)) = pending.pop() {
            let Some(pos) = self.phases[..owner].iter().position(|p| p.info.name == name) else {
                return Err(TaskError::failed(format!(
                    "phase {} requires {name}, which is not declared before it",
                    self.phases[owner].info.name
                )));
            };
            if needed.insert(pos) {
                pending.extend(earlier[pos].info.requires.iter().map(|r| (pos, r.as_str())));
            }
        }

        Ok(earlier
            .iter()
            .enumerate()
            .filter(|(i, _)| needed.contains(i))
            .map(|(_, p)| p)
            .collect())
    }

    fn once_done(&self, phase: &str) -> bool {
        self.completed_once
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(phase)
    }

    fn execute(&self, phase: &Phase<S>, ctx: &JobContext, session: &S) -> Result<(), TaskError> {
        (phase.action)(ctx, session)?;
        if phase.info.run_once {
            self.completed_once
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(phase.info.name.clone());
        }
        Ok(())
    }
}

impl<S: 'static> Task for PhasedTask<S> {
    fn run(&self, ctx: &JobContext) -> Result<RunOutcome, TaskError> {
        let session = (self.session)(ctx)?;

        for phase in &self.phases {
            let name = phase.info.name.as_str();
            if phase.info.run_once && self.once_done(name) {
                ctx.info(format!("{name} already completed, skipping"));
                continue;
            }
            if ctx.enter_phase(name).is_break() {
                return Ok(RunOutcome::Stopped);
            }
            self.execute(phase, ctx, &session)?;
        }

        if ctx.check_stop("completion") {
            return Ok(RunOutcome::Stopped);
        }
        Ok(RunOutcome::Finished)
    }

    fn phases(&self) -> Vec<PhaseInfo> {
        self.phases.iter().map(|p| p.info.clone()).collect()
    }

    fn run_phase(&self, phase: &str, ctx: &JobContext) -> Result<(), TaskError> {
        let index = self
            .phases
            .iter()
            .position(|p| p.info.name == phase)
            .ok_or_else(|| TaskError::failed(format!("unknown phase {phase}")))?;
        let prerequisites = self.prerequisites(index)?;
        let session = (self.session)(ctx)?;

        for required in prerequisites {
            if ctx.stop_requested() {
                return Ok(());
            }
            ctx.info(format!("Running {} before {phase}", required.info.name));
            self.execute(required, ctx, &session)?;
        }
        if ctx.stop_requested() {
            return Ok(());
        }
        self.execute(&self.phases[index], ctx, &session)
    }

    fn preflight(&self) -> Result<(), TaskError> {
        match &self.preflight {
            Some(check) => check(),
            None => Ok(()),
        }
    }

    fn on_stop(&self, ctx: &JobContext) {
        if let Some(hook) = &self.on_stop {
            hook(ctx);
        }
    }
}

impl<S> fmt::Debug for PhasedTask<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.phases.iter().map(|p| p.info.name.as_str()).collect();
        f.debug_struct("PhasedTask")
            .field("phases", &names)
            .field("preflight", &self.preflight.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .finish()
    }
}
