use super::SchedulerEnv;
use crate::error::Result;
use tracing::debug;

/// One named state of a layer.
pub trait Phase: Send {
    fn name(&self) -> &'static str;

    /// Precondition, typically a queue below its watermark.
    fn is_startable(&self, env: &SchedulerEnv) -> bool;

    /// Perform one bounded unit of work. Returns `true` at end of line (the
    /// phase has nothing more to do right now); `false` asks to be re-run.
    fn step(&mut self, env: &SchedulerEnv) -> Result<bool>;

    /// Called when the layer completes a round, before the first phase runs
    /// again.
    fn on_round(&mut self, _env: &SchedulerEnv) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayerStep {
    /// A phase actually ran.
    pub ran: bool,
    /// The round-robin wrapped back to the first phase.
    pub wrapped: bool,
}

/// Round-robin over phases. A phase that is not at end of line is re-run up
/// to `max_repeats` times before the layer moves on.
pub struct Layer {
    name: &'static str,
    phases: Vec<Box<dyn Phase>>,
    current: usize,
    repeats: u32,
    max_repeats: u32,
}

impl Layer {
    pub fn new(name: &'static str, phases: Vec<Box<dyn Phase>>, max_repeats: u32) -> Self {
        Self {
            name,
            phases,
            current: 0,
            repeats: 0,
            max_repeats: max_repeats.max(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn current_phase(&self) -> Option<&'static str> {
        self.phases.get(self.current).map(|p| p.name())
    }

    pub fn step(&mut self, env: &SchedulerEnv) -> Result<LayerStep> {
        if self.phases.is_empty() {
            return Ok(LayerStep::default());
        }
        let phase = &mut self.phases[self.current];
        if !phase.is_startable(env) {
            return Ok(LayerStep::default());
        }
        let eol = phase.step(env)?;
        let mut step = LayerStep {
            ran: true,
            wrapped: false,
        };
        self.repeats += 1;
        if eol || self.repeats >= self.max_repeats {
            debug!(
                "{}: phase {} done after {} run(s)",
                self.name,
                phase.name(),
                self.repeats
            );
            step.wrapped = self.advance(env)?;
        }
        Ok(step)
    }

    /// Move to the next phase, skipping nothing. Returns true on wrap.
    fn advance(&mut self, env: &SchedulerEnv) -> Result<bool> {
        self.repeats = 0;
        self.current = (self.current + 1) % self.phases.len();
        if self.current == 0 {
            for phase in self.phases.iter_mut() {
                phase.on_round(env)?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Skip the current phase without running it.
    pub fn skip(&mut self, env: &SchedulerEnv) -> Result<bool> {
        if self.phases.is_empty() {
            return Ok(false);
        }
        self.advance(env)
    }
}
