use anyhow::{bail, Context, Result};
use serde_json::Value as JsonValue;
use std::process::Command;
use tracing::debug;

/// Outcome of one job-step iteration.
///
/// `Stop` ends the loop after the current iteration regardless of any
/// remaining budget. `Continue` keeps looping and clears the carried
/// result. `Carry` keeps looping and hands the value to the next
/// iteration. Dependent jobs rely on this exact tri-state, so it is not
/// collapsed into a plain boolean.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Stop,
    Continue,
    Carry(JsonValue),
}

/// A job's repeatedly executed unit of work.
///
/// `carried` is whatever the previous iteration returned via
/// [`StepOutcome::Carry`]. It is best-effort in-process state, not a
/// durable channel: a fresh worker process starts without one.
pub trait JobStep {
    fn execute(&mut self, iteration: u64, carried: Option<&JsonValue>) -> Result<StepOutcome>;
}

/// Job step that runs a configured command once per iteration.
///
/// A non-zero exit status is a step failure and aborts the run; the
/// command deciding to stop the loop cleanly is not a supported contract
/// for this step.
pub struct ShellCommandStep {
    program: String,
    args: Vec<String>,
}

impl ShellCommandStep {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl JobStep for ShellCommandStep {
    fn execute(&mut self, iteration: u64, _carried: Option<&JsonValue>) -> Result<StepOutcome> {
        debug!("[loop {}] running {} {:?}", iteration, self.program, self.args);

        let status = Command::new(&self.program)
            .args(&self.args)
            .status()
            .with_context(|| format!("Failed to run step command '{}'", self.program))?;

        if !status.success() {
            bail!("Step command '{}' exited with {}", self.program, status);
        }
        Ok(StepOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successful_command_continues() {
        let mut step = ShellCommandStep::new("true", vec![]);
        assert_eq!(step.execute(1, None).unwrap(), StepOutcome::Continue);
    }

    #[test]
    fn test_failing_command_is_a_step_failure() {
        let mut step = ShellCommandStep::new("false", vec![]);
        assert!(step.execute(1, None).is_err());
    }

    #[test]
    fn test_missing_command_is_a_step_failure() {
        let mut step = ShellCommandStep::new("/nonexistent/binary/for/sure", vec![]);
        assert!(step.execute(1, None).is_err());
    }
}
