//! Running a translated code unit to completion on the simulated host.

use super::{BalanceReport, PendingError, SimResult, SimRuntime};
use crate::exec::Machine;
use crate::ir::Module;
use crate::lower::CodeUnit;

/// What one execution produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// `repr` of the returned object; `None` when the function returned null.
    pub result: Option<String>,
    /// The error pending when the function returned.
    pub error: Option<PendingError>,
    /// Reference counts after the frame and the result were released.
    pub balance: BalanceReport,
    pub steps: usize,
}

impl RunOutcome {
    /// The result, or the pending error rendered the way the host prints it.
    pub fn summary(&self) -> String {
        match (&self.result, &self.error) {
            (Some(result), _) => result.clone(),
            (None, Some(err)) => format!("raised {}", err),
            (None, None) => "returned NULL without an error set".to_string(),
        }
    }
}

impl SimRuntime {
    /// Execute `unit`, already translated into `module`, with borrowed `globals` and
    /// positional `args`. Closure cells start out empty; builtins are created fresh.
    pub fn run_unit(
        &mut self,
        module: &Module,
        unit: &CodeUnit,
        globals: u64,
        args: &[u64],
    ) -> SimResult<RunOutcome> {
        let before = self.snapshot()?;

        let builtins = self.new_builtins_dict()?;
        let mut closure = Vec::with_capacity(unit.freevars.len());
        for _ in &unit.freevars {
            closure.push(self.new_cell(None)?);
        }
        let frame = self.new_frame(unit, globals, builtins, args, &closure)?;
        for cell in closure {
            self.release(cell)?;
        }

        let mut machine = Machine::new(module);
        let returned = machine.run(self, &unit.name, &[frame])?;
        let steps = machine.steps();

        let result = if returned == 0 {
            None
        } else {
            Some(self.repr(returned)?)
        };
        let error = self.take_error();
        if let (Some(_), Some(err)) = (&result, &error) {
            log::warn!("sim: {} returned a value with {} pending", unit.name, err);
        }

        self.xrelease(returned)?;
        self.release(frame)?;
        self.release(builtins)?;

        let balance = self.balance_since(&before)?;
        log::debug!("sim: ran {} in {} steps", unit.name, steps);
        Ok(RunOutcome {
            result,
            error,
            balance,
            steps,
        })
    }
}
