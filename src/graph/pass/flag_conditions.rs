//! Selects one flag variant of a command stream.

use anyhow::Result;

use crate::core::error::Error;
use crate::core::name::Name;
use crate::graph::command::Command;
use crate::graph::pass::CommandVisitor;

/// Keeps the commands whose enclosing conditions all hold for a fixed set of enabled flags. Condition markers
/// are consumed and never appear in the output.
pub struct ApplyFlagConditionsPass<'a> {
    job: &'a Name,
    flags: &'a [Name],
    enabled: u32,
    /// Active conditions as (flag bit, expected value).
    conditions: Vec<(u32, bool)>,
    commands: Vec<Command>,
}

impl<'a> ApplyFlagConditionsPass<'a> {
    pub fn new(job: &'a Name, flags: &'a [Name], enabled: u32) -> Self {
        Self {
            job,
            flags,
            enabled,
            conditions: vec![],
            commands: vec![],
        }
    }

    fn flag_bit(&self, flag: &Name) -> Result<u32> {
        self.flags
            .iter()
            .position(|declared| declared == flag)
            .map(|index| index as u32)
            .ok_or_else(|| {
                Error::FlagNotDeclared {
                    job: self.job.clone(),
                    flag: flag.clone(),
                }
                .into()
            })
    }

    fn conditions_hold(&self) -> bool {
        self.conditions
            .iter()
            .all(|&(bit, expected)| ((self.enabled >> bit) & 1 == 1) == expected)
    }

    /// Filtered command stream. Fails if a condition was left open.
    pub fn into_commands(self) -> Result<Vec<Command>> {
        if !self.conditions.is_empty() {
            return Err(Error::UnbalancedCondition(self.job.clone()).into());
        }
        Ok(self.commands)
    }
}

impl CommandVisitor for ApplyFlagConditionsPass<'_> {
    fn visit(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::IfEnabledCond(flag) => {
                let bit = self.flag_bit(flag)?;
                self.conditions.push((bit, true));
            }
            Command::IfDisabledCond(flag) => {
                let bit = self.flag_bit(flag)?;
                self.conditions.push((bit, false));
            }
            Command::EndIfCond => {
                self.conditions
                    .pop()
                    .ok_or_else(|| Error::UnbalancedCondition(self.job.clone()))?;
            }
            _ => self.default_visit(command)?,
        }
        Ok(())
    }

    fn default_visit(&mut self, command: &Command) -> Result<()> {
        if self.conditions_hold() {
            self.commands.push(command.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::pass::run_pass;

    fn dispatch(x: u32) -> Command {
        Command::Dispatch {
            dims: [x, 1, 1],
        }
    }

    #[test]
    fn nested_conditions() -> Result<()> {
        let job = Name::from("job");
        let flags = [Name::from("a"), Name::from("b")];
        let stream = vec![
            dispatch(1),
            Command::IfEnabledCond("a".into()),
            dispatch(2),
            Command::IfDisabledCond("b".into()),
            dispatch(3),
            Command::EndIfCond,
            Command::EndIfCond,
            dispatch(4),
        ];

        let variant = |mask: u32| -> Result<Vec<Command>> {
            let mut pass = ApplyFlagConditionsPass::new(&job, &flags, mask);
            run_pass(&mut pass, &stream)?;
            pass.into_commands()
        };

        assert_eq!(variant(0b00)?, vec![dispatch(1), dispatch(4)]);
        assert_eq!(variant(0b01)?, vec![dispatch(1), dispatch(2), dispatch(3), dispatch(4)]);
        assert_eq!(variant(0b11)?, vec![dispatch(1), dispatch(2), dispatch(4)]);
        Ok(())
    }

    #[test]
    fn unbalanced_end_if() {
        let job = Name::from("job");
        let mut pass = ApplyFlagConditionsPass::new(&job, &[], 0);
        assert!(run_pass(&mut pass, &[Command::EndIfCond]).is_err());
    }
}
