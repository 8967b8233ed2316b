//! Compiler passes that turn a recorded command stream into a native command list.
//!
//! Every pass walks the stream once through [`CommandVisitor`]. A pass handles the commands it cares about in
//! [`CommandVisitor::visit`] and forwards the rest to [`CommandVisitor::default_visit`].

use anyhow::Result;

use crate::graph::command::Command;

pub mod barrier_insertion;
pub mod flag_conditions;
pub mod generate_command_list;

pub use barrier_insertion::BarrierInsertionPass;
pub use flag_conditions::ApplyFlagConditionsPass;
pub use generate_command_list::GenerateCommandListPass;

pub trait CommandVisitor {
    fn visit(&mut self, command: &Command) -> Result<()> {
        self.default_visit(command)
    }

    fn default_visit(&mut self, command: &Command) -> Result<()>;
}

/// Feed every command of the stream to the visitor, in order.
pub fn run_pass<V: CommandVisitor + ?Sized>(visitor: &mut V, commands: &[Command]) -> Result<()> {
    commands.iter().try_for_each(|command| visitor.visit(command))
}
