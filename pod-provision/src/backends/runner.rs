use anyhow::{Context, Result};
use log::debug;
use std::process::Command;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs external programs to completion. An `Err` means the program could
/// not be run at all; a non-zero exit is reported through `CommandOutput`.
pub trait CommandRunner {
    fn run(&mut self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&mut self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!("running {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("failed to run {}", program))?;

        let output = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        for line in output.stdout.lines().chain(output.stderr.lines()) {
            debug!("{}: {}", program, line);
        }

        Ok(output)
    }
}
