use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Program plus leading arguments that execute a step file for one language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl RunnerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Language runtime name -> runner command.
#[derive(Debug, Clone, Default)]
pub struct RunnerTable {
    runners: HashMap<String, RunnerCommand>,
}

impl RunnerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `python` and `node` run through the runner scripts in `runners_dir`; `sh` runs directly.
    pub fn with_defaults(runners_dir: &Path) -> Self {
        let script = |name: &str| runners_dir.join(name).to_string_lossy().into_owned();

        let mut table = Self::new();
        table.insert("python", RunnerCommand::new("python3").arg(script("python_runner.py")));
        table.insert("node", RunnerCommand::new("node").arg(script("node_runner.js")));
        table.insert("sh", RunnerCommand::new("sh"));
        table
    }

    pub fn insert(&mut self, runtime: impl Into<String>, command: RunnerCommand) {
        self.runners.insert(runtime.into(), command);
    }

    pub fn get(&self, runtime: &str) -> Option<&RunnerCommand> {
        self.runners.get(runtime)
    }

    pub fn runtimes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.runners.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    /// `<runner…> <file> <payload>`, or `None` for an unknown runtime.
    pub fn command(&self, runtime: &str, file: &Path, payload: &str) -> Option<Command> {
        let runner = self.get(runtime)?;
        let mut cmd = Command::new(&runner.program);
        cmd.args(&runner.args).arg(absolute(file)).arg(payload);
        Some(cmd)
    }
}

fn absolute(file: &Path) -> PathBuf {
    if file.is_absolute() {
        return file.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(file))
        .unwrap_or_else(|_| file.to_path_buf())
}
