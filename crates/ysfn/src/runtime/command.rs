//! Generic runtime driven by plain command lines.
//!
//! Suitable for any language whose toolchain can be expressed as an install
//! command, a compile command and a run command.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{SfnRuntime, Shutdown, Step, build_steps};
use crate::error::{BuildError, RunError};

pub struct CommandRuntime {
    work_dir: PathBuf,
    install: Option<Step>,
    compile: Option<Step>,
    run: Step,
    definition_file: Option<PathBuf>,
}

impl CommandRuntime {
    /// `run` is the program and arguments of the long-lived child.
    pub fn new<I, S>(work_dir: impl Into<PathBuf>, program: impl Into<OsString>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            work_dir: work_dir.into(),
            install: None,
            compile: None,
            run: Step::new(program, args),
            definition_file: None,
        }
    }

    /// Parse a whitespace-separated command line into a runtime.
    ///
    /// Returns `None` for an empty command line.
    pub fn from_command_line(work_dir: impl Into<PathBuf>, line: &str) -> Option<Self> {
        let (program, args) = split_command_line(line)?;
        Some(Self::new(work_dir, program, args))
    }

    pub fn with_install<I, S>(mut self, program: impl Into<OsString>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.install = Some(Step::new(program, args));
        self
    }

    pub fn with_compile<I, S>(mut self, program: impl Into<OsString>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.compile = Some(Step::new(program, args));
        self
    }

    /// Same as [`with_install`](Self::with_install) but from a command line.
    pub fn with_install_line(self, line: &str) -> Self {
        match split_command_line(line) {
            Some((program, args)) => self.with_install(program, args),
            None => self,
        }
    }

    /// Same as [`with_compile`](Self::with_compile) but from a command line.
    pub fn with_compile_line(self, line: &str) -> Self {
        match split_command_line(line) {
            Some((program, args)) => self.with_compile(program, args),
            None => self,
        }
    }

    /// Definition document path, relative to the working directory.
    pub fn with_definition_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.definition_file = Some(file.into());
        self
    }
}

fn split_command_line(line: &str) -> Option<(String, Vec<String>)> {
    let mut parts = line.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

#[async_trait]
impl SfnRuntime for CommandRuntime {
    fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    async fn build(&self) -> Result<(), BuildError> {
        let steps: Vec<Step> = self
            .install
            .iter()
            .chain(self.compile.iter())
            .cloned()
            .collect();
        build_steps(&steps, &self.work_dir).await
    }

    async fn run(&self, shutdown: &Shutdown) -> Result<(), RunError> {
        self.run.run(&self.work_dir, shutdown).await
    }

    async fn definition(&self) -> io::Result<Option<String>> {
        match &self.definition_file {
            Some(file) => tokio::fs::read_to_string(self.work_dir.join(file))
                .await
                .map(Some),
            None => Ok(None),
        }
    }
}
