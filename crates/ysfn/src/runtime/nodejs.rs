//! Node.js runtime: TypeScript entry, compiled with `tsc`, run with `node`.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;

use super::template::{WrapperTemplate, WrapperVars};
use super::{SfnRuntime, Shutdown, Step, build_steps};
use crate::error::{BuildError, RunError};

const WRAPPER_TS: &str = ".wrapper.ts";
const WRAPPER_JS: &str = ".wrapper.js";
const DEFINITION_FILE: &str = "jsonschema.json";

/// Package manager used for the dependency install step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PackageManager {
    #[default]
    Pnpm,
    Npm,
}

impl PackageManager {
    pub fn program(&self) -> &'static str {
        match self {
            PackageManager::Pnpm => "pnpm",
            PackageManager::Npm => "npm",
        }
    }
}

impl FromStr for PackageManager {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pnpm" => Ok(PackageManager::Pnpm),
            "npm" => Ok(PackageManager::Npm),
            other => Err(format!("unsupported package manager '{other}', expected pnpm or npm")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("only TypeScript entry files are supported, got {}", .0.display())]
pub struct UnsupportedEntry(pub PathBuf);

struct Wrapper {
    template: WrapperTemplate,
    function_name: String,
}

/// Runs a TypeScript stream function under Node.js.
pub struct NodejsRuntime {
    work_dir: PathBuf,
    /// Entry path as given (e.g. `src/app.ts`).
    entry: PathBuf,
    package_manager: PackageManager,
    wrapper: Option<Wrapper>,
}

impl NodejsRuntime {
    pub fn new(entry: impl Into<PathBuf>) -> Result<Self, UnsupportedEntry> {
        let entry = entry.into();
        if entry.extension().and_then(|e| e.to_str()) != Some("ts") || entry.file_name().is_none()
        {
            return Err(UnsupportedEntry(entry));
        }

        let work_dir = match entry.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(Self {
            work_dir,
            entry,
            package_manager: PackageManager::default(),
            wrapper: None,
        })
    }

    pub fn with_package_manager(mut self, package_manager: PackageManager) -> Self {
        self.package_manager = package_manager;
        self
    }

    /// Generate `.wrapper.ts` from `template` during build and run that
    /// instead of the entry itself.
    pub fn with_wrapper(
        mut self,
        template: WrapperTemplate,
        function_name: impl Into<String>,
    ) -> Self {
        self.wrapper = Some(Wrapper {
            template,
            function_name: function_name.into(),
        });
        self
    }

    /// File name, relative to the working directory, handed to `tsc`.
    fn source_file(&self) -> PathBuf {
        match self.wrapper {
            Some(_) => PathBuf::from(WRAPPER_TS),
            None => PathBuf::from(self.entry.file_name().unwrap_or_default()),
        }
    }

    /// Compiled artifact handed to `node`.
    fn artifact_file(&self) -> PathBuf {
        match self.wrapper {
            Some(_) => PathBuf::from(WRAPPER_JS),
            None => self.source_file().with_extension("js"),
        }
    }

    fn build_plan(&self) -> Vec<Step> {
        vec![
            Step::new(self.package_manager.program(), ["install"]),
            Step::new("tsc", [self.source_file()]),
        ]
    }

    fn wrapper_vars(&self, function_name: &str) -> WrapperVars {
        WrapperVars {
            work_dir: self.work_dir.display().to_string(),
            function_name: function_name.to_string(),
            file_name: self.entry.with_extension("").display().to_string(),
            file_path: self.entry.display().to_string(),
        }
    }
}

#[async_trait]
impl SfnRuntime for NodejsRuntime {
    fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    async fn build(&self) -> Result<(), BuildError> {
        if let Some(wrapper) = &self.wrapper {
            let dst = self.work_dir.join(WRAPPER_TS);
            tracing::debug!(dst = %dst.display(), "Generating wrapper entry point");
            wrapper
                .template
                .write_to(&self.wrapper_vars(&wrapper.function_name), &dst)
                .map_err(BuildError::Generate)?;
        }

        build_steps(&self.build_plan(), &self.work_dir).await?;
        tracing::info!("Build (install dependencies & compile) succeeded");
        Ok(())
    }

    async fn run(&self, shutdown: &Shutdown) -> Result<(), RunError> {
        Step::new("node", [self.artifact_file()])
            .run(&self.work_dir, shutdown)
            .await
    }

    async fn definition(&self) -> io::Result<Option<String>> {
        let path = self.work_dir.join(DEFINITION_FILE);
        tokio::fs::read_to_string(&path).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_typescript_entries() {
        assert!(NodejsRuntime::new("src/app.js").is_err());
        assert!(NodejsRuntime::new("src/app").is_err());
        let err = NodejsRuntime::new("main.go").err().unwrap();
        insta::assert_snapshot!(err.to_string(), @"only TypeScript entry files are supported, got main.go");
    }

    #[test]
    fn work_dir_is_entry_parent() {
        let rt = NodejsRuntime::new("src/app.ts").unwrap();
        assert_eq!(rt.work_dir(), Path::new("src"));

        let rt = NodejsRuntime::new("app.ts").unwrap();
        assert_eq!(rt.work_dir(), Path::new("."));
    }

    #[test]
    fn plan_compiles_entry_without_wrapper() {
        let rt = NodejsRuntime::new("src/app.ts")
            .unwrap()
            .with_package_manager(PackageManager::Npm);
        let plan: Vec<String> = rt.build_plan().iter().map(Step::display).collect();
        assert_eq!(plan, vec!["npm install", "tsc app.ts"]);
        assert_eq!(rt.artifact_file(), PathBuf::from("app.js"));
    }

    #[test]
    fn plan_compiles_wrapper_when_configured() {
        let rt = NodejsRuntime::new("src/app.ts")
            .unwrap()
            .with_wrapper(WrapperTemplate::new("{{FunctionName}}"), "get_weather");
        let plan: Vec<String> = rt.build_plan().iter().map(Step::display).collect();
        assert_eq!(plan, vec!["pnpm install", "tsc .wrapper.ts"]);
        assert_eq!(rt.artifact_file(), PathBuf::from(".wrapper.js"));

        let vars = rt.wrapper_vars("get_weather");
        assert_eq!(vars.file_name, "src/app");
        assert_eq!(vars.file_path, "src/app.ts");
        assert_eq!(vars.work_dir, "src");
    }

    #[test]
    fn package_manager_parses() {
        assert_eq!("npm".parse::<PackageManager>(), Ok(PackageManager::Npm));
        assert!("yarn".parse::<PackageManager>().is_err());
    }

    #[tokio::test]
    async fn definition_is_read_from_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("app.ts");
        let rt = NodejsRuntime::new(&entry).unwrap();

        assert!(rt.definition().await.is_err());

        std::fs::write(dir.path().join(DEFINITION_FILE), r#"{"name":"f"}"#).unwrap();
        assert_eq!(
            rt.definition().await.unwrap().as_deref(),
            Some(r#"{"name":"f"}"#)
        );
    }
}
