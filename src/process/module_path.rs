//! Locates the interpreter's built-in module set for bundled deployments.

use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
};

use tokio::process::Command;

/// Directories, relative to the executable's base path, that may hold a bundled runtime.
const CANDIDATES: &[&str] = &[".", "pwsh", "runtimes/pwsh", "PowerShell", "runtimes/win/lib/pwsh"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulePathSetup {
    pub home: PathBuf,
    pub module_path: OsString,
}

impl ModulePathSetup {
    /// Finds the first candidate with a `Modules` directory and prepends it to the
    /// current module search path.
    pub fn discover(base_dir: &Path) -> Option<Self> {
        let home = CANDIDATES
            .iter()
            .map(|c| base_dir.join(c))
            .find(|dir| dir.join("Modules").is_dir())?;
        let modules = home.join("Modules");
        let existing = env::var_os("PSModulePath").unwrap_or_default();
        let module_path = prepend_path(&modules, &existing)?;
        Some(Self { home, module_path })
    }

    pub fn apply(&self, cmd: &mut Command) {
        cmd.env("PSHOME", &self.home)
            .env("PSModulePath", &self.module_path);
    }
}

fn prepend_path(entry: &Path, existing: &OsString) -> Option<OsString> {
    let mut paths = vec![entry.to_path_buf()];
    paths.extend(env::split_paths(existing).filter(|p| p != entry && !p.as_os_str().is_empty()));
    env::join_paths(paths).ok()
}
