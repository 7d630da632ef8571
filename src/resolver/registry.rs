//! Local module registry access through one-shot pwsh runs.

use std::{fmt, path::PathBuf, sync::OnceLock, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::ResolverSettings;
use crate::{
    error::{EngineError, EngineResult},
    process::{pwsh::oneshot_args, run_bounded},
};

const NO_MATCH: &str = "NO_MATCH";

#[async_trait]
pub trait ModuleRegistry: Send + Sync {
    /// Raw output of the runtime's version query.
    async fn runtime_version(&self) -> EngineResult<String>;

    async fn is_installed(&self, module: &str) -> EngineResult<bool>;

    async fn install(&self, module: &str) -> EngineResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuntimeVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

pub fn parse_runtime_version(output: &str) -> Option<RuntimeVersion> {
    static VERSION: OnceLock<Option<Regex>> = OnceLock::new();
    let re = VERSION
        .get_or_init(|| Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").ok())
        .as_ref()?;
    let caps = re.captures(output)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u64>().ok());
    Some(RuntimeVersion {
        major: num(1)?,
        minor: num(2)?,
        patch: num(3).unwrap_or(0),
    })
}

/// Single-quoted pwsh literal.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[derive(Debug, Clone)]
pub struct PwshModuleRegistry {
    pwsh: PathBuf,
    runtime_probe_timeout: Duration,
    probe_timeout: Duration,
    install_timeout: Duration,
}

impl PwshModuleRegistry {
    pub fn from_settings(settings: &ResolverSettings) -> Self {
        Self {
            pwsh: settings.pwsh_path.clone(),
            runtime_probe_timeout: settings.runtime_probe_timeout,
            probe_timeout: settings.probe_timeout,
            install_timeout: settings.install_timeout,
        }
    }

    fn probe_script(module: &str) -> String {
        format!(
            "$m = Get-Module -ListAvailable -Name {name}; if ($m) {{ $m | ForEach-Object {{ $_.Name + ' ' + $_.Version }} }} else {{ '{NO_MATCH}' }}",
            name = quote(module)
        )
    }

    fn install_script(module: &str) -> String {
        format!(
            "Install-Module -Name {} -Scope CurrentUser -Force -AllowClobber -ErrorAction Stop",
            quote(module)
        )
    }
}

#[async_trait]
impl ModuleRegistry for PwshModuleRegistry {
    async fn runtime_version(&self) -> EngineResult<String> {
        let out = run_bounded(self.pwsh.as_os_str(), ["--version"], self.runtime_probe_timeout)
            .await?;
        if !out.success() {
            return Err(EngineError::Runtime(format!(
                "{} --version exited with {:?}: {}",
                self.pwsh.display(),
                out.code,
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }

    async fn is_installed(&self, module: &str) -> EngineResult<bool> {
        let out = run_bounded(
            self.pwsh.as_os_str(),
            oneshot_args(&Self::probe_script(module)),
            self.probe_timeout,
        )
        .await?;
        debug!(%module, code = ?out.code, stdout = %out.stdout.trim(), "module probe output");
        Ok(out.success() && !out.stdout.trim().is_empty() && !out.stdout.contains(NO_MATCH))
    }

    async fn install(&self, module: &str) -> EngineResult<()> {
        let out = run_bounded(
            self.pwsh.as_os_str(),
            oneshot_args(&Self::install_script(module)),
            self.install_timeout,
        )
        .await
        .map_err(|e| EngineError::InstallFailed {
            module: module.to_string(),
            detail: e.to_string(),
        })?;
        if !out.success() || !out.stderr.trim().is_empty() {
            let detail = if out.stderr.trim().is_empty() {
                format!("installer exited with {:?}", out.code)
            } else {
                out.stderr.trim().to_string()
            };
            return Err(EngineError::InstallFailed {
                module: module.to_string(),
                detail,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pwsh_version_banner() {
        let v = parse_runtime_version("PowerShell 7.4.1\n").unwrap();
        assert_eq!(v, RuntimeVersion { major: 7, minor: 4, patch: 1 });
        let v = parse_runtime_version("PowerShell 7.5").unwrap();
        assert_eq!(v.to_string(), "7.5.0");
        assert!(parse_runtime_version("PowerShell").is_none());
    }

    #[test]
    fn module_names_are_quoted() {
        assert_eq!(quote("O'Brien.Tools"), "'O''Brien.Tools'");
        let script = PwshModuleRegistry::probe_script("MicrosoftTeams");
        assert!(script.contains("-Name 'MicrosoftTeams'"));
        assert!(script.contains(NO_MATCH));
        let script = PwshModuleRegistry::install_script("MicrosoftTeams");
        assert!(script.contains("-Scope CurrentUser -Force"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_fails_closed_when_runtime_missing() {
        let settings = ResolverSettings {
            pwsh_path: PathBuf::from("/nonexistent/pwsh"),
            ..Default::default()
        };
        let reg = PwshModuleRegistry::from_settings(&settings);
        assert!(reg.is_installed("Anything").await.is_err());
        assert!(matches!(
            reg.runtime_version().await,
            Err(EngineError::Runtime(_))
        ));
        assert!(matches!(
            reg.install("Anything").await,
            Err(EngineError::InstallFailed { .. })
        ));
    }

    #[cfg(unix)]
    const FAKE_PWSH: &str = r#"#!/bin/sh
for last; do :; done
case "$last" in
    --version) echo "PowerShell 7.4.1" ;;
    *Get-Module*"'Present.Module'"*) echo "Present.Module 1.2.0" ;;
    *Get-Module*"'Absent.Module'"*) echo "NO_MATCH" ;;
    *Get-Module*"'Silent.Module'"*) ;;
    *Get-Module*"'Crashing.Module'"*) echo "Crashing.Module 1.0.0"; exit 1 ;;
    *Install-Module*"'Noisy.Module'"*) echo "WARNING: untrusted repository" >&2 ;;
    *Install-Module*"'Failing.Module'"*) exit 1 ;;
    *Install-Module*) ;;
    *) exit 2 ;;
esac
"#;

    #[cfg(unix)]
    fn fake_registry(dir: &std::path::Path) -> PwshModuleRegistry {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("pwsh");
        std::fs::write(&path, FAKE_PWSH).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        PwshModuleRegistry::from_settings(&ResolverSettings {
            pwsh_path: path,
            ..Default::default()
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_needs_listing_without_no_match_marker() {
        let dir = tempfile::tempdir().unwrap();
        let reg = fake_registry(dir.path());
        assert_eq!(reg.runtime_version().await.unwrap().trim(), "PowerShell 7.4.1");
        assert!(reg.is_installed("Present.Module").await.unwrap());
        assert!(!reg.is_installed("Absent.Module").await.unwrap());
        assert!(!reg.is_installed("Silent.Module").await.unwrap());
        assert!(!reg.is_installed("Crashing.Module").await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn install_rejects_stderr_output_and_bad_exit() {
        let dir = tempfile::tempdir().unwrap();
        let reg = fake_registry(dir.path());
        assert!(reg.install("Quiet.Module").await.is_ok());
        match reg.install("Noisy.Module").await {
            Err(EngineError::InstallFailed { module, detail }) => {
                assert_eq!(module, "Noisy.Module");
                assert!(detail.contains("untrusted repository"), "{detail}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            reg.install("Failing.Module").await,
            Err(EngineError::InstallFailed { ref module, .. }) if module == "Failing.Module"
        ));
    }
}
