//! Capability dependency resolver.
//!
//! The module list is derived from the registered capabilities on every run; nothing
//! here names a module.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use serde::{ser::SerializeMap, Serialize, Serializer};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    capability::{CapabilityDescriptor, CapabilityProvider},
    error::{EngineError, EngineResult},
};

pub mod prompt;
pub mod registry;

pub use prompt::{AcceptAll, InstallPrompt, ReportOnly, TerminalPrompt};
pub use registry::{parse_runtime_version, ModuleRegistry, PwshModuleRegistry, RuntimeVersion};

/// What to do when one of several selected installs fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallPolicy {
    /// The first failure is returned and the remaining selections are skipped.
    #[default]
    StopOnFirstFailure,
    /// Failures are logged, the module stays marked missing, the batch continues.
    ContinueOnError,
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub pwsh_path: PathBuf,
    pub min_runtime_major: u64,
    pub runtime_probe_timeout: Duration,
    pub probe_timeout: Duration,
    pub install_timeout: Duration,
    pub install_policy: InstallPolicy,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            pwsh_path: PathBuf::from("pwsh"),
            min_runtime_major: 7,
            runtime_probe_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(30),
            install_timeout: Duration::from_secs(180),
            install_policy: InstallPolicy::StopOnFirstFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ModuleStatus {
    name: String,
    installed: bool,
}

/// Module name (case-insensitive) to installed flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityMap {
    entries: BTreeMap<String, ModuleStatus>,
}

impl AvailabilityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module: &str, installed: bool) {
        let status = self
            .entries
            .entry(module.to_lowercase())
            .or_insert_with(|| ModuleStatus {
                name: module.to_string(),
                installed,
            });
        status.installed = installed;
    }

    pub fn get(&self, module: &str) -> Option<bool> {
        self.entries
            .get(&module.to_lowercase())
            .map(|s| s.installed)
    }

    pub fn is_installed(&self, module: &str) -> bool {
        self.get(module).unwrap_or(false)
    }

    /// Entries in name order, with the spelling first seen.
    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.entries.values().map(|s| (s.name.as_str(), s.installed))
    }

    pub fn missing(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, installed)| !installed)
            .map(|(name, _)| name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn require(&self, module: &str) -> EngineResult<()> {
        if self.is_installed(module) {
            Ok(())
        } else {
            Err(EngineError::ModuleMissing(module.to_string()))
        }
    }

    pub fn require_capability(&self, capability: &CapabilityDescriptor) -> EngineResult<()> {
        capability
            .required_modules()
            .iter()
            .try_for_each(|m| self.require(m))
    }
}

impl Serialize for AvailabilityMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, installed) in self.iter() {
            map.serialize_entry(name, &installed)?;
        }
        map.end()
    }
}

/// Union of every capability's required modules, deduplicated case-insensitively and
/// sorted alphabetically.
pub fn required_modules(capabilities: &[CapabilityDescriptor]) -> Vec<String> {
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    for module in capabilities.iter().flat_map(|c| c.required_modules()) {
        let trimmed = module.trim();
        if trimmed.is_empty() {
            continue;
        }
        seen.entry(trimmed.to_lowercase())
            .or_insert_with(|| trimmed.to_string());
    }
    seen.into_values().collect()
}

pub struct DependencyResolver {
    settings: ResolverSettings,
    registry: Arc<dyn ModuleRegistry>,
}

impl DependencyResolver {
    pub fn new(settings: ResolverSettings, registry: Arc<dyn ModuleRegistry>) -> Self {
        Self { settings, registry }
    }

    pub fn pwsh(settings: ResolverSettings) -> Self {
        let registry = Arc::new(PwshModuleRegistry::from_settings(&settings));
        Self::new(settings, registry)
    }

    /// Fails unless the host runtime answers with at least the configured major version.
    pub async fn check_runtime(&self, ct: &CancellationToken) -> EngineResult<RuntimeVersion> {
        let raw = tokio::select! {
            biased;
            _ = ct.cancelled() => return Err(EngineError::Cancelled),
            raw = self.registry.runtime_version() => raw?,
        };
        let version = parse_runtime_version(&raw).ok_or_else(|| {
            EngineError::Runtime(format!("unrecognized version output: {:?}", raw.trim()))
        })?;
        if version.major < self.settings.min_runtime_major {
            return Err(EngineError::Runtime(format!(
                "runtime {} is older than required major version {}",
                version, self.settings.min_runtime_major
            )));
        }
        info!(%version, "host runtime available");
        Ok(version)
    }

    /// Probes each required module. Probe failures count as not installed.
    pub async fn probe(
        &self,
        modules: &[String],
        ct: &CancellationToken,
    ) -> EngineResult<AvailabilityMap> {
        let mut map = AvailabilityMap::new();
        for module in modules {
            let installed = tokio::select! {
                biased;
                _ = ct.cancelled() => return Err(EngineError::Cancelled),
                r = self.registry.is_installed(module) => match r {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(%module, error = %e, "module probe failed; treating as not installed");
                        false
                    }
                },
            };
            info!(%module, installed, "module probed");
            map.insert(module, installed);
        }
        Ok(map)
    }

    /// Computes, confirms and completes the module set the capabilities need.
    pub async fn resolve(
        &self,
        capabilities: &dyn CapabilityProvider,
        prompt: &dyn InstallPrompt,
        ct: &CancellationToken,
    ) -> EngineResult<AvailabilityMap> {
        let modules = required_modules(capabilities.capabilities());
        if modules.is_empty() {
            return Ok(AvailabilityMap::new());
        }
        self.check_runtime(ct).await?;
        let mut map = self.probe(&modules, ct).await?;

        let selected: Vec<String> = prompt
            .choose(&map)
            .into_iter()
            .filter(|m| map.get(m) == Some(false))
            .collect();

        for module in selected {
            if ct.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            info!(%module, "installing module");
            let result = tokio::select! {
                biased;
                _ = ct.cancelled() => return Err(EngineError::Cancelled),
                r = self.registry.install(&module) => r,
            };
            match (result, self.settings.install_policy) {
                (Ok(()), _) => {
                    info!(%module, "module installed");
                    map.insert(&module, true);
                }
                (Err(e), InstallPolicy::StopOnFirstFailure) => return Err(e),
                (Err(e), InstallPolicy::ContinueOnError) => {
                    warn!(%module, error = %e, "module install failed, continuing");
                }
            }
        }
        Ok(map)
    }
}
