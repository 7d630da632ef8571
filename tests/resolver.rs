use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tenant_console::{
    capability::CapabilityDescriptor,
    error::{EngineError, EngineResult},
    resolver::{
        AcceptAll, AvailabilityMap, DependencyResolver, InstallPolicy, InstallPrompt,
        ModuleRegistry, ReportOnly, ResolverSettings,
    },
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeRegistry {
    version: String,
    installed: Mutex<HashSet<String>>,
    broken_probes: HashSet<String>,
    failing_installs: HashSet<String>,
    probes: Mutex<Vec<String>>,
    installs: Mutex<Vec<String>>,
    version_checks: Mutex<usize>,
}

impl FakeRegistry {
    fn new(version: &str, installed: &[&str]) -> Self {
        Self {
            version: version.to_string(),
            installed: Mutex::new(installed.iter().map(|m| m.to_string()).collect()),
            ..Default::default()
        }
    }

    fn probes(&self) -> Vec<String> {
        self.probes.lock().unwrap().clone()
    }

    fn installs(&self) -> Vec<String> {
        self.installs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModuleRegistry for FakeRegistry {
    async fn runtime_version(&self) -> EngineResult<String> {
        *self.version_checks.lock().unwrap() += 1;
        Ok(self.version.clone())
    }

    async fn is_installed(&self, module: &str) -> EngineResult<bool> {
        self.probes.lock().unwrap().push(module.to_string());
        if self.broken_probes.contains(module) {
            return Err(EngineError::Timeout(format!("probe of {} timed out", module)));
        }
        Ok(self.installed.lock().unwrap().contains(module))
    }

    async fn install(&self, module: &str) -> EngineResult<()> {
        self.installs.lock().unwrap().push(module.to_string());
        if self.failing_installs.contains(module) {
            return Err(EngineError::InstallFailed {
                module: module.to_string(),
                detail: "repository unreachable".into(),
            });
        }
        self.installed.lock().unwrap().insert(module.to_string());
        Ok(())
    }
}

/// Records what it was shown and answers with a fixed selection.
struct Scripted {
    answer: Vec<String>,
    shown: Mutex<Vec<AvailabilityMap>>,
}

impl Scripted {
    fn new(answer: &[&str]) -> Self {
        Self {
            answer: answer.iter().map(|m| m.to_string()).collect(),
            shown: Mutex::new(Vec::new()),
        }
    }
}

impl InstallPrompt for Scripted {
    fn choose(&self, modules: &AvailabilityMap) -> Vec<String> {
        self.shown.lock().unwrap().push(modules.clone());
        self.answer.clone()
    }
}

fn capabilities() -> Vec<CapabilityDescriptor> {
    vec![
        CapabilityDescriptor::new("one", "One", "Mail").with_modules(["M1", "M2"]),
        CapabilityDescriptor::new("two", "Two", "Mail").with_modules(["M2", "M3"]),
    ]
}

fn resolver(registry: Arc<FakeRegistry>, policy: InstallPolicy) -> DependencyResolver {
    DependencyResolver::new(
        ResolverSettings {
            install_policy: policy,
            ..Default::default()
        },
        registry,
    )
}

#[tokio::test]
async fn no_capabilities_means_no_work() {
    let registry = Arc::new(FakeRegistry::new("PowerShell 7.4.1", &[]));
    let prompt = Scripted::new(&[]);
    let caps: Vec<CapabilityDescriptor> = vec![
        CapabilityDescriptor::new("local", "Local only", "Misc"),
    ];
    let map = resolver(registry.clone(), InstallPolicy::default())
        .resolve(&caps, &prompt, &CancellationToken::new())
        .await
        .unwrap();
    assert!(map.is_empty());
    assert_eq!(*registry.version_checks.lock().unwrap(), 0);
    assert!(registry.probes().is_empty());
    assert!(prompt.shown.lock().unwrap().is_empty());
}

#[tokio::test]
async fn shared_modules_are_probed_once() {
    let registry = Arc::new(FakeRegistry::new("PowerShell 7.4.1", &["M2"]));
    let map = resolver(registry.clone(), InstallPolicy::default())
        .resolve(&capabilities(), &ReportOnly, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(registry.probes(), vec!["M1", "M2", "M3"]);
    assert_eq!(map.get("M1"), Some(false));
    assert_eq!(map.get("M2"), Some(true));
    assert_eq!(map.get("M3"), Some(false));
    assert!(registry.installs().is_empty());
}

#[tokio::test]
async fn failed_probe_counts_as_missing() {
    let mut registry = FakeRegistry::new("PowerShell 7.4.1", &["M1", "M2", "M3"]);
    registry.broken_probes.insert("M3".into());
    let registry = Arc::new(registry);
    let map = resolver(registry.clone(), InstallPolicy::default())
        .resolve(&capabilities(), &ReportOnly, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(map.missing(), vec!["M3"]);
}

#[tokio::test]
async fn old_runtime_stops_before_probing() {
    for version in ["PowerShell 5.1.19041", "command not found"] {
        let registry = Arc::new(FakeRegistry::new(version, &[]));
        let err = resolver(registry.clone(), InstallPolicy::default())
            .resolve(&capabilities(), &AcceptAll, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Runtime(_)), "{version}: {err:?}");
        assert!(registry.probes().is_empty());
        assert!(registry.installs().is_empty());
    }
}

#[tokio::test]
async fn accepted_installs_are_merged() {
    let registry = Arc::new(FakeRegistry::new("PowerShell 7.2.0", &["M2"]));
    let map = resolver(registry.clone(), InstallPolicy::default())
        .resolve(&capabilities(), &AcceptAll, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(registry.installs(), vec!["M1", "M3"]);
    assert!(map.missing().is_empty());
    assert_eq!(map.len(), 3);
}

#[tokio::test]
async fn prompt_sees_full_map_even_when_complete() {
    let registry = Arc::new(FakeRegistry::new("PowerShell 7.4.1", &["M1", "M2", "M3"]));
    let prompt = Scripted::new(&[]);
    resolver(registry.clone(), InstallPolicy::default())
        .resolve(&capabilities(), &prompt, &CancellationToken::new())
        .await
        .unwrap();
    let shown = prompt.shown.lock().unwrap();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].len(), 3);
    assert!(registry.installs().is_empty());
}

#[tokio::test]
async fn selections_outside_missing_set_are_ignored() {
    let registry = Arc::new(FakeRegistry::new("PowerShell 7.4.1", &["M2"]));
    let prompt = Scripted::new(&["M2", "Unknown.Module", "m3"]);
    let map = resolver(registry.clone(), InstallPolicy::default())
        .resolve(&capabilities(), &prompt, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(registry.installs(), vec!["m3"]);
    assert!(map.is_installed("M3"));
    assert!(!map.is_installed("M1"));
    assert_eq!(map.get("Unknown.Module"), None);
}

#[tokio::test]
async fn first_install_failure_stops_the_batch() {
    let mut registry = FakeRegistry::new("PowerShell 7.4.1", &[]);
    registry.failing_installs.insert("M1".into());
    let registry = Arc::new(registry);
    let err = resolver(registry.clone(), InstallPolicy::StopOnFirstFailure)
        .resolve(&capabilities(), &AcceptAll, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InstallFailed { ref module, .. } if module == "M1"));
    assert_eq!(registry.installs(), vec!["M1"]);
}

#[tokio::test]
async fn continue_policy_installs_the_rest() {
    let mut registry = FakeRegistry::new("PowerShell 7.4.1", &[]);
    registry.failing_installs.insert("M2".into());
    let registry = Arc::new(registry);
    let map = resolver(registry.clone(), InstallPolicy::ContinueOnError)
        .resolve(&capabilities(), &AcceptAll, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(registry.installs(), vec!["M1", "M2", "M3"]);
    assert_eq!(map.missing(), vec!["M2"]);
}

#[tokio::test]
async fn cancelled_resolution_installs_nothing() {
    let registry = Arc::new(FakeRegistry::new("PowerShell 7.4.1", &[]));
    let ct = CancellationToken::new();
    ct.cancel();
    let err = resolver(registry.clone(), InstallPolicy::default())
        .resolve(&capabilities(), &AcceptAll, &ct)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
    assert!(registry.installs().is_empty());
}
