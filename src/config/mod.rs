use std::{
    collections::HashMap,
    env,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use directories::BaseDirs;

use crate::{
    engine::{EngineSettings, RetryPolicy},
    resolver::{InstallPolicy, ResolverSettings},
};

#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    pub config_path: PathBuf,
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(default_config_path())
    }

    pub fn load_from(config_path: PathBuf) -> Self {
        let mut map = default_map();

        // Read .consolerc if exists
        if config_path.exists() {
            if let Ok(file) = fs::File::open(&config_path) {
                let reader = BufReader::new(file);
                for line in reader.lines().map_while(Result::ok) {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((k, v)) = line.split_once('=') {
                        map.insert(k.trim().to_string(), v.trim().to_string());
                    }
                }
            }
        }

        // Overlay environment variables (take precedence)
        for (k, v) in env::vars() {
            if is_config_key(&k) {
                map.insert(k, v);
            }
        }

        Self { inner: map, config_path }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        // ENV first
        if let Ok(v) = env::var(key) {
            return Some(v);
        }
        self.inner.get(key).cloned()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false)
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn get_secs(&self, key: &str, fallback: u64) -> Duration {
        Duration::from_secs(self.get_u64(key).unwrap_or(fallback))
    }

    pub fn pwsh_path(&self) -> PathBuf {
        self.get("PWSH_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("pwsh"))
    }

    /// Token for a secondary channel: `ADMIN_TOKEN_<SCOPE>` first, then `ADMIN_TOKEN`.
    pub fn token_for_scope(&self, scope: &str) -> Option<String> {
        self.get(&scope_token_key(scope))
            .or_else(|| self.get("ADMIN_TOKEN"))
            .filter(|t| !t.trim().is_empty())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let defaults = EngineSettings::default();
        let retry = RetryPolicy::default()
            .with_max_attempts(
                self.get_u64("MAX_ATTEMPTS")
                    .map(|n| n.clamp(1, 10) as u32)
                    .unwrap_or(defaults.retry.max_attempts),
            )
            .with_base_delay(Duration::from_millis(
                self.get_u64("RETRY_BASE_DELAY_MS").unwrap_or(50),
            ));
        EngineSettings {
            pwsh_path: self.pwsh_path(),
            allow_unrestricted_scripts: self.get_bool("ALLOW_UNRESTRICTED_SCRIPTS"),
            connect_command: self
                .get("CONNECT_COMMAND")
                .unwrap_or(defaults.connect_command),
            identity_parameter: self
                .get("IDENTITY_PARAMETER")
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(defaults.identity_parameter),
            connect_parameters: defaults.connect_parameters,
            connect_timeout: self.get_secs("CONNECT_TIMEOUT", defaults.connect_timeout.as_secs()),
            max_command_name_length: self
                .get_usize("MAX_COMMAND_NAME_LENGTH")
                .unwrap_or(defaults.max_command_name_length),
            max_parameter_count: self
                .get_usize("MAX_PARAMETER_COUNT")
                .unwrap_or(defaults.max_parameter_count),
            session_start_timeout: self.get_secs("SESSION_START_TIMEOUT", 30),
            retry,
            base_dir: env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf)),
        }
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        let policy = match self.get("INSTALL_POLICY").as_deref() {
            Some(v) if v.eq_ignore_ascii_case("continue") => InstallPolicy::ContinueOnError,
            _ => InstallPolicy::StopOnFirstFailure,
        };
        ResolverSettings {
            pwsh_path: self.pwsh_path(),
            min_runtime_major: self.get_u64("MIN_RUNTIME_MAJOR").unwrap_or(7),
            runtime_probe_timeout: self.get_secs("RUNTIME_PROBE_TIMEOUT", 30),
            probe_timeout: self.get_secs("MODULE_PROBE_TIMEOUT", 30),
            install_timeout: self.get_secs("MODULE_INSTALL_TIMEOUT", 180),
            install_policy: policy,
        }
    }
}

fn scope_token_key(scope: &str) -> String {
    let normalized: String = scope
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("ADMIN_TOKEN_{}", normalized)
}

fn is_config_key(k: &str) -> bool {
    const KEYS: &[&str] = &[
        "PWSH_PATH",
        "MIN_RUNTIME_MAJOR",
        "RUNTIME_PROBE_TIMEOUT",
        "MODULE_PROBE_TIMEOUT",
        "MODULE_INSTALL_TIMEOUT",
        "SESSION_START_TIMEOUT",
        "CONNECT_COMMAND",
        "IDENTITY_PARAMETER",
        "CONNECT_TIMEOUT",
        "ALLOW_UNRESTRICTED_SCRIPTS",
        "MAX_COMMAND_NAME_LENGTH",
        "MAX_PARAMETER_COUNT",
        "MAX_ATTEMPTS",
        "RETRY_BASE_DELAY_MS",
        "INSTALL_POLICY",
        "ADMIN_UPN",
        "ADMIN_TOKEN",
        "LOG_FILTER",
    ];

    KEYS.contains(&k) || k.starts_with("TENANT_CONSOLE_") || k.starts_with("ADMIN_TOKEN_")
}

fn default_config_path() -> PathBuf {
    let base = BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    base.join("tenant_console").join(".consolerc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();

    // Numbers
    m.insert("MIN_RUNTIME_MAJOR".into(), "7".into());
    m.insert("RUNTIME_PROBE_TIMEOUT".into(), "30".into());
    m.insert("MODULE_PROBE_TIMEOUT".into(), "30".into());
    m.insert("MODULE_INSTALL_TIMEOUT".into(), "180".into());
    m.insert("SESSION_START_TIMEOUT".into(), "30".into());
    m.insert("CONNECT_TIMEOUT".into(), "300".into());
    m.insert("MAX_COMMAND_NAME_LENGTH".into(), "128".into());
    m.insert("MAX_PARAMETER_COUNT".into(), "64".into());
    m.insert("MAX_ATTEMPTS".into(), "3".into());
    m.insert("RETRY_BASE_DELAY_MS".into(), "50".into());

    // Strings
    m.insert("PWSH_PATH".into(), "pwsh".into());
    m.insert("CONNECT_COMMAND".into(), "Connect-ExchangeOnline".into());
    m.insert("IDENTITY_PARAMETER".into(), "UserPrincipalName".into());
    m.insert("INSTALL_POLICY".into(), "stop".into());

    // Bools as strings
    m.insert("ALLOW_UNRESTRICTED_SCRIPTS".into(), "false".into());

    m
}
