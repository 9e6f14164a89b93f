//! Agent configuration snapshot.
//!
//! Configuration is assembled once at agent startup from three layered
//! sources, later sources overriding earlier ones:
//!
//! 1. comma-separated `key=value` agent arguments,
//! 2. process properties (`aivory.*`), handed over by the embedder,
//! 3. `AIVORY_*` environment variables.
//!
//! The resulting [`AgentConfig`] is immutable for the lifetime of the
//! process. Release/git context is resolved eagerly (explicit settings
//! first, then well-known CI/PaaS environment variables) and cached on the
//! snapshot.

mod release;

use std::collections::HashMap;

use chrono::Utc;
use rand::Rng;
use tracing::warn;

pub use release::ReleaseContext;
use release::ReleaseSettings;

/// Immutable agent configuration, built once at startup.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub api_key: Option<String>,
    pub backend_url: String,
    pub environment: String,
    pub sampling_rate: f64,
    pub max_capture_depth: usize,
    pub max_string_length: usize,
    pub max_collection_size: usize,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub debug: bool,
    pub hostname: String,
    pub agent_id: String,
    /// Version string of the monitored runtime (the host's `java.version`
    /// property when available).
    pub runtime_version: String,
    /// Release/git context resolved at startup; `None` when no source
    /// provided any version information.
    pub git_context: Option<ReleaseContext>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            backend_url: "wss://api.aivory.net/ws/agent".to_string(),
            environment: "production".to_string(),
            sampling_rate: 1.0,
            max_capture_depth: 10,
            max_string_length: 1000,
            max_collection_size: 100,
            include_patterns: vec!["*".to_string()],
            exclude_patterns: [
                "java.*",
                "javax.*",
                "sun.*",
                "jdk.*",
                "com.sun.*",
                "org.slf4j.*",
                "ch.qos.logback.*",
                "org.apache.logging.*",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            debug: false,
            hostname: "unknown".to_string(),
            agent_id: generate_agent_id(),
            runtime_version: "unknown".to_string(),
            git_context: None,
        }
    }
}

impl AgentConfig {
    /// Parses configuration from agent arguments plus the real process
    /// environment. The embedder-supplied property map is empty here; use
    /// [`AgentConfig::parse_from`] when properties are available.
    pub fn parse(agent_args: Option<&str>) -> AgentConfig {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::parse_from(agent_args, &HashMap::new(), &env)
    }

    /// Parses configuration from explicit sources. `props` carries the
    /// host's properties (`aivory.*`, `java.version`); `env` is an
    /// environment snapshot.
    pub fn parse_from(
        agent_args: Option<&str>,
        props: &HashMap<String, String>,
        env: &HashMap<String, String>,
    ) -> AgentConfig {
        let mut config = AgentConfig {
            hostname: resolve_hostname(env),
            ..AgentConfig::default()
        };
        let mut release = ReleaseSettings::default();

        if let Some(args) = agent_args {
            for arg in args.split(',') {
                if let Some((key, value)) = arg.split_once('=') {
                    config.apply(key.trim(), value.trim(), &mut release);
                }
            }
        }

        config.load_properties(props, &mut release);
        config.load_environment(env, &mut release);

        config.git_context = release.resolve(env);
        config
    }

    fn apply(&mut self, key: &str, value: &str, release: &mut ReleaseSettings) {
        match key.to_ascii_lowercase().as_str() {
            "apikey" | "api_key" => self.api_key = Some(value.to_string()),
            "backendurl" | "backend_url" => self.backend_url = value.to_string(),
            "environment" | "env" => self.environment = value.to_string(),
            "samplingrate" | "sampling_rate" => {
                self.sampling_rate = parse_number(key, value, self.sampling_rate);
            }
            "maxdepth" | "max_depth" => {
                self.max_capture_depth = parse_number(key, value, self.max_capture_depth);
            }
            "include" => self.include_patterns = split_patterns(value),
            "exclude" => self.exclude_patterns = split_patterns(value),
            "debug" => self.debug = value.eq_ignore_ascii_case("true"),
            "release" => release.release = non_empty(value),
            "version" => release.version = non_empty(value),
            "commit" => release.commit = non_empty(value),
            "branch" => release.branch = non_empty(value),
            "repository" | "repo" => release.repository = non_empty(value),
            _ => {}
        }
    }

    fn load_properties(&mut self, props: &HashMap<String, String>, release: &mut ReleaseSettings) {
        let get = |key: &str| props.get(key).map(String::as_str);

        if let Some(val) = get("aivory.api.key") {
            self.api_key = Some(val.to_string());
        }
        if let Some(val) = get("aivory.backend.url") {
            self.backend_url = val.to_string();
        }
        if let Some(val) = get("aivory.environment") {
            self.environment = val.to_string();
        }
        if let Some(val) = get("aivory.sampling.rate") {
            self.sampling_rate = parse_number("aivory.sampling.rate", val, self.sampling_rate);
        }
        if let Some(val) = get("aivory.capture.maxDepth") {
            self.max_capture_depth = parse_number("aivory.capture.maxDepth", val, self.max_capture_depth);
        }
        if let Some(val) = get("aivory.capture.maxStringLength") {
            self.max_string_length =
                parse_number("aivory.capture.maxStringLength", val, self.max_string_length);
        }
        if let Some(val) = get("aivory.capture.maxCollectionSize") {
            self.max_collection_size =
                parse_number("aivory.capture.maxCollectionSize", val, self.max_collection_size);
        }
        if let Some(val) = get("aivory.include") {
            self.include_patterns = split_patterns(val);
        }
        if let Some(val) = get("aivory.exclude") {
            self.exclude_patterns = split_patterns(val);
        }
        if let Some(val) = get("aivory.log.level") {
            if val.eq_ignore_ascii_case("debug") {
                self.debug = true;
            }
        }
        if let Some(val) = get("aivory.debug") {
            self.debug = val.eq_ignore_ascii_case("true");
        }
        if let Some(val) = get("java.version") {
            self.runtime_version = val.to_string();
        }

        if let Some(val) = get("aivory.release") {
            release.release = non_empty(val);
        }
        if let Some(val) = get("aivory.version") {
            release.version = non_empty(val);
        }
        if let Some(val) = get("aivory.commit") {
            release.commit = non_empty(val);
        }
        if let Some(val) = get("aivory.branch") {
            release.branch = non_empty(val);
        }
        if let Some(val) = get("aivory.repository") {
            release.repository = non_empty(val);
        }
    }

    fn load_environment(&mut self, env: &HashMap<String, String>, release: &mut ReleaseSettings) {
        let get = |key: &str| env.get(key).map(String::as_str);

        if let Some(val) = get("AIVORY_API_KEY") {
            self.api_key = Some(val.to_string());
        }
        if let Some(val) = get("AIVORY_BACKEND_URL") {
            self.backend_url = val.to_string();
        }
        if let Some(val) = get("AIVORY_ENVIRONMENT") {
            self.environment = val.to_string();
        }
        if let Some(val) = get("AIVORY_SAMPLING_RATE") {
            self.sampling_rate = parse_number("AIVORY_SAMPLING_RATE", val, self.sampling_rate);
        }
        if let Some(val) = get("AIVORY_MAX_DEPTH") {
            self.max_capture_depth = parse_number("AIVORY_MAX_DEPTH", val, self.max_capture_depth);
        }
        if let Some(val) = get("AIVORY_MAX_STRING_LENGTH") {
            self.max_string_length =
                parse_number("AIVORY_MAX_STRING_LENGTH", val, self.max_string_length);
        }
        if let Some(val) = get("AIVORY_MAX_COLLECTION_SIZE") {
            self.max_collection_size =
                parse_number("AIVORY_MAX_COLLECTION_SIZE", val, self.max_collection_size);
        }
        if let Some(val) = get("AIVORY_INCLUDE") {
            self.include_patterns = split_patterns(val);
        }
        if let Some(val) = get("AIVORY_EXCLUDE") {
            self.exclude_patterns = split_patterns(val);
        }
        if let Some(val) = get("AIVORY_DEBUG") {
            self.debug = val.eq_ignore_ascii_case("true");
        }

        if let Some(val) = get("AIVORY_RELEASE") {
            release.release = non_empty(val);
        }
        if let Some(val) = get("AIVORY_VERSION") {
            release.version = non_empty(val);
        }
        if let Some(val) = get("AIVORY_COMMIT") {
            release.commit = non_empty(val);
        }
        if let Some(val) = get("AIVORY_BRANCH") {
            release.branch = non_empty(val);
        }
        if let Some(val) = get("AIVORY_REPOSITORY") {
            release.repository = non_empty(val);
        }
    }

    /// Sampling gate: `true` for rates >= 1, `false` for rates <= 0,
    /// otherwise a fresh Bernoulli draw per call.
    pub fn should_sample(&self) -> bool {
        if self.sampling_rate >= 1.0 {
            return true;
        }
        if self.sampling_rate <= 0.0 {
            return false;
        }
        rand::rng().random::<f64>() < self.sampling_rate
    }
}

fn parse_number<T: std::str::FromStr + Copy + std::fmt::Display>(
    key: &str,
    value: &str,
    current: T,
) -> T {
    match value.parse::<T>() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!("ignoring unparseable value for {key}: {value:?} (keeping {current})");
            current
        }
    }
}

fn split_patterns(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn resolve_hostname(env: &HashMap<String, String>) -> String {
    env.get("HOSTNAME")
        .or_else(|| env.get("COMPUTERNAME"))
        .filter(|name| !name.is_empty())
        .cloned()
        .unwrap_or_else(|| "unknown".to_string())
}

fn generate_agent_id() -> String {
    let suffix: u16 = rand::rng().random();
    format!("agent-{:x}-{:x}", Utc::now().timestamp_millis(), suffix)
}
