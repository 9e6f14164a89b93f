//! Coverage selection for the instrumentation collaborator.
//!
//! Include/exclude patterns come from config; on top of those the agent
//! unconditionally masks its own namespace, the instrumentation library,
//! core runtime packages, and compiler-synthetic classes.

use aivory_config::AgentConfig;

const MASKED_PREFIXES: &[&str] = &[
    "com.aivory.monitor.agent",
    "net.bytebuddy",
    "sun.",
    "jdk.",
    "java.lang.invoke",
    "java.lang.ref",
];

/// Whether the instrumentation layer should cover `class_name`.
pub fn should_instrument(config: &AgentConfig, class_name: &str) -> bool {
    if MASKED_PREFIXES
        .iter()
        .any(|prefix| class_name.starts_with(prefix))
    {
        return false;
    }
    // Compiler-generated classes (lambdas, proxies).
    if class_name.contains("$$") {
        return false;
    }
    if config
        .exclude_patterns
        .iter()
        .any(|pattern| matches_pattern(pattern, class_name))
    {
        return false;
    }
    config
        .include_patterns
        .iter()
        .any(|pattern| matches_pattern(pattern, class_name))
}

/// `*` matches everything, `prefix.*` matches the package subtree,
/// anything else is an exact class name.
fn matches_pattern(pattern: &str, class_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return match class_name.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('.'),
            None => false,
        };
    }
    pattern == class_name
}
