use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use ignore::gitignore::Gitignore;
use ignore::gitignore::GitignoreBuilder;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::types::AccessMode;
use crate::types::EdgeIpVersion;
use crate::types::TunnelProtocol;

const DEFAULT_TTL_SECONDS: u64 = 3600;
const MAX_TTL_FLOOR: u64 = 60;
const DEFAULT_MAX_TTL_SECONDS: u64 = 24 * 3600;
const DEFAULT_RATE_WINDOW_MS: u64 = 60_000;
const DEFAULT_RATE_MAX_REQUESTS: u32 = 600;

/// Built-in ignore patterns layered under any policy/CWD ignores: `.git/**`
/// and the exposure manager's own state directory.
const BUILTIN_IGNORES: &[&str] = &[".git/**", ".cfshare/**"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelPolicy {
    pub edge_ip_version: EdgeIpVersion,
    pub protocol: TunnelProtocol,
}

impl Default for TunnelPolicy {
    fn default() -> Self {
        Self {
            edge_ip_version: EdgeIpVersion::Auto,
            protocol: TunnelProtocol::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    pub window_ms: u64,
    pub max_requests: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: DEFAULT_RATE_WINDOW_MS,
            max_requests: DEFAULT_RATE_MAX_REQUESTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub default_ttl_seconds: u64,
    pub max_ttl_seconds: u64,
    pub default_expose_port_access: AccessMode,
    pub default_expose_files_access: AccessMode,
    pub blocked_ports: BTreeSet<u16>,
    pub allowed_path_roots: Vec<PathBuf>,
    pub tunnel: TunnelPolicy,
    pub rate_limit: RateLimitPolicy,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            max_ttl_seconds: DEFAULT_MAX_TTL_SECONDS,
            default_expose_port_access: AccessMode::Token,
            default_expose_files_access: AccessMode::Token,
            blocked_ports: [22, 25, 3389].into_iter().collect(),
            allowed_path_roots: Vec::new(),
            tunnel: TunnelPolicy::default(),
            rate_limit: RateLimitPolicy::default(),
        }
    }
}

impl Policy {
    /// Clamp `ttl_seconds` into `[60, max_ttl_seconds]`.
    pub fn clamp_ttl(&self, ttl_seconds: u64) -> u64 {
        ttl_seconds.clamp(MAX_TTL_FLOOR, self.max_ttl_seconds.max(MAX_TTL_FLOOR))
    }

    pub fn is_port_blocked(&self, port: u16) -> bool {
        self.blocked_ports.contains(&port)
    }

    pub fn is_path_allowed(&self, path: &Path) -> bool {
        if self.allowed_path_roots.is_empty() {
            return true;
        }
        self.allowed_path_roots
            .iter()
            .any(|root| crate::util::path::is_sub_path(path, root))
    }
}

pub struct LoadedPolicy {
    pub policy: Policy,
    pub warnings: Vec<String>,
    pub ignore_matcher: IgnoreMatcher,
}

/// Combines built-in patterns, the policy's own ignore file, and the
/// current working directory's `.gitignore`, applying `.gitignore`
/// semantics against three candidate forms of a path.
pub struct IgnoreMatcher {
    matcher: Gitignore,
}

impl IgnoreMatcher {
    pub fn build(cwd: &Path, policy_ignore_file: Option<&Path>) -> Self {
        let mut builder = GitignoreBuilder::new(cwd);
        for pattern in BUILTIN_IGNORES {
            let _ = builder.add_line(None, pattern);
        }
        if let Some(path) = policy_ignore_file {
            if let Ok(contents) = fs::read_to_string(path) {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let _ = builder.add_line(None, line);
                }
            }
        }
        let gitignore_path = cwd.join(".gitignore");
        if gitignore_path.is_file() {
            let _ = builder.add(gitignore_path);
        }
        let matcher = builder.build().unwrap_or_else(|_| Gitignore::empty());
        Self { matcher }
    }

    /// A path is blocked if any of {relative-to-CWD, relative-to-filesystem-
    /// root, basename} matches.
    pub fn is_ignored(&self, cwd: &Path, path: &Path) -> bool {
        let is_dir = path.is_dir();
        if let Ok(rel) = path.strip_prefix(cwd) {
            if self.matcher.matched(rel, is_dir).is_ignore() {
                return true;
            }
        }
        if self.matcher.matched(path, is_dir).is_ignore() {
            return true;
        }
        if let Some(name) = path.file_name() {
            if self.matcher.matched(name, is_dir).is_ignore() {
                return true;
            }
        }
        false
    }
}

/// Deep-merges `patch` onto `base`: nested objects (`tunnel`, `rate_limit`)
/// merge key-by-key, lists (`blocked_ports`, `allowed_path_roots`) replace
/// wholesale. Unknown keys are dropped with a warning rather than retained.
pub fn merge_policy(base: &Value, patch: &Value, warnings: &mut Vec<String>) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut merged = base_map.clone();
            for (key, patch_val) in patch_map {
                if !base_map.contains_key(key) {
                    warnings.push(format!("unknown policy key dropped: {key}"));
                    continue;
                }
                let existing = &base_map[key];
                let is_list_field = matches!(key.as_str(), "blocked_ports" | "allowed_path_roots");
                let merged_val = if is_list_field {
                    patch_val.clone()
                } else {
                    merge_policy(existing, patch_val, warnings)
                };
                merged.insert(key.clone(), merged_val);
            }
            Value::Object(merged)
        }
        (_, patch_val) => patch_val.clone(),
    }
}

/// Read the raw, unmerged policy patch JSON from disk.
pub fn read_raw(policy_path: &Path) -> Value {
    fs::read_to_string(policy_path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Object(serde_json::Map::new()))
}

/// Merge `patch` into the on-disk policy file and persist the result.
pub fn write_merged(policy_path: &Path, patch: &Value) -> std::io::Result<Value> {
    let mut warnings = Vec::new();
    let current = read_raw(policy_path);
    let merged = merge_policy(&current, patch, &mut warnings);
    if let Some(parent) = policy_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(policy_path, serde_json::to_vec_pretty(&merged)?)?;
    Ok(merged)
}

fn clamp_enum_or_default<T: Clone>(value: Option<T>, default: T) -> T {
    value.unwrap_or(default)
}

/// Parse a patch JSON value into a validated, clamped [`Policy`], falling
/// back to built-in defaults for invalid enum values and recording a
/// warning for each one.
pub fn apply_patch(defaults: &Policy, patch: &Value, warnings: &mut Vec<String>) -> Policy {
    let mut policy = defaults.clone();
    let Value::Object(map) = patch else {
        return policy;
    };

    if let Some(v) = map.get("default_ttl_seconds").and_then(Value::as_u64) {
        policy.default_ttl_seconds = v;
    }
    if let Some(v) = map.get("max_ttl_seconds").and_then(Value::as_u64) {
        policy.max_ttl_seconds = v;
    }
    if policy.max_ttl_seconds < policy.default_ttl_seconds {
        warnings.push("max_ttl_seconds < default_ttl_seconds; clamping".to_string());
        policy.max_ttl_seconds = policy.default_ttl_seconds;
    }
    policy.default_ttl_seconds = policy.clamp_ttl(policy.default_ttl_seconds);

    if let Some(v) = map.get("default_expose_port_access") {
        policy.default_expose_port_access =
            parse_access_mode(v, warnings, policy.default_expose_port_access);
    }
    if let Some(v) = map.get("default_expose_files_access") {
        policy.default_expose_files_access =
            parse_access_mode(v, warnings, policy.default_expose_files_access);
    }

    if let Some(Value::Array(ports)) = map.get("blocked_ports") {
        policy.blocked_ports = ports
            .iter()
            .filter_map(Value::as_u64)
            .filter_map(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .collect();
    }

    if let Some(Value::Array(roots)) = map.get("allowed_path_roots") {
        policy.allowed_path_roots = roots
            .iter()
            .filter_map(Value::as_str)
            .map(PathBuf::from)
            .collect();
    }

    if let Some(tunnel) = map.get("tunnel").and_then(Value::as_object) {
        if let Some(v) = tunnel.get("edge_ip_version") {
            policy.tunnel.edge_ip_version =
                parse_edge_ip_version(v, warnings, policy.tunnel.edge_ip_version);
        }
        if let Some(v) = tunnel.get("protocol") {
            policy.tunnel.protocol = parse_tunnel_protocol(v, warnings, policy.tunnel.protocol);
        }
    }

    if let Some(rl) = map.get("rate_limit").and_then(Value::as_object) {
        if let Some(v) = rl.get("enabled").and_then(Value::as_bool) {
            policy.rate_limit.enabled = v;
        }
        if let Some(v) = rl.get("window_ms").and_then(Value::as_u64) {
            policy.rate_limit.window_ms = v.clamp(1_000, 3_600_000);
        }
        if let Some(v) = rl.get("max_requests").and_then(Value::as_u64) {
            policy.rate_limit.max_requests = u32::try_from(v.clamp(1, 100_000)).unwrap_or(1);
        }
    }

    policy
}

fn parse_access_mode(v: &Value, warnings: &mut Vec<String>, default: AccessMode) -> AccessMode {
    match v.as_str() {
        Some("token") => AccessMode::Token,
        Some("basic") => AccessMode::Basic,
        Some("none") => AccessMode::None,
        _ => {
            warnings.push(format!("invalid access mode {v:?}; using default"));
            clamp_enum_or_default(None, default)
        }
    }
}

fn parse_edge_ip_version(
    v: &Value,
    warnings: &mut Vec<String>,
    default: EdgeIpVersion,
) -> EdgeIpVersion {
    match v.as_str() {
        Some("4") => EdgeIpVersion::V4,
        Some("6") => EdgeIpVersion::V6,
        Some("auto") => EdgeIpVersion::Auto,
        _ => {
            warnings.push(format!("invalid tunnel.edgeIpVersion {v:?}; using default"));
            clamp_enum_or_default(None, default)
        }
    }
}

fn parse_tunnel_protocol(
    v: &Value,
    warnings: &mut Vec<String>,
    default: TunnelProtocol,
) -> TunnelProtocol {
    match v.as_str() {
        Some("http2") => TunnelProtocol::Http2,
        Some("quic") => TunnelProtocol::Quic,
        Some("auto") => TunnelProtocol::Auto,
        _ => {
            warnings.push(format!("invalid tunnel.protocol {v:?}; using default"));
            clamp_enum_or_default(None, default)
        }
    }
}

/// Load the effective policy: on-disk JSON patch, merged onto built-in
/// defaults.
pub fn load(policy_path: &Path, ignore_file: Option<&Path>, cwd: &Path) -> LoadedPolicy {
    let raw = read_raw(policy_path);
    let mut warnings = Vec::new();
    let policy = apply_patch(&Policy::default(), &raw, &mut warnings);
    let ignore_matcher = IgnoreMatcher::build(cwd, ignore_file);
    LoadedPolicy {
        policy,
        warnings,
        ignore_matcher,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn clamp_ttl_below_floor() {
        let policy = Policy::default();
        assert_eq!(policy.clamp_ttl(10), 60);
    }

    #[test]
    fn clamp_ttl_above_ceiling() {
        let policy = Policy::default();
        assert_eq!(policy.clamp_ttl(999_999), policy.max_ttl_seconds);
    }

    #[test]
    fn merge_is_deep_for_nested_replace_for_lists() {
        let base = serde_json::json!({
            "default_ttl_seconds": 3600,
            "blocked_ports": [22],
            "tunnel": {"edge_ip_version": "auto", "protocol": "auto"},
        });
        let patch = serde_json::json!({
            "blocked_ports": [80, 443],
            "tunnel": {"protocol": "quic"},
        });
        let mut warnings = Vec::new();
        let merged = merge_policy(&base, &patch, &mut warnings);
        assert_eq!(merged["blocked_ports"], serde_json::json!([80, 443]));
        assert_eq!(merged["tunnel"]["edge_ip_version"], "auto");
        assert_eq!(merged["tunnel"]["protocol"], "quic");
    }

    #[test]
    fn unknown_key_dropped_with_warning() {
        let base = serde_json::json!({"default_ttl_seconds": 3600});
        let patch = serde_json::json!({"nonsense": true});
        let mut warnings = Vec::new();
        let merged = merge_policy(&base, &patch, &mut warnings);
        assert!(merged.get("nonsense").is_none());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn invalid_enum_falls_back_with_warning() {
        let mut warnings = Vec::new();
        let patch = serde_json::json!({"default_expose_port_access": "bogus"});
        let policy = apply_patch(&Policy::default(), &patch, &mut warnings);
        assert_eq!(policy.default_expose_port_access, AccessMode::Token);
        assert_eq!(warnings.len(), 1);
    }
}
