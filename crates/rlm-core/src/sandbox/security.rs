//! Isolation settings forwarded, uninterpreted, from the pool to the runtime.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Restrictions applied to every sandbox runtime the pool constructs.
///
/// The pool never inspects these values; only the executor factory turns
/// them into runtime flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Linux capabilities to drop (`ALL` drops everything).
    pub cap_drop: Vec<String>,
    /// Run the runtime privileged.
    pub privileged: bool,
    /// Disable all networking.
    pub network_disabled: bool,
    /// Mount the root filesystem read-only.
    pub read_only_root: bool,
    /// Extra security options (e.g. `no-new-privileges`).
    pub security_opt: Vec<String>,
    /// tmpfs mounts: path -> mount options.
    pub tmpfs: BTreeMap<String, String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        let mut tmpfs = BTreeMap::new();
        tmpfs.insert(
            "/tmp".to_string(),
            "rw,size=64m,noexec,nosuid,nodev".to_string(),
        );
        Self {
            cap_drop: vec!["ALL".to_string()],
            privileged: false,
            network_disabled: true,
            read_only_root: true,
            security_opt: vec!["no-new-privileges".to_string()],
            tmpfs,
        }
    }
}

impl SecurityConfig {
    /// Render as container CLI flags (`docker run` / `podman run` syntax).
    pub fn container_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.network_disabled {
            args.push("--network".to_string());
            args.push("none".to_string());
        }
        if self.read_only_root {
            args.push("--read-only".to_string());
        }
        if self.privileged {
            args.push("--privileged".to_string());
        }
        for cap in &self.cap_drop {
            args.push("--cap-drop".to_string());
            args.push(cap.clone());
        }
        for opt in &self.security_opt {
            args.push("--security-opt".to_string());
            args.push(opt.clone());
        }
        for (path, opts) in &self.tmpfs {
            args.push("--tmpfs".to_string());
            if opts.is_empty() {
                args.push(path.clone());
            } else {
                args.push(format!("{path}:{opts}"));
            }
        }
        args
    }
}
