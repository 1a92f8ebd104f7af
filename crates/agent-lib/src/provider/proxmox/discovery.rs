//! Guest scope discovery across cgroup layout variants.
//!
//! Proxmox places guest control groups differently depending on the cgroup
//! version and tooling generation: the canonical `machine.slice` systemd
//! scopes, bare `lxc/` and `qemu.slice/` trees, or (v1) per-controller
//! hierarchies under `cpuacct/`. Discovery tries the canonical layout first
//! and falls back through the known variants; only a completely unreadable
//! hierarchy is an error, an empty guest list is not.

use anyhow::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;

/// systemd escapes `-` in unit names as `\x2d`.
const ESCAPED_DASH: &str = "\\x2d";
const LXC_SCOPE_PREFIX: &str = "machine-lxc";
const QEMU_SCOPE_PREFIX: &str = "machine-qemu";

/// Filesystem roots read by the introspector. Injectable so tests can stand
/// up a mock hierarchy in a temp directory.
#[derive(Debug, Clone)]
pub struct IntrospectionRoots {
    /// Control-group hierarchy root.
    pub cgroup: PathBuf,
    /// Proc filesystem root.
    pub proc: PathBuf,
    /// Directory holding per-guest configuration (`lxc/`, `qemu-server/`).
    pub guest_config: PathBuf,
}

impl Default for IntrospectionRoots {
    fn default() -> Self {
        Self {
            cgroup: PathBuf::from("/sys/fs/cgroup"),
            proc: PathBuf::from("/proc"),
            guest_config: PathBuf::from("/etc/pve"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestKind {
    Lxc,
    Qemu,
}

impl GuestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GuestKind::Lxc => "lxc",
            GuestKind::Qemu => "qemu",
        }
    }

    fn config_dir(self) -> &'static str {
        match self {
            GuestKind::Lxc => "lxc",
            GuestKind::Qemu => "qemu-server",
        }
    }

    fn from_scope_name(name: &str) -> Option<Self> {
        if name.contains("lxc") {
            Some(GuestKind::Lxc)
        } else if name.contains("qemu") {
            Some(GuestKind::Qemu)
        } else {
            None
        }
    }
}

/// A discovered guest and its cgroup location. Rebuilt on every poll; never
/// persisted.
#[derive(Debug, Clone)]
pub struct GuestScope {
    /// Numeric id decoded from the scope name, or the raw name when no
    /// numeric token exists.
    pub id: String,
    /// Display name from the guest's configuration file; may be empty.
    pub name: String,
    /// OS/type tag from the guest's configuration file; may be empty.
    pub ostype: String,
    pub kind: Option<GuestKind>,
    /// Absolute cgroup directory for this guest (v2 unified path).
    pub path: PathBuf,
    /// Slice-relative subpath for v1, where accounting is split across
    /// per-controller hierarchies.
    pub rel_path: Option<PathBuf>,
}

/// Detect the cgroup version by the presence of the v2 marker file.
pub(crate) async fn is_cgroup_v2(roots: &IntrospectionRoots) -> bool {
    fs::metadata(roots.cgroup.join("cgroup.controllers")).await.is_ok()
}

/// Discover all guest scopes. Returns the scopes and whether the hierarchy
/// is cgroup v2.
pub(crate) async fn find_guest_scopes(
    roots: &IntrospectionRoots,
) -> Result<(Vec<GuestScope>, bool)> {
    if is_cgroup_v2(roots).await {
        Ok((find_scopes_v2(roots).await?, true))
    } else {
        Ok((find_scopes_v1(roots).await?, false))
    }
}

async fn find_scopes_v2(roots: &IntrospectionRoots) -> Result<Vec<GuestScope>> {
    let base = roots.cgroup.join("machine.slice");
    if let Some(scopes) = parse_machine_scopes(&base, Path::new("machine.slice"), roots).await {
        return Ok(scopes);
    }
    if let Ok(scopes) = scan_known_dirs_v2(roots).await {
        return Ok(scopes);
    }
    scan_unified_v2(roots).await
}

async fn find_scopes_v1(roots: &IntrospectionRoots) -> Result<Vec<GuestScope>> {
    let base = roots.cgroup.join("cpuacct").join("machine.slice");
    if let Some(scopes) = parse_machine_scopes(&base, Path::new("machine.slice"), roots).await {
        return Ok(scopes);
    }
    scan_legacy_v1(roots).await
}

/// Canonical fast path: classify `machine.slice` children by scope prefix.
/// Returns `None` when the directory itself is unreadable.
async fn parse_machine_scopes(
    base: &Path,
    rel_base: &Path,
    roots: &IntrospectionRoots,
) -> Option<Vec<GuestScope>> {
    let mut entries = fs::read_dir(base).await.ok()?;
    let mut scopes = Vec::new();

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !is_dir(&path).await {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();

        let (kind, prefix) = if name.starts_with(LXC_SCOPE_PREFIX) {
            (GuestKind::Lxc, format!("{LXC_SCOPE_PREFIX}{ESCAPED_DASH}"))
        } else if name.starts_with(QEMU_SCOPE_PREFIX) {
            (GuestKind::Qemu, format!("{QEMU_SCOPE_PREFIX}{ESCAPED_DASH}"))
        } else {
            continue;
        };

        let id = decode_scope_id(&name, &prefix);
        let (guest_name, ostype) = read_guest_config(roots, kind, &id).await;
        scopes.push(GuestScope {
            id,
            name: guest_name,
            ostype,
            kind: Some(kind),
            path,
            rel_path: Some(rel_base.join(&name)),
        });
    }

    Some(scopes)
}

/// Alternate v2 locations: bare `lxc/` and `qemu.slice/` trees.
async fn scan_known_dirs_v2(roots: &IntrospectionRoots) -> Result<Vec<GuestScope>> {
    let mut scopes = Vec::new();

    for (base, kind) in [
        (roots.cgroup.join("lxc"), GuestKind::Lxc),
        (roots.cgroup.join("qemu.slice"), GuestKind::Qemu),
    ] {
        let mut entries = match fs::read_dir(&base).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !is_dir(&path).await {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let id = scope_id_from_name(&name);
            let (guest_name, ostype) = read_guest_config(roots, kind, &id).await;
            scopes.push(GuestScope {
                id,
                name: guest_name,
                ostype,
                kind: Some(kind),
                path,
                rel_path: None,
            });
        }
    }

    if scopes.is_empty() {
        anyhow::bail!("no guest cgroup scopes found");
    }
    Ok(scopes)
}

/// Last resort for v2: scan the known parent groups plus the root, keeping
/// child directories whose name carries a guest-kind substring.
async fn scan_unified_v2(roots: &IntrospectionRoots) -> Result<Vec<GuestScope>> {
    let candidates = [
        roots.cgroup.join("machine.slice"),
        roots.cgroup.join("system.slice"),
        roots.cgroup.join("pve.slice"),
        roots.cgroup.clone(),
    ];

    let mut scopes = Vec::new();
    let mut seen = HashSet::new();
    for base in candidates {
        if !is_dir(&base).await {
            continue;
        }
        let mut entries = match fs::read_dir(&base).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !is_dir(&path).await {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let kind = match GuestKind::from_scope_name(&name) {
                Some(kind) => kind,
                None => continue,
            };
            if !seen.insert(path.clone()) {
                continue;
            }
            let id = scope_id_from_name(&name);
            let (guest_name, ostype) = read_guest_config(roots, kind, &id).await;
            scopes.push(GuestScope {
                id,
                name: guest_name,
                ostype,
                kind: Some(kind),
                path,
                rel_path: None,
            });
        }
    }

    if scopes.is_empty() {
        anyhow::bail!("no guest cgroup scopes found");
    }
    Ok(scopes)
}

/// Legacy v1 layout: per-kind trees under the cpuacct controller.
async fn scan_legacy_v1(roots: &IntrospectionRoots) -> Result<Vec<GuestScope>> {
    let mut scopes = Vec::new();

    for (dir, kind) in [("lxc", GuestKind::Lxc), ("qemu", GuestKind::Qemu)] {
        let base = roots.cgroup.join("cpuacct").join(dir);
        let mut entries = match fs::read_dir(&base).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !is_dir(&path).await {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let id = scope_id_from_name(&name);
            let (guest_name, ostype) = read_guest_config(roots, kind, &id).await;
            scopes.push(GuestScope {
                id,
                name: guest_name,
                ostype,
                kind: Some(kind),
                path,
                rel_path: Some(Path::new(dir).join(&name)),
            });
        }
    }

    if scopes.is_empty() {
        anyhow::bail!("no guest cgroup scopes found");
    }
    Ok(scopes)
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.map(|meta| meta.is_dir()).unwrap_or(false)
}

/// Strip a known scope prefix and `.scope` suffix, decoding escaped dashes.
pub(crate) fn decode_scope_id(name: &str, prefix: &str) -> String {
    let id = name.strip_prefix(prefix).unwrap_or(name);
    let id = id.strip_suffix(".scope").unwrap_or(id);
    id.replace(ESCAPED_DASH, "-")
}

/// Best-effort numeric id extraction for scope names that match no known
/// prefix: the first purely numeric token after splitting on common
/// separators, or the raw (suffix-trimmed) name when none exists.
pub(crate) fn scope_id_from_name(name: &str) -> String {
    if name.starts_with(LXC_SCOPE_PREFIX) {
        return decode_scope_id(name, &format!("{LXC_SCOPE_PREFIX}{ESCAPED_DASH}"));
    }
    if name.starts_with(QEMU_SCOPE_PREFIX) {
        return decode_scope_id(name, &format!("{QEMU_SCOPE_PREFIX}{ESCAPED_DASH}"));
    }

    let trimmed = name.strip_suffix(".scope").unwrap_or(name);
    let trimmed = trimmed.strip_suffix(".service").unwrap_or(trimmed);
    trimmed
        .split(['@', '-', '_'])
        .find(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .unwrap_or_else(|| trimmed.to_string())
}

/// Read the guest's configuration file for a display name and type tag.
/// Returns empty strings when the file is absent or carries neither key.
async fn read_guest_config(
    roots: &IntrospectionRoots,
    kind: GuestKind,
    id: &str,
) -> (String, String) {
    let path = roots
        .guest_config
        .join(kind.config_dir())
        .join(format!("{id}.conf"));
    let content = match fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(_) => return (String::new(), String::new()),
    };
    parse_guest_config(&content)
}

/// First `hostname`/`name` and `ostype` values win; comments are skipped.
pub(crate) fn parse_guest_config(content: &str) -> (String, String) {
    let mut name = String::new();
    let mut ostype = String::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "hostname" | "name" if name.is_empty() => name = value.to_string(),
            "ostype" if ostype.is_empty() => ostype = value.to_string(),
            _ => {}
        }
    }
    (name, ostype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_strips_prefix_suffix_and_escapes() {
        assert_eq!(
            decode_scope_id("machine-lxc\\x2d101.scope", "machine-lxc\\x2d"),
            "101"
        );
        assert_eq!(
            decode_scope_id("machine-qemu\\x2d100\\x2dvm.scope", "machine-qemu\\x2d"),
            "100-vm"
        );
    }

    #[test]
    fn scope_id_falls_back_to_numeric_token() {
        assert_eq!(scope_id_from_name("machine-lxc\\x2d101.scope"), "101");
        assert_eq!(scope_id_from_name("qemu-105.scope"), "105");
        assert_eq!(scope_id_from_name("lxc_204"), "204");
        assert_eq!(scope_id_from_name("vm@113.service"), "113");
    }

    #[test]
    fn scope_id_without_numeric_token_is_raw_name() {
        assert_eq!(scope_id_from_name("lxcmonitor.scope"), "lxcmonitor");
    }

    #[test]
    fn guest_config_takes_first_matching_keys() {
        let content = "\
# guest config
hostname: web-frontend
ostype: debian
hostname: shadowed
memory: 2048
";
        let (name, ostype) = parse_guest_config(content);
        assert_eq!(name, "web-frontend");
        assert_eq!(ostype, "debian");
    }

    #[test]
    fn guest_config_tolerates_missing_keys() {
        let (name, ostype) = parse_guest_config("memory: 512\n");
        assert!(name.is_empty());
        assert!(ostype.is_empty());
    }
}
