//! Container specifications.
//!
//! [`SpecBuilder`] turns a declarative description of a service (process
//! arguments, mounts, namespaces, capabilities, cgroup, seccomp filter) into an
//! OCI runtime [`ContainerSpec`], the `config.json` of a runtime bundle.
use std::collections::BTreeMap;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub mod capability;
pub mod seccomp;

pub use seccomp::{Seccomp, SeccompHook};

/// OCI runtime specification version the generated specs follow.
pub const OCI_VERSION: &str = "1.0.2";

const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

const DEFAULT_MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

const DEFAULT_READONLY_PATHS: &[&str] = &[
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Errors produced while building a spec.
#[derive(Debug, Error)]
pub enum ContainerSpecError {
    /// The host side directory of an extra mount could not be created.
    #[error("failed to create mount source {}: {source}", path.display())]
    MountSource {
        /// The directory that could not be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// A mount.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Path inside the container.
    pub destination: String,
    /// Filesystem type, e.g. `bind` or `sysfs`.
    #[serde(rename = "type")]
    pub mount_type: String,
    /// Path (or device) on the host.
    pub source: String,
    /// Mount options.
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    /// A mount of type `mount_type`.
    pub fn new(mount_type: &str, source: &str, destination: &str, options: &[&str]) -> Self {
        Mount {
            destination: destination.to_string(),
            mount_type: mount_type.to_string(),
            source: source.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
        }
    }

    /// A bind mount of `source` at `destination`.
    pub fn bind(source: &str, destination: &str, options: &[&str]) -> Self {
        Mount::new("bind", source, destination, options)
    }
}

/// Linux namespace types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// Process IDs.
    Pid,
    /// Network stack.
    Network,
    /// System V IPC.
    Ipc,
    /// Hostname and domain name.
    Uts,
    /// Mount table.
    Mount,
    /// Cgroup root.
    Cgroup,
}

const ALL_NAMESPACES: &[NamespaceType] = &[
    NamespaceType::Pid,
    NamespaceType::Network,
    NamespaceType::Ipc,
    NamespaceType::Uts,
    NamespaceType::Mount,
    NamespaceType::Cgroup,
];

/// A namespace the container gets its own copy of.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace type.
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    /// Path of an existing namespace to join.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Capability sets of the process.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Upper limit of capabilities the process can ever gain.
    pub bounding: Vec<String>,
    /// Capabilities checked by the kernel.
    pub effective: Vec<String>,
    /// Capabilities preserved across `execve`.
    pub inheritable: Vec<String>,
    /// Capabilities the process may enable.
    pub permitted: Vec<String>,
    /// Capabilities kept by unprivileged children.
    pub ambient: Vec<String>,
}

impl Capabilities {
    fn granting(caps: &[String]) -> Self {
        Capabilities {
            bounding: caps.to_vec(),
            effective: caps.to_vec(),
            inheritable: caps.to_vec(),
            permitted: caps.to_vec(),
            ambient: caps.to_vec(),
        }
    }
}

/// Process user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User ID.
    pub uid: u32,
    /// Group ID.
    pub gid: u32,
}

/// The process to run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Whether a terminal is attached.
    pub terminal: bool,
    /// User the process runs as.
    pub user: User,
    /// Command line, program first.
    pub args: Vec<String>,
    /// Environment as `KEY=value` entries.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub cwd: String,
    /// Capability sets.
    pub capabilities: Capabilities,
    /// Sets `PR_SET_NO_NEW_PRIVS`.
    pub no_new_privileges: bool,
    /// OOM killer score adjustment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oom_score_adj: Option<i32>,
    /// AppArmor profile. Unset means unconfined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apparmor_profile: Option<String>,
    /// SELinux label. Unset disables labeling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selinux_label: Option<String>,
}

/// Root filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    /// Path of the root filesystem on the host.
    pub path: String,
    /// Whether the root filesystem is mounted read-only.
    pub readonly: bool,
}

/// A device cgroup rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRule {
    /// Allow or deny the access.
    pub allow: bool,
    /// Access bits out of `rwm`.
    pub access: String,
}

/// Cgroup resources.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Device rules, applied in order.
    pub devices: Vec<DeviceRule>,
}

/// Linux specific configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    /// Namespaces the container gets its own copy of.
    pub namespaces: Vec<Namespace>,
    /// Cgroup the container is placed in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<String>,
    /// Cgroup resource configuration.
    pub resources: Resources,
    /// Syscall filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seccomp: Option<Seccomp>,
    /// Paths hidden from the container.
    pub masked_paths: Vec<String>,
    /// Paths made read-only inside the container.
    pub readonly_paths: Vec<String>,
    /// Propagation of the root filesystem mount.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs_propagation: Option<String>,
}

/// An OCI runtime spec.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// Runtime spec version.
    pub oci_version: String,
    /// The container process.
    pub process: Process,
    /// Root filesystem.
    pub root: Root,
    /// Mounts in mount order.
    pub mounts: Vec<Mount>,
    /// Linux specific configuration.
    pub linux: Linux,
}

impl ContainerSpec {
    /// Returns true if the container gets its own namespace of `ns_type`.
    pub fn isolates(&self, ns_type: NamespaceType) -> bool {
        self.linux.namespaces.iter().any(|ns| ns.ns_type == ns_type)
    }

    /// Finds the mount at `destination`.
    pub fn mount(&self, destination: &str) -> Option<&Mount> {
        self.mounts.iter().find(|m| m.destination == destination)
    }
}

/// Builds a [`ContainerSpec`].
///
/// Starts from runtime defaults (all namespaces isolated, default mounts,
/// capabilities, masked and readonly paths); every `with_*` call moves one
/// aspect away from the default.
pub struct SpecBuilder {
    args: Vec<String>,
    env: BTreeMap<String, String>,
    root: String,
    mounts: Vec<Mount>,
    extra_mounts: Vec<Mount>,
    host_namespaces: Vec<NamespaceType>,
    cgroup: Option<String>,
    capabilities: Vec<String>,
    seccomp_hooks: Vec<SeccompHook>,
    oom_score_adj: Option<i32>,
    masked_paths: Vec<String>,
    readonly_paths: Vec<String>,
    writable_sysfs: bool,
    writable_cgroupfs: bool,
    all_devices_allowed: bool,
    rootfs_propagation: Option<String>,
    selinux_label: Option<String>,
    apparmor_profile: Option<String>,
}

impl SpecBuilder {
    /// Starts a spec that runs `args` (executable first).
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SpecBuilder {
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            root: "rootfs".to_string(),
            mounts: Vec::new(),
            extra_mounts: Vec::new(),
            host_namespaces: Vec::new(),
            cgroup: None,
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            seccomp_hooks: Vec::new(),
            oom_score_adj: None,
            masked_paths: DEFAULT_MASKED_PATHS.iter().map(|p| p.to_string()).collect(),
            readonly_paths: DEFAULT_READONLY_PATHS.iter().map(|p| p.to_string()).collect(),
            writable_sysfs: false,
            writable_cgroupfs: false,
            all_devices_allowed: false,
            rootfs_propagation: None,
            selinux_label: None,
            apparmor_profile: None,
        }
    }

    /// Sets the root filesystem path (relative to the bundle or absolute).
    pub fn with_root<S: Into<String>>(mut self, root: S) -> Self {
        self.root = root.into();
        self
    }

    /// Adds environment variables.
    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(env.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Adds mounts. A mount replaces a default mount at the same destination.
    pub fn with_mounts<I: IntoIterator<Item = Mount>>(mut self, mounts: I) -> Self {
        self.mounts.extend(mounts);
        self
    }

    /// Adds operator declared mounts. Their host side directories are created
    /// by [`SpecBuilder::build`] if missing.
    pub fn with_extra_mounts<I: IntoIterator<Item = Mount>>(mut self, mounts: I) -> Self {
        self.extra_mounts.extend(mounts);
        self
    }

    /// Shares a namespace with the host instead of isolating it.
    pub fn with_host_namespace(mut self, ns_type: NamespaceType) -> Self {
        if !self.host_namespaces.contains(&ns_type) {
            self.host_namespaces.push(ns_type);
        }
        self
    }

    /// Places the process in the given cgroup.
    pub fn with_cgroup<S: Into<String>>(mut self, cgroup: S) -> Self {
        self.cgroup = Some(cgroup.into());
        self
    }

    /// Replaces the capability set.
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Installs the default seccomp filter, extended by `hook`.
    pub fn with_seccomp(mut self, hook: SeccompHook) -> Self {
        self.seccomp_hooks.push(hook);
        self
    }

    /// Sets the OOM score adjustment.
    pub fn with_oom_score_adj(mut self, adj: i32) -> Self {
        self.oom_score_adj = Some(adj);
        self
    }

    /// Replaces the masked path list.
    pub fn with_masked_paths(mut self, paths: Vec<String>) -> Self {
        self.masked_paths = paths;
        self
    }

    /// Replaces the readonly path list.
    pub fn with_readonly_paths(mut self, paths: Vec<String>) -> Self {
        self.readonly_paths = paths;
        self
    }

    /// Mounts every sysfs mount read-write.
    pub fn with_writable_sysfs(mut self) -> Self {
        self.writable_sysfs = true;
        self
    }

    /// Mounts every cgroup filesystem mount read-write.
    pub fn with_writable_cgroupfs(mut self) -> Self {
        self.writable_cgroupfs = true;
        self
    }

    /// Allows access to every device.
    pub fn with_all_devices_allowed(mut self) -> Self {
        self.all_devices_allowed = true;
        self
    }

    /// Sets the root filesystem mount propagation.
    pub fn with_rootfs_propagation<S: Into<String>>(mut self, propagation: S) -> Self {
        self.rootfs_propagation = Some(propagation.into());
        self
    }

    /// Sets the SELinux label. An empty label disables labeling.
    pub fn with_selinux_label<S: Into<String>>(mut self, label: S) -> Self {
        self.selinux_label = Some(label.into());
        self
    }

    /// Sets the AppArmor profile. An empty profile means unconfined.
    pub fn with_apparmor_profile<S: Into<String>>(mut self, profile: S) -> Self {
        self.apparmor_profile = Some(profile.into());
        self
    }

    /// Produces the spec.
    ///
    /// Creates the host side directory of every extra mount (mode 0700) and
    /// fails on the first one that can not be created.
    pub fn build(self) -> Result<ContainerSpec, ContainerSpecError> {
        for mount in self.extra_mounts.iter() {
            let path = PathBuf::from(&mount.source);
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&path)
                .map_err(|source| ContainerSpecError::MountSource {
                    path: path.clone(),
                    source,
                })?;
            debug!(path = %path.display(), "Ensured extra mount source exists");
        }

        let mut mounts = default_mounts();
        for mount in self.mounts.into_iter().chain(self.extra_mounts.into_iter()) {
            match mounts.iter_mut().find(|m| m.destination == mount.destination) {
                Some(existing) => *existing = mount,
                None => mounts.push(mount),
            }
        }
        // Applies to service mounts as well as the defaults.
        for mount in mounts.iter_mut() {
            let writable = (mount.mount_type == "sysfs" && self.writable_sysfs)
                || (mount.mount_type == "cgroup" && self.writable_cgroupfs);
            if writable {
                mount.options.retain(|o| o != "ro");
            }
        }

        let mut env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        if !self.env.contains_key("PATH") {
            env.push(DEFAULT_PATH.to_string());
        }

        let namespaces = ALL_NAMESPACES
            .iter()
            .filter(|ns| !self.host_namespaces.contains(ns))
            .map(|ns| Namespace {
                ns_type: *ns,
                path: None,
            })
            .collect();

        let seccomp = if self.seccomp_hooks.is_empty() {
            None
        } else {
            let mut profile = seccomp::default_profile();
            for hook in self.seccomp_hooks.iter() {
                hook(&mut profile);
            }
            Some(profile)
        };

        let devices = if self.all_devices_allowed {
            vec![DeviceRule {
                allow: true,
                access: "rwm".to_string(),
            }]
        } else {
            vec![DeviceRule {
                allow: false,
                access: "rwm".to_string(),
            }]
        };

        Ok(ContainerSpec {
            oci_version: OCI_VERSION.to_string(),
            process: Process {
                terminal: false,
                user: User::default(),
                args: self.args,
                env,
                cwd: "/".to_string(),
                capabilities: Capabilities::granting(&self.capabilities),
                no_new_privileges: false,
                oom_score_adj: self.oom_score_adj,
                apparmor_profile: self.apparmor_profile.filter(|p| !p.is_empty()),
                selinux_label: self.selinux_label.filter(|l| !l.is_empty()),
            },
            root: Root {
                path: self.root,
                readonly: false,
            },
            mounts,
            linux: Linux {
                namespaces,
                cgroups_path: self.cgroup,
                resources: Resources { devices },
                seccomp,
                masked_paths: self.masked_paths,
                readonly_paths: self.readonly_paths,
                rootfs_propagation: self.rootfs_propagation,
            },
        })
    }
}

fn default_mounts() -> Vec<Mount> {
    vec![
        Mount::new("proc", "proc", "/proc", &["nosuid", "noexec", "nodev"]),
        Mount::new("tmpfs", "tmpfs", "/dev", &["nosuid", "strictatime", "mode=755", "size=65536k"]),
        Mount::new(
            "devpts",
            "devpts",
            "/dev/pts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        ),
        Mount::new("tmpfs", "shm", "/dev/shm", &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]),
        Mount::new("mqueue", "mqueue", "/dev/mqueue", &["nosuid", "noexec", "nodev"]),
        Mount::new("sysfs", "sysfs", "/sys", &["nosuid", "noexec", "nodev", "ro"]),
        Mount::new("cgroup", "cgroup", "/sys/fs/cgroup", &["nosuid", "noexec", "nodev", "relatime", "ro"]),
    ]
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn defaults_isolate_everything() {
        let spec = SpecBuilder::new(vec!["/bin/true"]).build().unwrap();
        for ns in ALL_NAMESPACES {
            assert!(spec.isolates(*ns));
        }
        assert!(spec.linux.seccomp.is_none());
        assert!(spec.process.env.contains(&DEFAULT_PATH.to_string()));
        assert_eq!(spec.process.capabilities.bounding.len(), DEFAULT_CAPABILITIES.len());
    }

    #[test]
    fn host_namespaces_are_not_isolated() {
        let spec = SpecBuilder::new(vec!["/bin/true"])
            .with_host_namespace(NamespaceType::Network)
            .with_host_namespace(NamespaceType::Pid)
            .build()
            .unwrap();
        assert!(!spec.isolates(NamespaceType::Network));
        assert!(!spec.isolates(NamespaceType::Pid));
        assert!(spec.isolates(NamespaceType::Mount));
    }

    #[test]
    fn service_mounts_replace_defaults_at_same_destination() {
        let spec = SpecBuilder::new(vec!["/bin/true"])
            .with_mounts(vec![
                Mount::bind("/dev", "/dev", &["rbind", "rshared", "rw"]),
                Mount::bind("/var/lib/kubelet", "/var/lib/kubelet", &["rbind", "rshared", "rw"]),
            ])
            .build()
            .unwrap();
        assert_eq!(spec.mount("/dev").unwrap().mount_type, "bind");
        assert_eq!(spec.mounts.iter().filter(|m| m.destination == "/dev").count(), 1);
        assert!(spec.mount("/var/lib/kubelet").is_some());
    }

    #[test]
    fn writable_sysfs_drops_ro() {
        let spec = SpecBuilder::new(vec!["/bin/true"])
            .with_writable_sysfs()
            .with_writable_cgroupfs()
            .build()
            .unwrap();
        assert!(!spec.mount("/sys").unwrap().options.contains(&"ro".to_string()));
        assert!(!spec
            .mount("/sys/fs/cgroup")
            .unwrap()
            .options
            .contains(&"ro".to_string()));
    }

    #[test]
    fn writable_sysfs_applies_to_service_mounts() {
        let spec = SpecBuilder::new(vec!["/bin/true"])
            .with_mounts(vec![
                Mount::new("sysfs", "/sys", "/sys", &["bind", "ro"]),
                Mount::new("cgroup", "cgroup", "/sys/fs/cgroup", &["nosuid", "ro"]),
            ])
            .with_writable_sysfs()
            .with_writable_cgroupfs()
            .build()
            .unwrap();
        assert_eq!(spec.mount("/sys").unwrap().options, vec!["bind".to_string()]);
        assert_eq!(
            spec.mount("/sys/fs/cgroup").unwrap().options,
            vec!["nosuid".to_string()]
        );
    }

    #[test]
    fn service_mounts_stay_readonly_without_writable_flags() {
        let spec = SpecBuilder::new(vec!["/bin/true"])
            .with_mounts(vec![Mount::new("sysfs", "/sys", "/sys", &["bind", "ro"])])
            .build()
            .unwrap();
        assert!(spec.mount("/sys").unwrap().options.contains(&"ro".to_string()));
    }

    #[test]
    fn seccomp_hook_extends_default_profile() {
        fn keyring(seccomp: &mut Seccomp) {
            seccomp.allow(&["add_key", "request_key"]);
        }
        let spec = SpecBuilder::new(vec!["/bin/true"])
            .with_seccomp(keyring)
            .build()
            .unwrap();
        let seccomp = spec.linux.seccomp.unwrap();
        assert!(seccomp.allows("add_key"));
        assert!(seccomp.allows("request_key"));
        assert!(seccomp.allows("read"));
    }

    #[test]
    fn extra_mount_sources_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("data/volume");
        let spec = SpecBuilder::new(vec!["/bin/true"])
            .with_extra_mounts(vec![Mount::bind(
                source.to_str().unwrap(),
                "/var/mnt",
                &["rbind", "rw"],
            )])
            .build()
            .unwrap();
        assert!(source.is_dir());
        let mode = std::fs::metadata(&source).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(spec.mount("/var/mnt").is_some());
    }

    #[test]
    fn uncreatable_mount_source_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"not a directory").unwrap();
        let source = file.join("child");
        let err = SpecBuilder::new(vec!["/bin/true"])
            .with_extra_mounts(vec![Mount::bind(source.to_str().unwrap(), "/mnt", &["bind"])])
            .build()
            .unwrap_err();
        assert!(matches!(err, ContainerSpecError::MountSource { path, .. } if path == source));
    }

    #[test]
    fn build_is_deterministic() {
        let build = || {
            SpecBuilder::new(vec!["/usr/local/bin/kubelet", "--v=2"])
                .with_env(vec![("B", "2"), ("A", "1")])
                .with_cgroup("/kubelet")
                .with_oom_score_adj(-450)
                .build()
                .unwrap()
        };
        let first = build();
        assert_eq!(first, build());
        assert_eq!(first.process.env[0], "A=1");
        assert_eq!(
            serde_json::to_value(&first).unwrap()["process"]["oomScoreAdj"],
            -450
        );
    }
}
