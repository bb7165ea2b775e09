//! Linux capability sets.

/// Every capability known to the kernel versions we support, in numeric order.
pub const ALL_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

/// Capabilities the node never hands to a supervised process.
pub const DEFAULT_DROPPED_CAPABILITIES: &[&str] = &["CAP_SYS_BOOT", "CAP_SYS_MODULE"];

/// Returns every capability except the ones in `dropped`.
///
/// Names in `dropped` are matched case-insensitively and may omit the `CAP_`
/// prefix.
pub fn all_grantable_capabilities<S: AsRef<str>>(dropped: &[S]) -> Vec<String> {
    let dropped: Vec<String> = dropped.iter().map(|d| normalize(d.as_ref())).collect();
    ALL_CAPABILITIES
        .iter()
        .filter(|cap| !dropped.iter().any(|d| d == *cap))
        .map(|cap| cap.to_string())
        .collect()
}

/// Normalizes a capability name to the `CAP_UPPERCASE` form.
pub fn normalize(name: &str) -> String {
    let upper = name.trim().to_uppercase();
    if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{}", upper)
    }
}
