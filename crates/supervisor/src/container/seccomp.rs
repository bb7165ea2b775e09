//! Seccomp syscall filters.
use serde::{Deserialize, Serialize};

/// The action a seccomp rule takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Allow the syscall.
    #[serde(rename = "SCMP_ACT_ALLOW")]
    Allow,
    /// Fail the syscall with an errno.
    #[serde(rename = "SCMP_ACT_ERRNO")]
    Errno,
    /// Kill the calling thread.
    #[serde(rename = "SCMP_ACT_KILL")]
    Kill,
}

/// A syscall argument comparison.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Arg {
    /// Argument index.
    pub index: u32,
    /// Value compared against.
    pub value: u64,
    /// Second value, for masked comparisons.
    #[serde(default)]
    pub value_two: u64,
    /// Comparison operator, e.g. `SCMP_CMP_EQ`.
    pub op: String,
}

/// A rule for a group of syscalls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Syscall {
    /// Syscall names the rule applies to.
    pub names: Vec<String>,
    /// What happens when the rule matches.
    pub action: Action,
    /// Optional argument filters.
    #[serde(default)]
    pub args: Vec<Arg>,
}

/// A seccomp filter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seccomp {
    /// Action for syscalls not matched by any rule.
    pub default_action: Action,
    /// Architectures the filter applies to.
    pub architectures: Vec<String>,
    /// Rules.
    pub syscalls: Vec<Syscall>,
}

impl Seccomp {
    /// Appends a rule allowing `names`.
    pub fn allow<S: AsRef<str>>(&mut self, names: &[S]) {
        self.syscalls.push(Syscall {
            names: names.iter().map(|n| n.as_ref().to_string()).collect(),
            action: Action::Allow,
            args: Vec::new(),
        });
    }

    /// Returns true if a rule allows `name` without argument filters.
    pub fn allows(&self, name: &str) -> bool {
        self.syscalls.iter().any(|s| {
            s.action == Action::Allow && s.args.is_empty() && s.names.iter().any(|n| n == name)
        })
    }
}

/// A hook a service uses to extend the default filter.
pub type SeccompHook = fn(&mut Seccomp);

// Mirrors the container runtime's default allow-list for the syscalls a
// node agent uses.
const DEFAULT_ALLOWED: &[&str] = &[
    "accept", "accept4", "access", "adjtimex", "alarm", "bind", "brk", "capget", "capset",
    "chdir", "chmod", "chown", "chroot", "clock_adjtime", "clock_getres", "clock_gettime",
    "clock_nanosleep", "clone", "clone3", "close", "close_range", "connect", "copy_file_range",
    "creat", "dup", "dup2", "dup3", "epoll_create", "epoll_create1", "epoll_ctl", "epoll_pwait",
    "epoll_wait", "eventfd", "eventfd2", "execve", "execveat", "exit", "exit_group", "faccessat",
    "faccessat2", "fadvise64", "fallocate", "fanotify_mark", "fchdir", "fchmod", "fchmodat",
    "fchown", "fchownat", "fcntl", "fdatasync", "fgetxattr", "flistxattr", "flock", "fork",
    "fremovexattr", "fsetxattr", "fstat", "fstatfs", "fsync", "ftruncate", "futex", "getcwd",
    "getdents", "getdents64", "getegid", "geteuid", "getgid", "getgroups", "getitimer",
    "getpeername", "getpgid", "getpgrp", "getpid", "getppid", "getpriority", "getrandom",
    "getresgid", "getresuid", "getrlimit", "getrusage", "getsid", "getsockname", "getsockopt",
    "gettid", "gettimeofday", "getuid", "getxattr", "inotify_add_watch", "inotify_init",
    "inotify_init1", "inotify_rm_watch", "io_cancel", "io_destroy", "io_getevents", "io_setup",
    "io_submit", "ioctl", "kill", "lchown", "lgetxattr", "link", "linkat", "listen", "listxattr",
    "llistxattr", "lseek", "lstat", "madvise", "memfd_create", "mincore", "mkdir", "mkdirat",
    "mknod", "mknodat", "mlock", "mlockall", "mmap", "mount", "mprotect", "mremap", "msync",
    "munlock", "munmap", "nanosleep", "newfstatat", "open", "openat", "openat2", "pause",
    "pipe", "pipe2", "poll", "ppoll", "prctl", "pread64", "preadv", "prlimit64", "pselect6",
    "pwrite64", "pwritev", "read", "readahead", "readlink", "readlinkat", "readv", "recvfrom",
    "recvmmsg", "recvmsg", "rename", "renameat", "renameat2", "restart_syscall", "rmdir",
    "rt_sigaction", "rt_sigpending", "rt_sigprocmask", "rt_sigqueueinfo", "rt_sigreturn",
    "rt_sigsuspend", "rt_sigtimedwait", "rt_tgsigqueueinfo", "sched_getaffinity",
    "sched_getparam", "sched_getscheduler", "sched_setaffinity", "sched_yield", "select",
    "sendfile", "sendmmsg", "sendmsg", "sendto", "set_robust_list", "set_tid_address",
    "setgid", "setgroups", "setitimer", "setns", "setpgid", "setpriority", "setresgid",
    "setresuid", "setrlimit", "setsid", "setsockopt", "setuid", "setxattr", "shutdown",
    "sigaltstack", "signalfd", "signalfd4", "socket", "socketpair", "splice", "stat", "statfs",
    "statx", "symlink", "symlinkat", "sync", "sync_file_range", "syncfs", "sysinfo", "tee",
    "tgkill", "timer_create", "timer_delete", "timer_getoverrun", "timer_gettime",
    "timer_settime", "timerfd_create", "timerfd_gettime", "timerfd_settime", "tkill",
    "truncate", "umask", "umount2", "uname", "unlink", "unlinkat", "unshare", "utime",
    "utimensat", "utimes", "vfork", "wait4", "waitid", "write", "writev",
];

/// The default filter: the runtime allow-list, everything else fails with an errno.
pub fn default_profile() -> Seccomp {
    let mut seccomp = Seccomp {
        default_action: Action::Errno,
        architectures: vec![
            "SCMP_ARCH_X86_64".to_string(),
            "SCMP_ARCH_X86".to_string(),
            "SCMP_ARCH_X32".to_string(),
            "SCMP_ARCH_AARCH64".to_string(),
            "SCMP_ARCH_ARM".to_string(),
        ],
        syscalls: Vec::new(),
    };
    seccomp.allow(DEFAULT_ALLOWED);
    seccomp
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_profile_denies_unlisted_syscalls() {
        let profile = default_profile();
        assert_eq!(profile.default_action, Action::Errno);
        assert!(profile.allows("read"));
        assert!(!profile.allows("add_key"));
    }

    #[test]
    fn serializes_with_runtime_names() {
        let mut profile = default_profile();
        profile.allow(&["add_key"]);
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["defaultAction"], "SCMP_ACT_ERRNO");
        assert_eq!(json["syscalls"][1]["names"][0], "add_key");
        assert_eq!(json["syscalls"][1]["action"], "SCMP_ACT_ALLOW");
    }
}
