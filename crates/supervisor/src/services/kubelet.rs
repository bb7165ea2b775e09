use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::args::{self, Args, MergePolicies, MergePolicy};
use crate::condition::{network_ready, node_name, nodename_ready, time_sync, Condition, NetworkReadiness};
use crate::config::{Constants, MachineConfig};
use crate::container::capability::all_grantable_capabilities;
use crate::container::{ContainerSpec, ContainerSpecError, Mount, NamespaceType, Seccomp, SpecBuilder};
use crate::files;
use crate::health::{self, Check, HttpCheck};
use crate::image::{ensure_image, Reference};
use crate::nodeip::{ip_subnets_from_service_cidrs, pick_node_ips, NodeIpError};
use crate::restart::Policy;
use crate::runner::{OciRunner, Runner};
use crate::service::{Machine, Service};

const ID: &str = "kubelet";

/// Flags the operator may never override.
const DENIED_FLAGS: &[&str] = &[
    "bootstrap-kubeconfig",
    "kubeconfig",
    "container-runtime",
    "container-runtime-endpoint",
    "config",
    "cert-dir",
    "cni-conf-dir",
];

/// The Kubernetes node agent.
///
/// Waits for time sync, network readiness and the node name, depends on the
/// `cri` service, and runs the kubelet image as a privileged container sharing
/// the host network and PID namespaces.
#[derive(Clone, Copy, Debug, Default)]
pub struct Kubelet;

#[async_trait::async_trait]
impl Service for Kubelet {
    fn id(&self) -> &str {
        ID
    }

    fn depends_on(&self) -> Vec<String> {
        vec!["cri".to_string()]
    }

    fn condition(&self, machine: &Machine) -> Option<Condition> {
        Some(Condition::all(vec![
            time_sync(machine.store.clone()),
            network_ready(
                machine.store.clone(),
                &[
                    NetworkReadiness::AddressReady,
                    NetworkReadiness::HostnameReady,
                    NetworkReadiness::EtcFilesReady,
                ],
            ),
            nodename_ready(machine.store.clone()),
        ]))
    }

    #[instrument(level = "info", skip(self, machine))]
    async fn pre_func(&self, machine: &Machine) -> anyhow::Result<()> {
        let constants = &machine.constants;
        let config = &machine.config;

        let kubeconfig = bootstrap_kubeconfig(config)?;
        files::write_atomic(&constants.kubelet_bootstrap_kubeconfig, kubeconfig.as_bytes(), 0o600)?;

        let ca = config.ca_cert()?;
        if let Some(dir) = constants.kubernetes_ca_cert.parent() {
            files::ensure_dir(dir, 0o700)?;
        }
        files::write_atomic(&constants.kubernetes_ca_cert, &ca, 0o400)?;

        let kubelet_config = serde_yaml::to_string(&KubeletConfiguration::new(constants, config)?)?;
        files::write_atomic(&constants.kubelet_config, kubelet_config.as_bytes(), 0o600)?;
        debug!("Wrote kubelet bootstrap files");

        let reference = image(config)?;
        ensure_image(machine.images.as_ref(), &reference).await?;
        Ok(())
    }

    async fn runner(&self, machine: &Machine) -> anyhow::Result<Box<dyn Runner>> {
        let args = args(machine).await?;
        let reference = image(&machine.config)?;
        let rootfs = machine
            .images
            .lookup(&reference)
            .await?
            .with_context(|| format!("image {} is not present", reference))?;
        let spec = container_spec(machine, args, &rootfs)?;
        info!(image = %reference, "Built kubelet container spec");

        let constants = &machine.constants;
        Ok(Box::new(
            OciRunner::new(ID, spec, constants.bundle_dir.join(ID), &constants.oci_runtime)
                .log_to(constants.log_dir.join("kubelet.log")),
        ))
    }

    fn restart_policy(&self) -> Policy {
        Policy::Forever
    }

    fn health_check(&self, machine: &Machine) -> Option<Arc<dyn Check>> {
        let url = format!(
            "http://127.0.0.1:{}/healthz",
            machine.constants.kubelet_healthz_port
        );
        url::Url::parse(&url)
            .ok()
            .map(|url| Arc::new(HttpCheck::new(url)) as Arc<dyn Check>)
    }

    fn health_settings(&self, _machine: &Machine) -> health::Settings {
        // The kubelet is slow to start serving its health endpoint.
        health::Settings {
            initial_delay: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn api_restart_allowed(&self, _machine: &Machine) -> bool {
        true
    }
}

fn image(config: &MachineConfig) -> anyhow::Result<Reference> {
    config
        .machine
        .kubelet
        .image
        .parse()
        .with_context(|| format!("invalid kubelet image {}", config.machine.kubelet.image))
}

#[derive(Serialize)]
struct KubeConfig {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: &'static str,
}

#[derive(Serialize)]
struct NamedCluster {
    name: &'static str,
    cluster: Cluster,
}

#[derive(Serialize)]
struct Cluster {
    server: String,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: String,
}

#[derive(Serialize)]
struct NamedUser {
    name: &'static str,
    user: User,
}

#[derive(Serialize)]
struct User {
    token: String,
}

#[derive(Serialize)]
struct NamedContext {
    name: &'static str,
    context: KubeContext,
}

#[derive(Serialize)]
struct KubeContext {
    cluster: &'static str,
    user: &'static str,
}

/// Renders the kubeconfig the kubelet uses for its first authenticated
/// connection: the cluster endpoint, the CA and the bootstrap token.
fn bootstrap_kubeconfig(config: &MachineConfig) -> anyhow::Result<String> {
    let cluster = &config.cluster;
    let kubeconfig = KubeConfig {
        api_version: "v1",
        kind: "Config",
        clusters: vec![NamedCluster {
            name: "local",
            cluster: Cluster {
                server: cluster.endpoint.to_string(),
                certificate_authority_data: base64::encode(config.ca_cert()?),
            },
        }],
        users: vec![NamedUser {
            name: "kubelet",
            user: User {
                token: format!("{}.{}", cluster.token.id(), cluster.token.secret()),
            },
        }],
        contexts: vec![NamedContext {
            name: "kubelet@local",
            context: KubeContext {
                cluster: "local",
                user: "kubelet",
            },
        }],
        current_context: "kubelet@local",
    };
    Ok(serde_yaml::to_string(&kubeconfig)?)
}

/// `kubelet.config.k8s.io/v1beta1` configuration of the kubelet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfiguration {
    /// API version.
    pub api_version: String,
    /// Object kind.
    pub kind: String,
    /// Directory of static pod manifests.
    pub static_pod_path: String,
    /// Listen address.
    pub address: String,
    /// Listen port.
    pub port: u16,
    /// OOM score adjustment of the kubelet.
    pub oom_score_adj: i32,
    /// Rotate the client certificate.
    pub rotate_certificates: bool,
    /// Authentication settings.
    pub authentication: Authentication,
    /// Authorization settings.
    pub authorization: Authorization,
    /// Cluster DNS domain.
    pub cluster_domain: String,
    /// Cluster DNS server addresses.
    #[serde(rename = "clusterDNS")]
    pub cluster_dns: Vec<String>,
    /// Pull one image at a time.
    pub serialize_image_pulls: bool,
    /// Refuse to start with swap enabled.
    pub fail_swap_on: bool,
    /// Root cgroup for pods.
    pub cgroup_root: String,
    /// Cgroup of system processes.
    pub system_cgroups: String,
    /// Resources reserved for the system.
    pub system_reserved: BTreeMap<String, String>,
    /// Cgroup of the kubelet.
    pub kubelet_cgroups: String,
}

/// Kubelet authentication settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    /// Client certificate authentication.
    pub x509: X509Authentication,
    /// Token review webhook.
    pub webhook: Toggle,
    /// Anonymous requests.
    pub anonymous: Toggle,
}

/// Client certificate authentication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct X509Authentication {
    /// CA bundle client certificates are verified against.
    #[serde(rename = "clientCAFile")]
    pub client_ca_file: String,
}

/// An on/off switch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toggle {
    /// Whether it is on.
    pub enabled: bool,
}

/// Kubelet authorization settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// Authorization mode.
    pub mode: String,
}

impl KubeletConfiguration {
    /// Builds the configuration for this machine.
    pub fn new(constants: &Constants, config: &MachineConfig) -> anyhow::Result<Self> {
        let cluster_dns = config
            .cluster_dns()
            .context("failed to get DNS service IPs")?;
        Ok(KubeletConfiguration {
            api_version: "kubelet.config.k8s.io/v1beta1".to_string(),
            kind: "KubeletConfiguration".to_string(),
            static_pod_path: constants.manifests_dir.display().to_string(),
            address: "0.0.0.0".to_string(),
            port: constants.kubelet_port,
            oom_score_adj: constants.kubelet_oom_score_adj,
            rotate_certificates: true,
            authentication: Authentication {
                x509: X509Authentication {
                    client_ca_file: constants.kubernetes_ca_cert.display().to_string(),
                },
                webhook: Toggle { enabled: true },
                anonymous: Toggle { enabled: false },
            },
            authorization: Authorization {
                mode: "Webhook".to_string(),
            },
            cluster_domain: config.cluster.network.dns_domain.clone(),
            cluster_dns,
            serialize_image_pulls: false,
            fail_swap_on: false,
            cgroup_root: "/".to_string(),
            system_cgroups: constants.system_cgroup.clone(),
            system_reserved: constants.system_reserved.clone(),
            kubelet_cgroups: constants.kubelet_cgroup.clone(),
        })
    }
}

/// Subnets node IPs are picked from: the operator's, else one "match
/// everything" subnet per service CIDR family. Pod CIDRs and virtual IPs are
/// always excluded.
fn valid_subnets(config: &MachineConfig) -> Result<Vec<String>, NodeIpError> {
    let mut subnets = config.machine.kubelet.node_ip.valid_subnets.clone();
    if subnets.is_empty() {
        subnets = ip_subnets_from_service_cidrs(&config.cluster.network.service_cidrs)?;
    }
    subnets.extend(
        config
            .cluster
            .network
            .pod_cidrs
            .iter()
            .map(|cidr| format!("!{}", cidr)),
    );
    subnets.extend(config.vips().into_iter().map(|vip| format!("!{}", vip)));
    Ok(subnets)
}

fn merge_policies() -> MergePolicies {
    DENIED_FLAGS
        .iter()
        .map(|flag| (flag.to_string(), MergePolicy::Denied))
        .collect()
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// The kubelet command line, without the executable.
async fn args(machine: &Machine) -> anyhow::Result<Vec<String>> {
    let constants = &machine.constants;
    let config = &machine.config;
    let nodename = node_name(&machine.store)
        .await
        .context("node name has not been published")?;

    let mut base: Args = vec![
        ("bootstrap-kubeconfig", path_arg(&constants.kubelet_bootstrap_kubeconfig)),
        ("kubeconfig", path_arg(&constants.kubelet_kubeconfig)),
        ("container-runtime", "remote".to_string()),
        (
            "container-runtime-endpoint",
            format!("unix://{}", constants.cri_socket.display()),
        ),
        ("config", path_arg(&constants.kubelet_config)),
        ("cert-dir", path_arg(&constants.kubelet_pki_dir)),
        ("cni-conf-dir", path_arg(&constants.cni_conf_dir)),
        ("hostname-override", nodename),
        ("logging-format", "json".to_string()),
    ]
    .into_iter()
    .collect();

    if config.cluster.external_cloud_provider {
        base.set("cloud-provider", "external");
    }

    let extra = Args::from(config.machine.kubelet.extra_args.clone());

    if !extra.contains("node-ip") {
        let subnets = valid_subnets(config)?;
        let node_ips = pick_node_ips(
            &subnets,
            &constants.reserved_networks,
            machine.addresses.as_ref(),
        )?;
        if !node_ips.is_empty() {
            let node_ips: Vec<String> = node_ips.iter().map(|ip| ip.to_string()).collect();
            base.set("node-ip", node_ips.join(","));
        }
    }

    let merged = args::build(&base, &extra, &merge_policies())?;
    Ok(merged.args())
}

/// Host paths the kubelet needs.
fn mounts(constants: &Constants) -> Vec<Mount> {
    let shared = &["rbind", "rshared", "rw"];
    let cgroup = constants.cgroup_mount_path.as_str();
    vec![
        Mount::bind("/dev", "/dev", shared),
        Mount::new("sysfs", "/sys", "/sys", &["bind", "ro"]),
        Mount::bind(cgroup, cgroup, shared),
        Mount::bind("/lib/modules", "/lib/modules", &["bind", "ro"]),
        Mount::bind("/etc/kubernetes", "/etc/kubernetes", &["bind", "rshared", "rw"]),
        Mount::bind("/etc/os-release", "/etc/os-release", &["bind", "ro"]),
        Mount::bind("/etc/cni", "/etc/cni", shared),
        Mount::bind("/usr/libexec/kubernetes", "/usr/libexec/kubernetes", shared),
        Mount::bind("/run", "/var/run", shared),
        Mount::bind("/var/lib/containerd", "/var/lib/containerd", shared),
        Mount::bind("/var/lib/kubelet", "/var/lib/kubelet", shared),
        Mount::bind("/var/log/containers", "/var/log/containers", shared),
        Mount::bind("/var/log/pods", "/var/log/pods", shared),
    ]
}

/// Allows the key management syscalls cephfs mounts need.
fn kubelet_seccomp(seccomp: &mut Seccomp) {
    seccomp.allow(&["add_key", "request_key"]);
}

fn container_spec(
    machine: &Machine,
    args: Vec<String>,
    rootfs: &Path,
) -> Result<ContainerSpec, ContainerSpecError> {
    let constants = &machine.constants;
    let kubelet = &machine.config.machine.kubelet;
    let process_args = std::iter::once(constants.kubelet_binary.clone()).chain(args);

    SpecBuilder::new(process_args)
        .with_root(rootfs.display().to_string())
        .with_env(machine.config.machine.env.clone())
        .with_mounts(mounts(constants))
        .with_extra_mounts(kubelet.extra_mounts.clone())
        .with_rootfs_propagation("shared")
        .with_cgroup(constants.kubelet_cgroup.clone())
        .with_host_namespace(NamespaceType::Network)
        .with_host_namespace(NamespaceType::Pid)
        .with_masked_paths(Vec::new())
        .with_readonly_paths(Vec::new())
        .with_writable_sysfs()
        .with_writable_cgroupfs()
        .with_selinux_label("")
        .with_apparmor_profile("")
        .with_all_devices_allowed()
        .with_capabilities(all_grantable_capabilities(&kubelet.drop_capabilities))
        .with_oom_score_adj(constants.kubelet_oom_score_adj)
        .with_seccomp(kubelet_seccomp)
        .build()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::args::ArgsError;
    use crate::condition::NODENAME_KIND;
    use crate::services::test::machine;
    use crate::state::ResourceKey;
    use serde_json::json;
    use std::net::IpAddr;
    use std::os::unix::fs::PermissionsExt;

    fn ips(addresses: &[&str]) -> Vec<IpAddr> {
        addresses.iter().map(|a| a.parse().unwrap()).collect()
    }

    async fn publish_nodename(machine: &Machine) {
        machine
            .store
            .put(
                ResourceKey::new(NODENAME_KIND, "nodename"),
                json!({"nodename": "worker-1"}),
            )
            .await;
    }

    fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
        let prefix = format!("--{}=", name);
        args.iter()
            .find(|a| a.starts_with(&prefix))
            .map(|a| &a[prefix.len()..])
    }

    #[tokio::test]
    async fn base_flags_and_node_ip() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(dir.path(), ips(&["10.5.0.100", "10.5.0.3", "10.5.0.4"]));
        publish_nodename(&machine).await;

        let args = args(&machine).await.unwrap();
        assert_eq!(flag(&args, "hostname-override"), Some("worker-1"));
        assert_eq!(flag(&args, "container-runtime"), Some("remote"));
        assert_eq!(flag(&args, "logging-format"), Some("json"));
        assert_eq!(flag(&args, "rotate-server-certificates"), Some("true"));
        assert_eq!(flag(&args, "cloud-provider"), None);
        assert_eq!(
            flag(&args, "container-runtime-endpoint"),
            Some(format!("unix://{}", machine.constants.cri_socket.display()).as_str())
        );
        // 10.5.0.100 is a VIP; 10.5.0.4 loses to the first discovered address.
        assert_eq!(flag(&args, "node-ip"), Some("10.5.0.3"));
        assert_eq!(args, super::args(&machine).await.unwrap());
    }

    #[tokio::test]
    async fn denied_flag_override_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = machine(dir.path(), vec![]);
        publish_nodename(&machine).await;
        machine
            .config
            .machine
            .kubelet
            .extra_args
            .insert("kubeconfig".to_string(), "/tmp/evil".to_string());

        let err = args(&machine).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<ArgsError>(),
            Some(&ArgsError::MergeDenied {
                flag: "kubeconfig".to_string()
            })
        );
    }

    #[tokio::test]
    async fn explicit_node_ip_skips_selection() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = machine(dir.path(), vec![]);
        publish_nodename(&machine).await;
        let kubelet = &mut machine.config.machine.kubelet;
        kubelet
            .extra_args
            .insert("node-ip".to_string(), "192.0.2.1".to_string());
        // Would fail to parse if selection ran.
        kubelet.node_ip.valid_subnets = vec!["not-a-subnet".to_string()];

        let args = args(&machine).await.unwrap();
        assert_eq!(flag(&args, "node-ip"), Some("192.0.2.1"));
    }

    #[tokio::test]
    async fn invalid_subnet_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = machine(dir.path(), ips(&["10.5.0.3"]));
        publish_nodename(&machine).await;
        machine.config.machine.kubelet.node_ip.valid_subnets = vec!["10.5.0.0/33".to_string()];

        let err = args(&machine).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NodeIpError>(),
            Some(NodeIpError::InvalidSubnet { subnet }) if subnet == "10.5.0.0/33"
        ));
    }

    #[tokio::test]
    async fn external_cloud_provider_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = machine(dir.path(), vec![]);
        publish_nodename(&machine).await;
        machine.config.cluster.external_cloud_provider = true;
        let args = args(&machine).await.unwrap();
        assert_eq!(flag(&args, "cloud-provider"), Some("external"));
    }

    #[tokio::test]
    async fn missing_node_name_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(dir.path(), vec![]);
        assert!(args(&machine).await.is_err());
    }

    #[test]
    fn default_subnets_come_from_service_cidrs() {
        let dir = tempfile::tempdir().unwrap();
        let mut machine = machine(dir.path(), vec![]);
        machine.config.machine.kubelet.node_ip.valid_subnets.clear();
        assert_eq!(
            valid_subnets(&machine.config).unwrap(),
            vec![
                "0.0.0.0/0",
                "::/0",
                "!10.244.0.0/16",
                "!10.5.0.100",
                "!192.168.10.100"
            ]
        );
    }

    #[test]
    fn kubeconfig_carries_endpoint_ca_and_token() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(dir.path(), vec![]);
        let rendered = bootstrap_kubeconfig(&machine.config).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(value["clusters"][0]["name"], "local");
        assert_eq!(value["clusters"][0]["cluster"]["server"], "https://10.5.0.2:6443/");
        assert_eq!(
            value["clusters"][0]["cluster"]["certificate-authority-data"],
            machine.config.cluster.ca.crt.as_str()
        );
        assert_eq!(value["users"][0]["name"], "kubelet");
        assert_eq!(value["users"][0]["user"]["token"], "abcdef.0123456789abcdef");
    }

    #[test]
    fn kubelet_configuration_fields() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(dir.path(), vec![]);
        let config = KubeletConfiguration::new(&machine.constants, &machine.config).unwrap();
        let value = serde_yaml::to_value(&config).unwrap();
        assert_eq!(value["apiVersion"], "kubelet.config.k8s.io/v1beta1");
        assert_eq!(value["kind"], "KubeletConfiguration");
        assert_eq!(value["authentication"]["anonymous"]["enabled"], false);
        assert_eq!(value["authentication"]["webhook"]["enabled"], true);
        assert_eq!(value["authorization"]["mode"], "Webhook");
        assert_eq!(value["clusterDNS"][0], "10.96.0.10");
        assert_eq!(value["clusterDomain"], "cluster.local");
        assert_eq!(value["systemReserved"]["memory"], "192Mi");
        assert_eq!(value["oomScoreAdj"], -450);
        assert_eq!(value["failSwapOn"], false);
    }

    #[tokio::test]
    async fn pre_func_writes_files_and_is_rerunnable() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(dir.path(), vec![]);
        let reference = image(&machine.config).unwrap();
        let rootfs = crate::image::DirectoryImageStore::new(&machine.constants.image_dir, vec![])
            .rootfs(&reference);
        std::fs::create_dir_all(&rootfs).unwrap();

        Kubelet.pre_func(&machine).await.unwrap();
        Kubelet.pre_func(&machine).await.unwrap();

        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        let constants = &machine.constants;
        assert_eq!(mode(&constants.kubelet_bootstrap_kubeconfig), 0o600);
        assert_eq!(mode(&constants.kubernetes_ca_cert), 0o400);
        assert_eq!(mode(constants.kubernetes_ca_cert.parent().unwrap()), 0o700);
        assert_eq!(mode(&constants.kubelet_config), 0o600);
        assert_eq!(
            std::fs::read(&constants.kubernetes_ca_cert).unwrap(),
            machine.config.ca_cert().unwrap()
        );
    }

    #[tokio::test]
    async fn pre_func_fails_when_image_cannot_be_pulled() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(dir.path(), vec![]);
        assert!(Kubelet.pre_func(&machine).await.is_err());
    }

    #[test]
    fn container_spec_matches_kubelet_needs() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(dir.path(), vec![]);
        let spec = container_spec(&machine, vec!["--v=2".to_string()], Path::new("/images/kubelet")).unwrap();

        assert_eq!(spec.process.args, vec!["/usr/local/bin/kubelet", "--v=2"]);
        assert_eq!(spec.root.path, "/images/kubelet");
        assert!(!spec.isolates(NamespaceType::Network));
        assert!(!spec.isolates(NamespaceType::Pid));
        assert!(spec.isolates(NamespaceType::Mount));
        assert_eq!(spec.linux.cgroups_path.as_deref(), Some("/kubelet"));
        assert_eq!(spec.linux.rootfs_propagation.as_deref(), Some("shared"));
        assert!(spec.linux.masked_paths.is_empty());
        assert!(spec.linux.readonly_paths.is_empty());
        assert_eq!(spec.process.oom_score_adj, Some(-450));
        assert!(spec.process.selinux_label.is_none());
        assert!(spec.linux.resources.devices[0].allow);
        assert!(spec.process.env.contains(&"http_proxy=http://proxy:3128".to_string()));

        let caps = &spec.process.capabilities.bounding;
        assert!(caps.contains(&"CAP_SYS_ADMIN".to_string()));
        assert!(!caps.contains(&"CAP_SYS_BOOT".to_string()));
        assert!(!caps.contains(&"CAP_SYS_MODULE".to_string()));

        let seccomp = spec.linux.seccomp.as_ref().unwrap();
        assert!(seccomp.allows("add_key"));
        assert!(seccomp.allows("request_key"));

        assert_eq!(spec.mount("/var/run").unwrap().source, "/run");
        assert_eq!(spec.mount("/dev").unwrap().mount_type, "bind");
        assert!(spec.mount("/var/lib/kubelet").is_some());
        let sys = spec.mount("/sys").unwrap();
        assert_eq!(sys.mount_type, "sysfs");
        assert!(!sys.options.contains(&"ro".to_string()));
        let extra = spec.mount("/var/local").unwrap();
        assert!(Path::new(&extra.source).is_dir());
    }

    #[test]
    fn condition_waits_for_time_network_and_nodename() {
        let dir = tempfile::tempdir().unwrap();
        let machine = machine(dir.path(), vec![]);
        let condition = Kubelet.condition(&machine).unwrap();
        assert_eq!(
            condition.to_string(),
            "time sync, network: address, hostname, etcfiles, nodename"
        );
        assert_eq!(Kubelet.depends_on(), vec!["cri"]);
        assert!(Kubelet.api_restart_allowed(&machine));
        assert_eq!(
            Kubelet.health_settings(&machine).initial_delay,
            Duration::from_secs(2)
        );
    }
}
