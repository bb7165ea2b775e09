//! Configuration for the node supervisor.
//!
//! [`Constants`] holds the fixed paths, ports and cgroups the services use and
//! is built once at startup. [`MachineConfig`] is the operator supplied
//! machine configuration, read from YAML. If the "cli" feature is enabled,
//! [`Opts`] parses the daemon's command line.
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::net::IpAddr;
#[cfg(feature = "cli")]
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
#[cfg(feature = "cli")]
use structopt::StructOpt;
use thiserror::Error;

use crate::container::capability::DEFAULT_DROPPED_CAPABILITIES;
use crate::container::Mount;

const DNS_SERVICE_IP_INDEX: u32 = 10;
#[cfg(feature = "cli")]
const DEFAULT_CONFIG_FILE: &str = "/etc/machined/config.yaml";

/// Errors in the machine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The bootstrap token is not `<id>.<secret>`.
    #[error("bootstrap token must have the form <id>.<secret>")]
    InvalidToken,
    /// A service CIDR could not be parsed or is too small.
    #[error("invalid service CIDR {cidr}")]
    InvalidServiceCidr {
        /// The offending CIDR.
        cidr: String,
    },
}

/// Fixed paths, ports and limits used by the services.
#[derive(Clone, Debug)]
pub struct Constants {
    /// Bootstrap kubeconfig written for the kubelet.
    pub kubelet_bootstrap_kubeconfig: PathBuf,
    /// Kubeconfig the kubelet writes after bootstrapping.
    pub kubelet_kubeconfig: PathBuf,
    /// Rendered kubelet configuration file.
    pub kubelet_config: PathBuf,
    /// Kubernetes CA certificate.
    pub kubernetes_ca_cert: PathBuf,
    /// Directory of kubelet serving and client certificates.
    pub kubelet_pki_dir: PathBuf,
    /// CNI configuration directory.
    pub cni_conf_dir: PathBuf,
    /// Static pod manifests directory.
    pub manifests_dir: PathBuf,
    /// Kubelet executable inside its image.
    pub kubelet_binary: String,
    /// Kubelet API port.
    pub kubelet_port: u16,
    /// Kubelet liveness endpoint port.
    pub kubelet_healthz_port: u16,
    /// OOM score adjustment of the kubelet.
    pub kubelet_oom_score_adj: i32,
    /// Cgroup of the kubelet.
    pub kubelet_cgroup: String,
    /// Cgroup of system services.
    pub system_cgroup: String,
    /// Cgroup filesystem mount point.
    pub cgroup_mount_path: String,
    /// Resources reserved for the system.
    pub system_reserved: BTreeMap<String, String>,
    /// Container runtime executable.
    pub cri_binary: PathBuf,
    /// Container runtime socket.
    pub cri_socket: PathBuf,
    /// Container runtime persistent state.
    pub cri_root_dir: PathBuf,
    /// Container runtime ephemeral state.
    pub cri_state_dir: PathBuf,
    /// OCI runtime executable.
    pub oci_runtime: PathBuf,
    /// Directory of OCI bundles, one per container.
    pub bundle_dir: PathBuf,
    /// Directory of unpacked images.
    pub image_dir: PathBuf,
    /// Directory of service logs.
    pub log_dir: PathBuf,
    /// Networks whose addresses are never node IPs.
    pub reserved_networks: Vec<IpNet>,
}

impl Default for Constants {
    fn default() -> Self {
        let system_reserved = vec![
            ("cpu", "50m"),
            ("memory", "192Mi"),
            ("pid", "100"),
            ("ephemeral-storage", "256Mi"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Constants {
            kubelet_bootstrap_kubeconfig: PathBuf::from("/etc/kubernetes/bootstrap-kubeconfig"),
            kubelet_kubeconfig: PathBuf::from("/etc/kubernetes/kubeconfig-kubelet"),
            kubelet_config: PathBuf::from("/etc/kubernetes/kubelet.yaml"),
            kubernetes_ca_cert: PathBuf::from("/etc/kubernetes/pki/ca.crt"),
            kubelet_pki_dir: PathBuf::from("/var/lib/kubelet/pki"),
            cni_conf_dir: PathBuf::from("/etc/cni/net.d"),
            manifests_dir: PathBuf::from("/etc/kubernetes/manifests"),
            kubelet_binary: "/usr/local/bin/kubelet".to_string(),
            kubelet_port: 10250,
            kubelet_healthz_port: 10248,
            kubelet_oom_score_adj: -450,
            kubelet_cgroup: "/kubelet".to_string(),
            system_cgroup: "/system".to_string(),
            cgroup_mount_path: "/sys/fs/cgroup".to_string(),
            system_reserved,
            cri_binary: PathBuf::from("/bin/containerd"),
            cri_socket: PathBuf::from("/run/containerd/containerd.sock"),
            cri_root_dir: PathBuf::from("/var/lib/containerd"),
            cri_state_dir: PathBuf::from("/run/containerd"),
            oci_runtime: PathBuf::from("/bin/runc"),
            bundle_dir: PathBuf::from("/run/machined/bundles"),
            image_dir: PathBuf::from("/var/lib/machined/images"),
            log_dir: PathBuf::from("/var/log/machined"),
            reserved_networks: "fdae:41e4:649b:9303::/64"
                .parse::<IpNet>()
                .into_iter()
                .collect(),
        }
    }
}

impl Constants {
    /// Production constants with every file the supervisor writes or serves
    /// moved under `root`.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        let reroot = |path: &Path| root.join(path.strip_prefix("/").unwrap_or(path));
        let defaults = Constants::default();
        Constants {
            kubelet_bootstrap_kubeconfig: reroot(&defaults.kubelet_bootstrap_kubeconfig),
            kubelet_kubeconfig: reroot(&defaults.kubelet_kubeconfig),
            kubelet_config: reroot(&defaults.kubelet_config),
            kubernetes_ca_cert: reroot(&defaults.kubernetes_ca_cert),
            kubelet_pki_dir: reroot(&defaults.kubelet_pki_dir),
            cni_conf_dir: reroot(&defaults.cni_conf_dir),
            manifests_dir: reroot(&defaults.manifests_dir),
            cri_socket: reroot(&defaults.cri_socket),
            cri_root_dir: reroot(&defaults.cri_root_dir),
            cri_state_dir: reroot(&defaults.cri_state_dir),
            bundle_dir: reroot(&defaults.bundle_dir),
            image_dir: reroot(&defaults.image_dir),
            log_dir: reroot(&defaults.log_dir),
            ..defaults
        }
    }
}

/// A bootstrap token, `<id>.<secret>`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Token {
    id: String,
    secret: String,
}

impl Token {
    /// Token ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token secret.
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl TryFrom<String> for Token {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().split_once('.') {
            Some((id, secret)) if !id.is_empty() && !secret.is_empty() && !secret.contains('.') => {
                Ok(Token {
                    id: id.to_string(),
                    secret: secret.to_string(),
                })
            }
            _ => Err(ConfigError::InvalidToken),
        }
    }
}

impl From<Token> for String {
    fn from(token: Token) -> Self {
        format!("{}.{}", token.id, token.secret)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}.<redacted>)", self.id)
    }
}

/// The certificate authority of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateAuthority {
    /// Base64 encoded PEM certificate.
    pub crt: String,
}

/// Cluster networking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    /// Service CIDRs, primary first.
    #[serde(default)]
    pub service_cidrs: Vec<String>,
    /// Pod CIDRs.
    #[serde(default)]
    pub pod_cidrs: Vec<String>,
    /// Cluster DNS domain.
    #[serde(default = "default_dns_domain")]
    pub dns_domain: String,
}

fn default_dns_domain() -> String {
    "cluster.local".to_string()
}

/// Cluster wide settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// API server endpoint.
    pub endpoint: url::Url,
    /// Cluster CA.
    pub ca: CertificateAuthority,
    /// Bootstrap token.
    pub token: Token,
    /// Networking.
    pub network: ClusterNetwork,
    /// Whether nodes are initialized by an external cloud provider.
    #[serde(default)]
    pub external_cloud_provider: bool,
}

/// A virtual (shared) IP.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VipConfig {
    /// The address.
    pub ip: String,
}

/// A VLAN on a device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vlan {
    /// VLAN ID.
    pub vlan_id: u16,
    /// Virtual IP on the VLAN.
    #[serde(default)]
    pub vip: Option<VipConfig>,
}

/// A network device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Interface name.
    pub interface: String,
    /// Virtual IP on the device.
    #[serde(default)]
    pub vip: Option<VipConfig>,
    /// VLANs on the device.
    #[serde(default)]
    pub vlans: Vec<Vlan>,
}

/// Machine networking.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineNetwork {
    /// Devices.
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// Node IP selection settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIpConfig {
    /// Subnets node IPs are picked from. `!` negates.
    #[serde(default)]
    pub valid_subnets: Vec<String>,
}

/// Kubelet settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfig {
    /// Kubelet image reference.
    pub image: String,
    /// Extra command line flags.
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,
    /// Extra mounts. Sources are created if missing.
    #[serde(default)]
    pub extra_mounts: Vec<Mount>,
    /// Cluster DNS addresses. Derived from the service CIDRs if unset.
    #[serde(default, rename = "clusterDNS")]
    pub cluster_dns: Option<Vec<String>>,
    /// Node IP selection.
    #[serde(default, rename = "nodeIP")]
    pub node_ip: NodeIpConfig,
    /// Capabilities withheld from the kubelet.
    #[serde(default = "default_drop_capabilities")]
    pub drop_capabilities: Vec<String>,
}

fn default_drop_capabilities() -> Vec<String> {
    DEFAULT_DROPPED_CAPABILITIES
        .iter()
        .map(|c| c.to_string())
        .collect()
}

/// Image store settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// Command that unpacks `{reference}` into `{dest}`.
    #[serde(default)]
    pub pull_command: Vec<String>,
}

/// Node level settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Environment passed to services.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Networking.
    #[serde(default)]
    pub network: MachineNetwork,
    /// Kubelet.
    pub kubelet: KubeletConfig,
    /// Images.
    #[serde(default)]
    pub images: ImageConfig,
}

/// Operator supplied machine configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Cluster wide settings.
    pub cluster: ClusterConfig,
    /// Node level settings.
    pub machine: NodeConfig,
}

impl MachineConfig {
    /// Parses a YAML document.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("failed to parse machine configuration")
    }

    /// Reads and parses a YAML file.
    pub async fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("invalid configuration in {}", path.display()))
    }

    /// The decoded CA certificate.
    pub fn ca_cert(&self) -> anyhow::Result<Vec<u8>> {
        base64::decode(self.cluster.ca.crt.trim()).context("CA certificate is not valid base64")
    }

    /// The cluster DNS service addresses: the tenth address of every service
    /// CIDR.
    pub fn dns_service_ips(&self) -> Result<Vec<IpAddr>, ConfigError> {
        self.cluster
            .network
            .service_cidrs
            .iter()
            .map(|cidr| nth_ip(cidr, DNS_SERVICE_IP_INDEX))
            .collect()
    }

    /// Cluster DNS addresses the kubelet is configured with.
    pub fn cluster_dns(&self) -> Result<Vec<String>, ConfigError> {
        match &self.machine.kubelet.cluster_dns {
            Some(custom) => Ok(custom.clone()),
            None => Ok(self
                .dns_service_ips()?
                .iter()
                .map(|ip| ip.to_string())
                .collect()),
        }
    }

    /// Every virtual IP configured on a device or a VLAN of a device.
    pub fn vips(&self) -> Vec<String> {
        self.machine
            .network
            .devices
            .iter()
            .flat_map(|device| {
                device
                    .vip
                    .iter()
                    .chain(device.vlans.iter().filter_map(|vlan| vlan.vip.as_ref()))
                    .map(|vip| vip.ip.clone())
            })
            .collect()
    }
}

fn nth_ip(cidr: &str, n: u32) -> Result<IpAddr, ConfigError> {
    let invalid = || ConfigError::InvalidServiceCidr {
        cidr: cidr.to_string(),
    };
    let network = IpNet::from_str(cidr.trim()).map_err(|_| invalid())?;
    let ip = match network {
        IpNet::V4(net) => u32::from(net.network())
            .checked_add(n)
            .map(|ip| IpAddr::from(std::net::Ipv4Addr::from(ip))),
        IpNet::V6(net) => u128::from(net.network())
            .checked_add(u128::from(n))
            .map(|ip| IpAddr::from(std::net::Ipv6Addr::from(ip))),
    }
    .ok_or_else(invalid)?;
    if !network.contains(&ip) {
        return Err(invalid());
    }
    Ok(ip)
}

/// Command line options of the daemon.
#[derive(StructOpt, Clone, Debug)]
#[cfg(feature = "cli")]
#[structopt(
    name = "machined",
    about = "Supervises the node services of a Kubernetes machine"
)]
pub struct Opts {
    #[structopt(
        short = "c",
        long = "config",
        env = "MACHINED_CONFIG",
        default_value = DEFAULT_CONFIG_FILE,
        help = "The path to the machine configuration"
    )]
    /// Machine configuration file.
    pub config: PathBuf,

    #[structopt(
        long = "api-addr",
        env = "MACHINED_API_ADDR",
        default_value = "127.0.0.1:50000",
        help = "The address the operator API listens on"
    )]
    /// Operator API address.
    pub api_addr: SocketAddr,

    #[structopt(
        long = "root",
        env = "MACHINED_ROOT",
        help = "Prefix for every file machined writes. Defaults to /"
    )]
    /// Filesystem prefix.
    pub root: Option<PathBuf>,
}

#[cfg(feature = "cli")]
impl Opts {
    /// Parses the command line. `version` is reported by `--version`.
    pub fn from_flags(version: &str) -> Self {
        let app = Opts::clap().version(version);
        Opts::from_clap(&app.get_matches())
    }

    /// The constants selected by `--root`.
    pub fn constants(&self) -> Constants {
        match &self.root {
            Some(root) => Constants::with_root(root),
            None => Constants::default(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) const CONFIG: &str = r#"
cluster:
  endpoint: https://10.5.0.2:6443
  ca:
    crt: LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0tCg==
  token: abcdef.0123456789abcdef
  network:
    serviceCidrs: ["10.96.0.0/12", "fd00:10:96::/112"]
    podCidrs: ["10.244.0.0/16"]
machine:
  env:
    http_proxy: http://proxy:3128
  network:
    devices:
      - interface: eth0
        vip:
          ip: 10.5.0.100
        vlans:
          - vlanId: 10
            vip:
              ip: 192.168.10.100
          - vlanId: 20
  kubelet:
    image: ghcr.io/siderolabs/kubelet:v1.28.0
    extraArgs:
      rotate-server-certificates: "true"
    extraMounts:
      - destination: /var/local
        type: bind
        source: /var/local
        options: [rbind, rshared, rw]
    nodeIP:
      validSubnets: ["10.5.0.0/24"]
"#;

    #[test]
    fn parses_machine_config() {
        let config = MachineConfig::from_yaml(CONFIG).unwrap();
        assert_eq!(config.cluster.token.id(), "abcdef");
        assert_eq!(config.cluster.token.secret(), "0123456789abcdef");
        assert_eq!(config.cluster.network.dns_domain, "cluster.local");
        assert!(!config.cluster.external_cloud_provider);
        assert_eq!(config.machine.kubelet.extra_mounts[0].destination, "/var/local");
        assert_eq!(config.machine.kubelet.node_ip.valid_subnets, vec!["10.5.0.0/24"]);
        assert_eq!(
            config.machine.kubelet.drop_capabilities,
            vec!["CAP_SYS_BOOT", "CAP_SYS_MODULE"]
        );
        assert_eq!(
            config.ca_cert().unwrap(),
            b"-----BEGIN CERTIFICATE-----\n".to_vec()
        );
    }

    #[test]
    fn rejects_malformed_token() {
        let yaml = CONFIG.replace("abcdef.0123456789abcdef", "no-dot-here");
        assert!(MachineConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn token_debug_hides_secret() {
        let config = MachineConfig::from_yaml(CONFIG).unwrap();
        let rendered = format!("{:?}", config.cluster.token);
        assert!(!rendered.contains("0123456789abcdef"));
    }

    #[test]
    fn dns_service_ips_are_tenth_address() {
        let config = MachineConfig::from_yaml(CONFIG).unwrap();
        let ips: Vec<String> = config
            .dns_service_ips()
            .unwrap()
            .iter()
            .map(|ip| ip.to_string())
            .collect();
        assert_eq!(ips, vec!["10.96.0.10", "fd00:10:96::a"]);
        assert_eq!(config.cluster_dns().unwrap(), ips);
    }

    #[test]
    fn cluster_dns_override_wins() {
        let mut config = MachineConfig::from_yaml(CONFIG).unwrap();
        config.machine.kubelet.cluster_dns = Some(vec!["1.1.1.1".to_string()]);
        assert_eq!(config.cluster_dns().unwrap(), vec!["1.1.1.1"]);
    }

    #[test]
    fn tiny_service_cidr_is_invalid() {
        assert!(matches!(
            nth_ip("10.0.0.0/30", 10),
            Err(ConfigError::InvalidServiceCidr { .. })
        ));
        assert!(nth_ip("not-a-cidr", 10).is_err());
    }

    #[test]
    fn vips_include_vlans() {
        let config = MachineConfig::from_yaml(CONFIG).unwrap();
        assert_eq!(config.vips(), vec!["10.5.0.100", "192.168.10.100"]);
    }

    #[test]
    fn with_root_moves_written_files() {
        let constants = Constants::with_root("/tmp/node");
        assert_eq!(
            constants.kubelet_bootstrap_kubeconfig,
            PathBuf::from("/tmp/node/etc/kubernetes/bootstrap-kubeconfig")
        );
        assert_eq!(
            constants.cri_socket,
            PathBuf::from("/tmp/node/run/containerd/containerd.sock")
        );
        assert_eq!(constants.oci_runtime, PathBuf::from("/bin/runc"));
        assert_eq!(constants.kubelet_healthz_port, 10248);
    }

    #[test]
    fn reserved_network_is_overlay() {
        let constants = Constants::default();
        assert_eq!(
            constants.reserved_networks,
            vec!["fdae:41e4:649b:9303::/64".parse::<IpNet>().unwrap()]
        );
    }
}
