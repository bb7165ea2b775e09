//! Concrete services.
mod cri;
mod kubelet;

pub use cri::{Cri, SocketCheck};
pub use kubelet::{Kubelet, KubeletConfiguration};

#[cfg(test)]
pub(crate) mod test {
    use std::net::IpAddr;
    use std::path::Path;
    use std::sync::Arc;

    use crate::config::{test::CONFIG, Constants, MachineConfig};
    use crate::image::DirectoryImageStore;
    use crate::nodeip::StaticAddresses;
    use crate::service::Machine;
    use crate::state::ResourceStore;

    /// A machine rooted under `root`, seeing `addresses` on its interfaces.
    pub(crate) fn machine(root: &Path, addresses: Vec<IpAddr>) -> Machine {
        let constants = Constants::with_root(root);
        let mut config = MachineConfig::from_yaml(CONFIG).unwrap();
        for mount in config.machine.kubelet.extra_mounts.iter_mut() {
            mount.source = root
                .join(mount.source.trim_start_matches('/'))
                .display()
                .to_string();
        }
        Machine {
            images: Arc::new(DirectoryImageStore::new(&constants.image_dir, vec![])),
            constants,
            config,
            store: ResourceStore::new(),
            addresses: Arc::new(StaticAddresses(addresses)),
        }
    }
}
