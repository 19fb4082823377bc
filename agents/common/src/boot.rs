//! Netboot script generation.
//!
//! Every machine boot request is answered with an iPXE script derived
//! from the machine's boot field. Machines the control plane has never
//! heard of get the default network script, which is how autodiscovery
//! bootstraps new hardware.

use store_api::v0::BootAlternative;

/// Where the netboot artifacts and the control plane live, as seen from
/// the booting machine
#[derive(Debug, Clone)]
pub struct NetbootConfig {
    /// host the booting machine reaches the control plane on
    pub gc_host: String,
    /// port of the control plane
    pub gc_port: u16,
    /// kernel url override
    pub kernel: Option<String>,
    /// initrd url override
    pub initrd: Option<String>,
}

impl Default for NetbootConfig {
    fn default() -> Self {
        Self {
            gc_host: "localhost".into(),
            gc_port: 11011,
            kernel: None,
            initrd: None,
        }
    }
}

impl NetbootConfig {
    /// Kernel url, tftp from the control-plane host by default
    pub fn kernel_url(&self) -> String {
        self.kernel
            .clone()
            .unwrap_or_else(|| format!("tftp://{}/bios/vmlinuz", self.gc_host))
    }

    /// Initrd url, tftp from the control-plane host by default
    pub fn initrd_url(&self) -> String {
        self.initrd
            .clone()
            .unwrap_or_else(|| format!("tftp://{}/bios/initrd.img", self.gc_host))
    }
}

/// Render the iPXE script for one boot alternative. Local drives get a
/// short sanboot script; everything else fetches kernel and initrd over
/// the network with the control-plane url passed as a kernel parameter.
pub fn render_ipxe(boot: BootAlternative, config: &NetbootConfig) -> String {
    match boot.disk_number() {
        Some(disk) => format!(
            "#!ipxe\n\
             \n\
             echo Boot from local disk {disk}\n\
             sanboot --no-describe --drive 0x8{disk}\n",
            disk = disk
        ),
        // cdrom is treated as network for now
        None => format!(
            "#!ipxe\n\
             :kernel\n\
             kernel {kernel} showopts ip=dhcp net.ifnames=0 biosdevname=0 \
             gc_base_url=http://{host}:{port} || goto kernel\n\
             \n\
             :initrd\n\
             initrd {initrd} || goto initrd\n\
             boot\n",
            kernel = config.kernel_url(),
            initrd = config.initrd_url(),
            host = config.gc_host,
            port = config.gc_port,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_boot_points_at_the_control_plane() {
        let config = NetbootConfig {
            gc_host: "gc.example".into(),
            gc_port: 11011,
            kernel: None,
            initrd: None,
        };
        let script = render_ipxe(BootAlternative::Network, &config);
        assert!(script.starts_with("#!ipxe"));
        assert!(script.contains("kernel tftp://gc.example/bios/vmlinuz"));
        assert!(script.contains("initrd tftp://gc.example/bios/initrd.img"));
        assert!(script.contains("gc_base_url=http://gc.example:11011"));
    }

    #[test]
    fn hd_boot_chains_into_the_right_drive() {
        let script = render_ipxe(BootAlternative::Hd0, &NetbootConfig::default());
        assert!(script.contains("sanboot --no-describe --drive 0x80"));
        let script = render_ipxe(BootAlternative::Hd3, &NetbootConfig::default());
        assert!(script.contains("sanboot --no-describe --drive 0x83"));
    }

    #[test]
    fn cdrom_falls_back_to_network() {
        let config = NetbootConfig::default();
        assert_eq!(
            render_ipxe(BootAlternative::Cdrom, &config),
            render_ipxe(BootAlternative::Network, &config)
        );
    }

    #[test]
    fn url_overrides_win() {
        let config = NetbootConfig {
            gc_host: "gc.example".into(),
            gc_port: 11011,
            kernel: Some("https://mirror/vmlinuz".into()),
            initrd: Some("https://mirror/initrd.img".into()),
        };
        let script = render_ipxe(BootAlternative::Network, &config);
        assert!(script.contains("kernel https://mirror/vmlinuz"));
        assert!(script.contains("initrd https://mirror/initrd.img"));
    }
}
