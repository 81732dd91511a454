// Copyright 2024 dprewarm developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Profile persistence.
//!
//! Each profile lives at `{vpns_dir}/{name}/` as the tunnel config file
//! (mode 0600) plus `vpn.conf` (mode 0644), both written atomically via
//! write-then-rename. WireGuard configs are sanitized before persisting:
//! legacy per-hook shell scripts are stripped, a `Table` directive is
//! injected when absent, and the `DNS` directive is dropped when
//! resolvconf is unavailable.

use crate::conf::{ConfError, VpnConf, VpnProvider};
use std::{
    fs, io,
    io::Write,
    net::{Ipv4Addr, Ipv6Addr},
    path::{Path, PathBuf},
};
use thiserror::Error;

const VPN_CONF: &str = "vpn.conf";
// IFNAMSIZ minus the trailing NUL.
const MAX_IFACE_LEN: usize = 15;

const CONFIG_MODE: u32 = 0o600;
const META_MODE: u32 = 0o644;

/// Profile persistence failures.
#[derive(Debug, Error)]
pub enum ProfileError {
    /// The name is empty, too long, or carries forbidden characters.
    #[error("invalid profile name '{0}'")]
    InvalidName(String),

    /// The name collides with a system interface, another managed
    /// profile, or an external profile root.
    #[error("interface name '{0}' is already in use")]
    NameTaken(String),

    /// No such profile.
    #[error("profile '{0}' does not exist")]
    NotFound(String),

    /// Metadata failure.
    #[error(transparent)]
    Conf(#[from] ConfError),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// System interface enumeration, injected for tests.
pub trait SystemInterfaces: Send + Sync {
    /// Names of all interfaces currently known to the system.
    fn names(&self) -> io::Result<Vec<String>>;
}

/// Enumeration backed by `/sys/class/net`.
pub struct SysClassNet;

impl SystemInterfaces for SysClassNet {
    fn names(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir("/sys/class/net")? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}

/// Everything needed to persist one profile.
#[derive(Debug, Clone)]
pub struct NewProfile {
    /// Interface name; doubles as the directory name.
    pub name: String,
    /// Tunnel flavor.
    pub provider: VpnProvider,
    /// File name for the tunnel config.
    pub config_file: String,
    /// Raw tunnel config as uploaded.
    pub config_body: String,
    /// Allocated policy-routing table.
    pub route_table: u32,
    /// Allocated firewall mark.
    pub mark: u32,
    /// IP-set names forced onto this tunnel.
    pub forced_ipsets: String,
    /// IPv4 tunnel endpoint.
    pub endpoint_v4: Option<Ipv4Addr>,
    /// IPv6 tunnel endpoint.
    pub endpoint_v6: Option<Ipv6Addr>,
    /// Underlying interface the tunnel binds to.
    pub bound_iface: String,
}

/// Manages the on-disk profile tree.
pub struct ProfileManager {
    vpns_dir: PathBuf,
    external_roots: Vec<PathBuf>,
    system: Box<dyn SystemInterfaces>,
}

impl ProfileManager {
    /// Create a manager over `vpns_dir`, refusing names claimed by any
    /// of `external_roots`.
    pub fn new(
        vpns_dir: impl Into<PathBuf>,
        external_roots: Vec<PathBuf>,
        system: Box<dyn SystemInterfaces>,
    ) -> Self {
        Self {
            vpns_dir: vpns_dir.into(),
            external_roots,
            system,
        }
    }

    fn profile_dir(&self, name: &str) -> PathBuf {
        self.vpns_dir.join(name)
    }

    fn validate_name(&self, name: &str) -> Result<(), ProfileError> {
        let valid = !name.is_empty()
            && name.len() <= MAX_IFACE_LEN
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ProfileError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    fn check_collisions(&self, name: &str) -> Result<(), ProfileError> {
        let ours = self.profile_dir(name).join(VPN_CONF).exists();
        if ours {
            // Re-saving an existing profile is an update, not a clash.
            return Ok(());
        }
        if self.system.names()?.iter().any(|existing| existing == name) {
            return Err(ProfileError::NameTaken(name.to_string()));
        }
        for root in &self.external_roots {
            if root.join(name).exists() {
                return Err(ProfileError::NameTaken(name.to_string()));
            }
        }
        Ok(())
    }

    /// Persist a profile atomically. `resolvconf_available` gates whether
    /// WireGuard `DNS` directives survive sanitization.
    pub fn save(&self, profile: &NewProfile, resolvconf_available: bool) -> Result<(), ProfileError> {
        self.validate_name(&profile.name)?;
        self.check_collisions(&profile.name)?;

        let body = match profile.provider {
            VpnProvider::External => sanitize_wireguard(
                &profile.config_body,
                profile.route_table,
                resolvconf_available,
            ),
            VpnProvider::Openvpn => profile.config_body.clone(),
        };

        let conf = VpnConf {
            provider: profile.provider,
            dev: profile.name.clone(),
            route_table: profile.route_table,
            mark: profile.mark,
            forced_ipsets: profile.forced_ipsets.clone(),
            endpoint_v4: profile.endpoint_v4,
            endpoint_v6: profile.endpoint_v6,
            bound_iface: profile.bound_iface.clone(),
            config_file: profile.config_file.clone(),
        };

        let dir = self.profile_dir(&profile.name);
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(&profile.config_file), &body, CONFIG_MODE)?;
        write_atomic(&dir.join(VPN_CONF), &conf.render(), META_MODE)?;
        log::info!("profile '{}' saved", profile.name);
        Ok(())
    }

    /// Load a profile's metadata.
    pub fn load(&self, name: &str) -> Result<VpnConf, ProfileError> {
        self.validate_name(name)?;
        let path = self.profile_dir(name).join(VPN_CONF);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProfileError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(VpnConf::parse(&raw)?)
    }

    /// Delete a profile directory.
    pub fn remove(&self, name: &str) -> Result<(), ProfileError> {
        self.validate_name(name)?;
        let dir = self.profile_dir(name);
        if !dir.join(VPN_CONF).exists() {
            return Err(ProfileError::NotFound(name.to_string()));
        }
        fs::remove_dir_all(dir)?;
        log::info!("profile '{}' removed", name);
        Ok(())
    }

    /// Names of all managed profiles, sorted.
    pub fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.vpns_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if entry.path().join(VPN_CONF).exists() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn write_atomic(path: &Path, contents: &str, mode: u32) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    set_mode(tmp.as_file(), mode)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &fs::File, _mode: u32) -> io::Result<()> {
    Ok(())
}

// Strip legacy hook scripts, force our routing table, and drop DNS
// handling when resolvconf cannot apply it.
fn sanitize_wireguard(body: &str, route_table: u32, resolvconf_available: bool) -> String {
    const HOOK_KEYS: [&str; 4] = ["preup", "postup", "predown", "postdown"];

    let mut out: Vec<String> = Vec::new();
    let mut in_interface = false;
    let mut has_table = false;
    let mut interface_header: Option<usize> = None;

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            in_interface = trimmed.eq_ignore_ascii_case("[interface]");
            if in_interface {
                interface_header = Some(out.len());
            }
            out.push(line.to_string());
            continue;
        }
        let key = trimmed
            .split_once('=')
            .map(|(key, _)| key.trim().to_ascii_lowercase())
            .unwrap_or_default();
        if HOOK_KEYS.contains(&key.as_str()) {
            continue;
        }
        if key == "dns" && !resolvconf_available {
            continue;
        }
        if in_interface && key == "table" {
            has_table = true;
        }
        out.push(line.to_string());
    }

    if !has_table {
        if let Some(header) = interface_header {
            out.insert(header + 1, format!("Table = {}", route_table));
        }
    }

    let mut rendered = out.join("\n");
    rendered.push('\n');
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubSystem(Vec<String>);

    impl SystemInterfaces for StubSystem {
        fn names(&self) -> io::Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    fn manager(dir: &Path, system_ifaces: &[&str], external: Vec<PathBuf>) -> ProfileManager {
        ProfileManager::new(
            dir,
            external,
            Box::new(StubSystem(
                system_ifaces.iter().map(|s| s.to_string()).collect(),
            )),
        )
    }

    fn wireguard_profile(name: &str) -> NewProfile {
        NewProfile {
            name: name.into(),
            provider: VpnProvider::External,
            config_file: "tunnel.conf".into(),
            config_body: concat!(
                "[Interface]\n",
                "PrivateKey = abc=\n",
                "Address = 10.9.0.2/32\n",
                "DNS = 10.9.0.1\n",
                "PostUp = /jffs/scripts/legacy-up.sh\n",
                "PreDown = /jffs/scripts/legacy-down.sh\n",
                "\n",
                "[Peer]\n",
                "PublicKey = def=\n",
                "Endpoint = 198.51.100.7:51820\n",
                "AllowedIPs = 0.0.0.0/0\n",
            )
            .into(),
            route_table: 201,
            mark: 0xc9,
            forced_ipsets: String::new(),
            endpoint_v4: Some("198.51.100.7".parse().unwrap()),
            endpoint_v6: None,
            bound_iface: String::new(),
        }
    }

    #[test]
    fn save_writes_both_files_and_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &["eth0"], vec![]);
        manager.save(&wireguard_profile("wg-sv-nl1"), false).unwrap();

        let conf = manager.load("wg-sv-nl1").unwrap();
        assert_eq!(conf.dev, "wg-sv-nl1");
        assert_eq!(conf.route_table, 201);
        assert_eq!(conf.mark, 0xc9);
        assert!(dir.path().join("wg-sv-nl1/tunnel.conf").exists());
        assert_eq!(manager.list().unwrap(), vec!["wg-sv-nl1"]);
    }

    #[cfg(unix)]
    #[test]
    fn files_carry_the_documented_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &[], vec![]);
        manager.save(&wireguard_profile("wg-sv-nl1"), false).unwrap();

        let config = fs::metadata(dir.path().join("wg-sv-nl1/tunnel.conf")).unwrap();
        assert_eq!(config.permissions().mode() & 0o777, 0o600);
        let meta = fs::metadata(dir.path().join("wg-sv-nl1/vpn.conf")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o644);
    }

    #[test]
    fn sanitizes_wireguard_configs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &[], vec![]);
        manager.save(&wireguard_profile("wg-sv-nl1"), false).unwrap();

        let body = fs::read_to_string(dir.path().join("wg-sv-nl1/tunnel.conf")).unwrap();
        assert!(!body.contains("PostUp"));
        assert!(!body.contains("PreDown"));
        assert!(!body.contains("DNS"));
        assert!(body.contains("Table = 201"));
        // Peer section untouched.
        assert!(body.contains("AllowedIPs = 0.0.0.0/0"));
    }

    #[test]
    fn dns_survives_when_resolvconf_is_available() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &[], vec![]);
        manager.save(&wireguard_profile("wg-sv-nl1"), true).unwrap();
        let body = fs::read_to_string(dir.path().join("wg-sv-nl1/tunnel.conf")).unwrap();
        assert!(body.contains("DNS = 10.9.0.1"));
    }

    #[test]
    fn existing_table_directive_is_kept() {
        let rendered = sanitize_wireguard("[Interface]\nTable = 333\n", 201, true);
        assert!(rendered.contains("Table = 333"));
        assert!(!rendered.contains("Table = 201"));
    }

    #[test]
    fn rejects_colliding_names() {
        let external = tempfile::tempdir().unwrap();
        fs::create_dir_all(external.path().join("wg-ext1")).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            dir.path(),
            &["eth0", "wg-live"],
            vec![external.path().to_path_buf()],
        );

        let mut profile = wireguard_profile("wg-live");
        assert!(matches!(
            manager.save(&profile, false),
            Err(ProfileError::NameTaken(_))
        ));
        profile.name = "wg-ext1".into();
        assert!(matches!(
            manager.save(&profile, false),
            Err(ProfileError::NameTaken(_))
        ));
    }

    #[test]
    fn resaving_own_profile_is_an_update() {
        let dir = tempfile::tempdir().unwrap();
        // The live interface exists because the profile is up; saving
        // again must still work.
        let manager = manager(dir.path(), &["wg-sv-nl1"], vec![]);
        let profile = wireguard_profile("wg-sv-nl1");
        // First save: name clashes with the live interface and no managed
        // profile owns it yet.
        assert!(matches!(
            manager.save(&profile, false),
            Err(ProfileError::NameTaken(_))
        ));

        // Pretend the profile predates the interface.
        let clean = manager2(dir.path());
        clean.save(&profile, false).unwrap();
        manager.save(&profile, false).unwrap();
    }

    fn manager2(dir: &Path) -> ProfileManager {
        ProfileManager::new(dir, vec![], Box::new(StubSystem(vec![])))
    }

    #[test]
    fn rejects_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &[], vec![]);
        for bad in ["", "has space", "way-too-long-interface-name", "a/b"] {
            let mut profile = wireguard_profile("x");
            profile.name = bad.into();
            assert!(matches!(
                manager.save(&profile, false),
                Err(ProfileError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn remove_deletes_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), &[], vec![]);
        manager.save(&wireguard_profile("wg-sv-nl1"), false).unwrap();
        manager.remove("wg-sv-nl1").unwrap();
        assert!(manager.list().unwrap().is_empty());
        assert!(matches!(
            manager.remove("wg-sv-nl1"),
            Err(ProfileError::NotFound(_))
        ));
    }
}
