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

use dvpn::profile::{ProfileManager, SysClassNet};
use dwarm::{
    plan::DomainGroup,
    scheduler::ConfigSource,
    settings::RawSettings,
};
use log::LevelFilter;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
#[serde(remote = "LevelFilter")]
enum LevelFilterDef {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Deserialize, Clone)]
pub struct Parsed {
    #[serde(with = "LevelFilterDef")]
    pub verbosity: LevelFilter,
    pub db_path: PathBuf,
    pub vpns_dir: PathBuf,
    #[serde(default)]
    pub external_profile_roots: Vec<PathBuf>,
    #[serde(default)]
    pub groups: Vec<DomainGroup>,
    #[serde(default)]
    pub settings: RawSettings,
}

/// `ConfigSource` over the parsed file. Profile interfaces come from the
/// managed profile tree, so freshly added profiles are picked up on the
/// next run without a restart.
pub struct FileConfig {
    parsed: Parsed,
    profiles: ProfileManager,
}

impl FileConfig {
    pub fn new(parsed: Parsed) -> Self {
        let profiles = ProfileManager::new(
            parsed.vpns_dir.clone(),
            parsed.external_profile_roots.clone(),
            Box::new(SysClassNet),
        );
        Self { parsed, profiles }
    }
}

impl ConfigSource for FileConfig {
    fn domain_groups(&self) -> Vec<DomainGroup> {
        self.parsed.groups.clone()
    }

    fn profile_interfaces(&self) -> Vec<String> {
        self.profiles.list().unwrap_or_default()
    }

    fn settings(&self) -> RawSettings {
        self.parsed.settings.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let parsed: Parsed = serde_yaml::from_str(include_str!("../configs/default.yaml")).unwrap();
        assert_eq!(parsed.verbosity, LevelFilter::Info);
        assert_eq!(parsed.groups.len(), 1);
        assert_eq!(parsed.groups[0].rules[0].ipset_v4, "media-v4");
        assert_eq!(parsed.settings.interval_secs, 7_200);
        assert!(parsed.settings.extra_nameservers.contains("8.8.8.8"));
    }

    #[test]
    fn parsed_settings_validate() {
        let parsed: Parsed = serde_yaml::from_str(include_str!("../configs/default.yaml")).unwrap();
        let settings = parsed.settings.validate().unwrap();
        assert_eq!(settings.extra_nameservers.len(), 2);
        assert_eq!(settings.ecs_profiles.len(), 1);
        assert_eq!(settings.ecs_profiles[0].name, "eu");
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let parsed: Parsed = serde_yaml::from_str(
            "verbosity: warn\ndb_path: /tmp/runs.db\nvpns_dir: /tmp/vpns\n",
        )
        .unwrap();
        assert!(parsed.groups.is_empty());
        assert_eq!(parsed.settings.parallelism, 4);
    }
}
