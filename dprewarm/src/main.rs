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

mod ipset;
mod parser;

use self::ipset::ExecIpset;
use self::parser::{FileConfig, Parsed};
use anyhow::{Context, Result};
use dvpn::{
    alloc::{IdAllocator, SystemKernelState},
    conf::VpnProvider,
    profile::{NewProfile, ProfileManager, SysClassNet},
};
use dwarm::{cache::MemoryCache, scheduler::Scheduler, store::RunStore};
use log::*;
use simple_logger::SimpleLogger;
use std::{path::PathBuf, process::Command as SyncCommand, sync::Arc};
use structopt::StructOpt;
use tokio::fs;

#[derive(StructOpt)]
#[structopt(name = "dprewarm", about = "Split-tunnel DNS pre-warm daemon.")]
struct Opts {
    /// Path to the YAML configuration file.
    #[structopt(short, long, parse(from_os_str))]
    config: PathBuf,

    #[structopt(subcommand)]
    command: Option<Cmd>,
}

#[derive(StructOpt)]
enum Cmd {
    /// Run the pre-warm daemon (the default).
    Run,
    /// Manage VPN profiles.
    Profile(ProfileCmd),
}

#[derive(StructOpt)]
enum ProfileCmd {
    /// Persist a WireGuard profile, allocating its table and mark.
    Add {
        /// Interface name, e.g. wg-sv-nl1.
        name: String,
        /// Path to the uploaded WireGuard config.
        #[structopt(parse(from_os_str))]
        tunnel_config: PathBuf,
    },
    /// Delete a profile.
    Remove {
        /// Interface name.
        name: String,
    },
    /// List managed profiles.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::from_args();
    let raw = fs::read_to_string(&opts.config)
        .await
        .with_context(|| format!("reading {}", opts.config.display()))?;
    let parsed: Parsed = serde_yaml::from_str(&raw)?;

    SimpleLogger::new().with_level(parsed.verbosity).init()?;

    match opts.command.unwrap_or(Cmd::Run) {
        Cmd::Run => run_daemon(parsed).await,
        Cmd::Profile(cmd) => profile_command(parsed, cmd).await,
    }
}

async fn run_daemon(parsed: Parsed) -> Result<()> {
    let store = Arc::new(
        RunStore::open(&parsed.db_path)
            .with_context(|| format!("opening {}", parsed.db_path.display()))?,
    );
    let cache = Arc::new(MemoryCache::new());
    let config = Arc::new(FileConfig::new(parsed));

    let scheduler = Scheduler::builder(config, store, cache, Arc::new(ExecIpset))
        .on_error(Arc::new(|failure| {
            warn!(
                "query failed: stage={} domain={} interface={} resolver={}: {}",
                failure.stage, failure.domain, failure.interface, failure.resolver, failure.error
            );
        }))
        .build();
    scheduler.start();

    info!("dprewarm ready!");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    scheduler.stop().await;
    Ok(())
}

async fn profile_command(parsed: Parsed, cmd: ProfileCmd) -> Result<()> {
    let manager = ProfileManager::new(
        parsed.vpns_dir.clone(),
        parsed.external_profile_roots.clone(),
        Box::new(SysClassNet),
    );

    match cmd {
        ProfileCmd::Add {
            name,
            tunnel_config,
        } => {
            let body = fs::read_to_string(&tunnel_config)
                .await
                .with_context(|| format!("reading {}", tunnel_config.display()))?;

            let mut allocator = IdAllocator::new(
                Box::new(SystemKernelState),
                parsed.vpns_dir.clone(),
                parsed.external_profile_roots.clone(),
            );
            let route_table = allocator.allocate_table()?;
            let mark = match allocator.allocate_mark() {
                Ok(mark) => mark,
                Err(e) => {
                    allocator.release_table(route_table);
                    return Err(e.into());
                }
            };

            let profile = NewProfile {
                name: name.clone(),
                provider: VpnProvider::External,
                config_file: "tunnel.conf".into(),
                config_body: body,
                route_table,
                mark,
                forced_ipsets: String::new(),
                endpoint_v4: None,
                endpoint_v6: None,
                bound_iface: String::new(),
            };
            if let Err(e) = manager.save(&profile, resolvconf_available()) {
                allocator.release_table(route_table);
                allocator.release_mark(mark);
                return Err(e.into());
            }
            println!("{}: table {} mark 0x{:x}", name, route_table, mark);
        }
        ProfileCmd::Remove { name } => {
            manager.remove(&name)?;
            println!("{} removed", name);
        }
        ProfileCmd::List => {
            for name in manager.list()? {
                match manager.load(&name) {
                    Ok(conf) => println!(
                        "{}\t{}\ttable {}\tmark 0x{:x}",
                        name, conf.provider, conf.route_table, conf.mark
                    ),
                    Err(e) => println!("{}\t(unreadable: {})", name, e),
                }
            }
        }
    }
    Ok(())
}

fn resolvconf_available() -> bool {
    SyncCommand::new("resolvconf")
        .arg("--version")
        .output()
        .is_ok()
}
