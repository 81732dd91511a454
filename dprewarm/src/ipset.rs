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

use async_trait::async_trait;
use dwarm::ipset::{IpsetError, IpsetOps};
use std::net::IpAddr;
use tokio::process::Command;

/// Operator shelling out to `ipset(8)`. `-exist` makes re-insertion
/// refresh the entry timeout instead of failing.
pub struct ExecIpset;

#[async_trait]
impl IpsetOps for ExecIpset {
    async fn add(&self, set: &str, addr: IpAddr, expiry_secs: u32) -> Result<(), IpsetError> {
        let output = Command::new("ipset")
            .args([
                "add",
                "-exist",
                set,
                &addr.to_string(),
                "timeout",
                &expiry_secs.to_string(),
            ])
            .output()
            .await
            .map_err(|e| IpsetError::new(set, e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IpsetError::new(set, stderr.trim()));
        }
        Ok(())
    }
}
