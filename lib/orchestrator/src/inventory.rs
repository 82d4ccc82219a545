// SPDX-License-Identifier: Apache-2.0

//! Inventory and playbook documents for the external provisioner.
//!
//! The inventory maps an ordered brick list onto MGS/MDT/OST roles. The
//! mapping is the contract the brick-host agents depend on: two equal inputs
//! must produce byte-identical documents, and reordering bricks silently
//! corrupts Lustre object placement. Keep the formatting exact.
//!
//! Role assignment walks the bricks in allocation order. The first brick
//! picks the MGS host; for Lustre the MGS lives on a dedicated device and is
//! not one of the bricks, for BeeGFS it shares the first brick's device.
//! Every brick becomes an OST with its allocation position as the index.
//! MDTs get the same indices, but each host only offers its first
//! `max(1, max_mdts / host_count)` bricks, and the global MDT count never
//! exceeds `max_mdts`.

use std::fmt::Write as _;

use crate::config::FilesystemConfig;
use crate::datamodel::{Brick, BrickHostName, FsType};

/// Render the provisioner inventory for one filesystem.
///
/// `bricks` is the session's ordered allocation list and must not be empty.
pub fn inventory(
    fs_type: FsType,
    fs_uuid: &str,
    bricks: &[Brick],
    conf: &FilesystemConfig,
) -> String {
    debug_assert!(!bricks.is_empty());
    if bricks.is_empty() {
        return String::new();
    }

    // Group devices by host in first-encounter order, carrying the global
    // allocation position of each brick.
    let mut hosts: Vec<(BrickHostName, Vec<(String, usize)>)> = Vec::new();
    for (index, brick) in bricks.iter().enumerate() {
        match hosts.iter_mut().find(|(host, _)| *host == brick.host) {
            Some((_, devices)) => devices.push((brick.device.clone(), index)),
            None => hosts.push((brick.host.clone(), vec![(brick.device.clone(), index)])),
        }
    }

    let mdts_per_host = std::cmp::max(1, conf.max_mdts as usize / hosts.len());
    let mgs_host = &bricks[0].host;
    let mgs_device = match fs_type {
        FsType::Lustre => conf.mgs_device.as_str(),
        FsType::BeeGFS => bricks[0].device.as_str(),
    };

    let mut out = String::new();
    let _ = writeln!(out, "{}:", conf.host_group);
    let _ = writeln!(out, "  children:");
    let _ = writeln!(out, "    {fs_uuid}:");
    let _ = writeln!(out, "      hosts:");

    let mut global_mdts = 0usize;
    for (host, devices) in &hosts {
        let _ = writeln!(out, "        {host}:");
        if host == mgs_host {
            let _ = writeln!(out, "          {fs_uuid}_mgs: {mgs_device}");
        }

        let mut mdts: Vec<&(String, usize)> = Vec::new();
        for entry in devices.iter().take(mdts_per_host) {
            if global_mdts >= conf.max_mdts as usize {
                break;
            }
            mdts.push(entry);
            global_mdts += 1;
        }
        if !mdts.is_empty() {
            let _ = writeln!(out, "          {fs_uuid}_mdts: {}", flow_map(&mdts));
        }
        let all: Vec<&(String, usize)> = devices.iter().collect();
        let _ = writeln!(out, "          {fs_uuid}_osts: {}", flow_map(&all));
    }

    let _ = writeln!(out, "      vars:");
    let _ = writeln!(out, "        lnet_suffix: \"{}\"", conf.lnet_suffix);
    let _ = writeln!(out, "        {fs_uuid}_mdt_size: {}m", conf.mdt_size_mb);
    let _ = writeln!(out, "        {fs_uuid}_mgsnode: {mgs_host}");
    out
}

/// `{dev: index, dev: index}` in insertion order.
fn flow_map(entries: &[&(String, usize)]) -> String {
    let mut out = String::from("{");
    for (i, (device, index)) in entries.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{device}: {index}");
    }
    out.push('}');
    out
}

/// Render the provisioning playbook handed to the external runner.
pub fn playbook(fs_type: FsType, fs_uuid: &str) -> String {
    format!(
        r#"---
- name: Setup FS
  hosts: {fs_uuid}
  any_errors_fatal: true
  become: yes
  roles:
    - role: {fs_type}
      vars:
        fs_name: {fs_uuid}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brick(host: &str, device: &str) -> Brick {
        Brick::new(host, device, "nvme")
    }

    fn conf() -> FilesystemConfig {
        FilesystemConfig::default()
    }

    #[test]
    fn beegfs_inventory_shares_first_device_for_mgs() {
        let bricks = vec![
            brick("dac1", "nvme1n1"),
            brick("dac1", "nvme2n1"),
            brick("dac1", "nvme3n1"),
            brick("dac2", "nvme2n1"),
            brick("dac2", "nvme3n1"),
        ];
        let result = inventory(FsType::BeeGFS, "abcdefgh", &bricks, &conf());
        let expected = r#"dac-prod:
  children:
    abcdefgh:
      hosts:
        dac1:
          abcdefgh_mgs: nvme1n1
          abcdefgh_mdts: {nvme1n1: 0, nvme2n1: 1, nvme3n1: 2}
          abcdefgh_osts: {nvme1n1: 0, nvme2n1: 1, nvme3n1: 2}
        dac2:
          abcdefgh_mdts: {nvme2n1: 3, nvme3n1: 4}
          abcdefgh_osts: {nvme2n1: 3, nvme3n1: 4}
      vars:
        lnet_suffix: ""
        abcdefgh_mdt_size: 20480m
        abcdefgh_mgsnode: dac1
"#;
        assert_eq!(result, expected);
    }

    #[test]
    fn lustre_inventory_uses_dedicated_mgs_device() {
        let bricks = vec![
            brick("dac1", "nvme1n1"),
            brick("dac2", "nvme2n1"),
            brick("dac2", "nvme3n1"),
        ];
        let result = inventory(FsType::Lustre, "abcdefgh", &bricks, &conf());
        let expected = r#"dac-prod:
  children:
    abcdefgh:
      hosts:
        dac1:
          abcdefgh_mgs: sdb
          abcdefgh_mdts: {nvme1n1: 0}
          abcdefgh_osts: {nvme1n1: 0}
        dac2:
          abcdefgh_mdts: {nvme2n1: 1, nvme3n1: 2}
          abcdefgh_osts: {nvme2n1: 1, nvme3n1: 2}
      vars:
        lnet_suffix: ""
        abcdefgh_mdt_size: 20480m
        abcdefgh_mgsnode: dac1
"#;
        assert_eq!(result, expected);
    }

    #[test]
    fn mdt_quota_shrinks_with_host_count() {
        let mut bricks = Vec::new();
        for i in (1..=26).step_by(2) {
            bricks.push(brick(&format!("dac{i}"), "nvme1n1"));
            bricks.push(brick(&format!("dac{i}"), "nvme2n1"));
        }
        let result = inventory(FsType::Lustre, "abcdefgh", &bricks, &conf());
        let expected = r#"dac-prod:
  children:
    abcdefgh:
      hosts:
        dac1:
          abcdefgh_mgs: sdb
          abcdefgh_mdts: {nvme1n1: 0}
          abcdefgh_osts: {nvme1n1: 0, nvme2n1: 1}
        dac3:
          abcdefgh_mdts: {nvme1n1: 2}
          abcdefgh_osts: {nvme1n1: 2, nvme2n1: 3}
        dac5:
          abcdefgh_mdts: {nvme1n1: 4}
          abcdefgh_osts: {nvme1n1: 4, nvme2n1: 5}
        dac7:
          abcdefgh_mdts: {nvme1n1: 6}
          abcdefgh_osts: {nvme1n1: 6, nvme2n1: 7}
        dac9:
          abcdefgh_mdts: {nvme1n1: 8}
          abcdefgh_osts: {nvme1n1: 8, nvme2n1: 9}
        dac11:
          abcdefgh_mdts: {nvme1n1: 10}
          abcdefgh_osts: {nvme1n1: 10, nvme2n1: 11}
        dac13:
          abcdefgh_mdts: {nvme1n1: 12}
          abcdefgh_osts: {nvme1n1: 12, nvme2n1: 13}
        dac15:
          abcdefgh_mdts: {nvme1n1: 14}
          abcdefgh_osts: {nvme1n1: 14, nvme2n1: 15}
        dac17:
          abcdefgh_mdts: {nvme1n1: 16}
          abcdefgh_osts: {nvme1n1: 16, nvme2n1: 17}
        dac19:
          abcdefgh_mdts: {nvme1n1: 18}
          abcdefgh_osts: {nvme1n1: 18, nvme2n1: 19}
        dac21:
          abcdefgh_mdts: {nvme1n1: 20}
          abcdefgh_osts: {nvme1n1: 20, nvme2n1: 21}
        dac23:
          abcdefgh_mdts: {nvme1n1: 22}
          abcdefgh_osts: {nvme1n1: 22, nvme2n1: 23}
        dac25:
          abcdefgh_mdts: {nvme1n1: 24}
          abcdefgh_osts: {nvme1n1: 24, nvme2n1: 25}
      vars:
        lnet_suffix: ""
        abcdefgh_mdt_size: 20480m
        abcdefgh_mgsnode: dac1
"#;
        assert_eq!(result, expected);
    }

    #[test]
    fn global_mdt_count_never_exceeds_cap() {
        // More hosts than max_mdts: the per-host quota floors at one, so the
        // global stop has to hold the line.
        let bricks: Vec<Brick> = (1..=30)
            .map(|i| brick(&format!("dac{i}"), "nvme1n1"))
            .collect();
        let result = inventory(FsType::Lustre, "abcdefgh", &bricks, &conf());
        let mdt_lines = result.matches("_mdts:").count();
        assert_eq!(mdt_lines, 24);
        // Every brick is still an OST.
        assert_eq!(result.matches("_osts:").count(), 30);
    }

    #[test]
    fn inventory_is_deterministic() {
        let bricks = vec![
            brick("dac1", "nvme1n1"),
            brick("dac2", "nvme2n1"),
            brick("dac1", "nvme3n1"),
        ];
        let first = inventory(FsType::Lustre, "abcdefgh", &bricks, &conf());
        let second = inventory(FsType::Lustre, "abcdefgh", &bricks, &conf());
        assert_eq!(first, second);
    }

    #[test]
    fn lustre_playbook() {
        let result = playbook(FsType::Lustre, "abcdefgh");
        assert_eq!(
            result,
            r#"---
- name: Setup FS
  hosts: abcdefgh
  any_errors_fatal: true
  become: yes
  roles:
    - role: lustre
      vars:
        fs_name: abcdefgh"#
        );
    }

    #[test]
    fn beegfs_playbook() {
        let result = playbook(FsType::BeeGFS, "abcdefgh");
        assert_eq!(
            result,
            r#"---
- name: Setup FS
  hosts: abcdefgh
  any_errors_fatal: true
  become: yes
  roles:
    - role: beegfs
      vars:
        fs_name: abcdefgh"#
        );
    }
}
