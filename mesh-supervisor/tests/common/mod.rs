//! Helpers shared by the process-spawning integration tests
#![allow(dead_code)]

use mesh_supervisor::{ProcessGroupController, SignalGroupController};
use std::time::Duration;

/// Whether any process that has not yet exited still belongs to group `pgid`.
///
/// Orphans killed inside a container may linger as zombies when PID 1 does not
/// reap them; those count as gone.
pub fn group_has_live_members(pgid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return SignalGroupController.is_group_alive(pgid);
        };
        entries
            .flatten()
            .filter_map(|entry| std::fs::read_to_string(entry.path().join("stat")).ok())
            .any(|stat| {
                // "pid (comm) state ppid pgrp ..."
                let Some((_, rest)) = stat.rsplit_once(')') else {
                    return false;
                };
                let mut fields = rest.split_whitespace();
                let state = fields.next();
                let pgrp = fields.nth(1).and_then(|f| f.parse::<u32>().ok());
                pgrp == Some(pgid) && !matches!(state, Some("Z") | Some("X"))
            })
    }
    #[cfg(not(target_os = "linux"))]
    {
        SignalGroupController.is_group_alive(pgid)
    }
}

/// Wait up to two seconds for every member of `pgid` to exit
pub async fn assert_group_gone(pgid: u32) {
    for _ in 0..80 {
        if !group_has_live_members(pgid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("process group {pgid} still has live members");
}
