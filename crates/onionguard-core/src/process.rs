//! Process table queries

use std::process::Command;
use sysinfo::{ProcessesToUpdate, System};

fn matches(process: &sysinfo::Process, name: &str) -> bool {
    process.name().to_string_lossy() == name
        || process
            .exe()
            .and_then(|exe| exe.file_name())
            .map(|file| file.to_string_lossy() == name)
            .unwrap_or(false)
}

/// Check if a process with exactly the given name is running
pub fn is_running(name: &str) -> bool {
    !find_pids(name).is_empty()
}

/// Get PIDs of processes with the given name
pub fn find_pids(name: &str) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut pids: Vec<u32> = sys
        .processes()
        .iter()
        .filter(|(_, p)| matches(p, name))
        .map(|(pid, _)| pid.as_u32())
        .collect();

    // Fallback: pgrep -x when the process table is not readable
    #[cfg(unix)]
    if pids.is_empty() {
        if let Ok(output) = Command::new("pgrep").args(["-x", name]).output() {
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                pids.extend(stdout.lines().filter_map(|line| line.trim().parse::<u32>().ok()));
            }
        }
    }

    pids.sort_unstable();
    pids
}
