//! `/proc` process introspection and boot-mode session classification.

use kiln_common::{KilnError, KilnResult};

use super::SessionClassifier;

/// The parent process id of `pid`, from `/proc/<pid>/stat`.
pub fn parent_of(pid: u32) -> KilnResult<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;
    parse_ppid(&stat).ok_or_else(|| KilnError::Internal {
        message: format!("unparsable stat line for pid {pid}"),
    })
}

/// The command line of `pid`, from `/proc/<pid>/cmdline`.
pub fn cmdline_of(pid: u32) -> KilnResult<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline"))?;
    Ok(raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect())
}

/// Extract the ppid (field 4) from a stat line.
///
/// The comm field may contain spaces or parentheses, so fields are
/// counted from after the last `)`.
fn parse_ppid(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse().ok()
}

/// Whether a launcher command line carries the boot flag.
fn has_boot_flag(cmdline: &[String]) -> bool {
    cmdline.iter().any(|arg| arg == "-b" || arg == "--boot")
}

/// Classifies sessions by walking from the machine's leader process to
/// its launcher and scanning the launcher's command line for a boot flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct NspawnClassifier;

impl NspawnClassifier {
    /// The leader pid of a machine, from `machinectl show`.
    fn leader_of(machine_id: &str) -> Option<u32> {
        let output = std::process::Command::new("machinectl")
            .args(["show", machine_id, "--property=Leader", "--value"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }
}

impl SessionClassifier for NspawnClassifier {
    fn is_boot_session(&self, machine_id: &str) -> KilnResult<bool> {
        // The session may vanish between any two of these reads; that is
        // "not a boot session", not an error.
        let Some(leader) = Self::leader_of(machine_id) else {
            return Ok(false);
        };
        let Ok(launcher) = parent_of(leader) else {
            return Ok(false);
        };
        let Ok(cmdline) = cmdline_of(launcher) else {
            return Ok(false);
        };
        Ok(has_boot_flag(&cmdline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ppid_parsing() {
        assert_eq!(
            parse_ppid("1234 (systemd-nspawn) S 77 1234 1234 0 -1"),
            Some(77)
        );
        // Process names may contain spaces and parentheses.
        assert_eq!(parse_ppid("42 (weird (name)) S 7 42 42 0 -1"), Some(7));
        assert_eq!(parse_ppid("garbage"), None);
    }

    #[test]
    fn boot_flag_detection() {
        let boot = vec!["systemd-nspawn".into(), "--boot".into(), "-M".into()];
        let short = vec!["systemd-nspawn".into(), "-b".into()];
        let plain = vec!["systemd-nspawn".into(), "-D".into(), "/".into()];
        assert!(has_boot_flag(&boot));
        assert!(has_boot_flag(&short));
        assert!(!has_boot_flag(&plain));
    }

    #[test]
    fn own_process_is_introspectable() {
        let pid = std::process::id();
        let ppid = parent_of(pid).unwrap();
        assert!(ppid > 0);
        let cmdline = cmdline_of(pid).unwrap();
        assert!(!cmdline.is_empty());
    }
}
