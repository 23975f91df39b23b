//! Live mount-table introspection.

use std::path::Path;

use kiln_common::KilnResult;

/// Whether `target` is currently a mount point.
///
/// Scans `/proc/self/mountinfo` for an exact match of the canonicalized
/// target path. A target that does not exist cannot be mounted.
pub fn is_mounted(target: &Path) -> KilnResult<bool> {
    let resolved = match target.canonicalize() {
        Ok(path) => path,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
    Ok(mountinfo_contains(&mountinfo, &resolved))
}

/// Whether a mountinfo table lists `target` as a mount point.
///
/// The mount point is the fifth space-separated field of each line (see
/// proc(5)).
fn mountinfo_contains(mountinfo: &str, target: &Path) -> bool {
    let needle = target.to_string_lossy();
    mountinfo
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split(' ').nth(4))
        .any(|mount_point| mount_point == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SAMPLE: &str = "\
22 28 0:21 / /proc rw,nosuid,nodev,noexec,relatime shared:12 - proc proc rw
28 1 8:2 / / rw,relatime shared:1 - ext4 /dev/sda2 rw
105 28 0:49 / /work/main rw,relatime shared:55 - overlay overlay rw,lowerdir=/a:/b,upperdir=/c,workdir=/d
";

    #[test]
    fn finds_exact_mount_point() {
        assert!(mountinfo_contains(SAMPLE, &PathBuf::from("/work/main")));
        assert!(mountinfo_contains(SAMPLE, &PathBuf::from("/proc")));
    }

    #[test]
    fn rejects_prefixes_and_strangers() {
        assert!(!mountinfo_contains(SAMPLE, &PathBuf::from("/work")));
        assert!(!mountinfo_contains(SAMPLE, &PathBuf::from("/work/main/etc")));
        assert!(!mountinfo_contains(SAMPLE, &PathBuf::from("/nonexistent")));
    }

    #[test]
    fn missing_target_is_not_mounted() {
        let temp = tempfile::tempdir().unwrap();
        let gone = temp.path().join("never-created");
        assert!(!is_mounted(&gone).unwrap());
    }
}
