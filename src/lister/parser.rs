//! Parser for `unsquashfs -l` output

/// Root directory name unsquashfs prints in listings
const LISTING_ROOT: &str = "squashfs-root";

/// Count the entries in `unsquashfs -l` output
///
/// Every listed path is prefixed with `squashfs-root`. The root line itself,
/// banner lines ("Parallel unsquashfs: ...", inode summaries), and blank
/// lines are not counted.
pub fn count_listed_entries(stdout: &[u8]) -> u64 {
    let output = String::from_utf8_lossy(stdout);
    let prefix = format!("{}/", LISTING_ROOT);

    output
        .lines()
        .filter(|line| line.starts_with(&prefix) && line.len() > prefix.len())
        .count() as u64
}
