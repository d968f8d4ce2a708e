use crate::model::CloneStrategy;

/// Filesystem types the appliance knows how to recreate on the
/// destination. Anything else is copied byte-for-byte.
const FILESYSTEM_AWARE_TYPES: &[&str] = &["ext4", "vfat", "fat32", "ntfs", "exfat"];

/// Maps a probed filesystem type onto a clone strategy.
///
/// A filesystem-aware copy (fresh filesystem plus content-level copy) is
/// faster and leaves no source slack or fragmentation behind, but is only
/// safe for formats we can recreate. Everything else, including "unknown",
/// falls back to a raw block copy.
pub fn select_strategy(fs_type: &str) -> CloneStrategy {
    let normalized = fs_type.trim().to_ascii_lowercase();
    if FILESYSTEM_AWARE_TYPES.contains(&normalized.as_str()) {
        CloneStrategy::FilesystemAware
    } else {
        CloneStrategy::RawBlockCopy
    }
}

/// mkfs invocation for a filesystem-aware clone target. Returns `None` for
/// types outside the known set; callers treat that as a raw-copy fallback.
pub fn mkfs_argv(fs_type: &str, target: &str) -> Option<Vec<String>> {
    let argv: &[&str] = match fs_type.trim().to_ascii_lowercase().as_str() {
        "ext4" => &["mkfs.ext4", "-F"],
        "vfat" | "fat32" => &["mkfs.vfat", "-F", "32"],
        "ntfs" => &["mkfs.ntfs", "-F"],
        "exfat" => &["mkfs.exfat"],
        _ => return None,
    };
    let mut argv = argv.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    argv.push(target.to_string());
    Some(argv)
}
