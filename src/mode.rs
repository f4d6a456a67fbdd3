//! Mode bits and process-wide defaults.

use once_cell::sync::Lazy;
use rustix::{
    fs::{FileType, Mode},
    process::{getgid, getuid, umask},
};

/// Permission, setuid/setgid and sticky bits: everything a tar header carries in its mode field.
pub const PERMISSION_BITS: u32 = 0o7777;

/// Default mode for file-type records that carry none.
pub const DEFAULT_FILE_MODE: u32 = 0o666;

/// Default mode for directory-type records that carry none.
pub const DEFAULT_DIR_MODE: u32 = 0o777;

// umask() can only be read by setting it, so do that exactly once per process.
static PROCESS_UMASK: Lazy<u32> = Lazy::new(|| {
    let mask = umask(Mode::empty());
    umask(mask);
    mask.bits() as u32
});

/// The umask of the current process.
pub fn process_umask() -> u32 {
    *PROCESS_UMASK
}

/// The real user id of the current process.
pub fn process_uid() -> u64 {
    getuid().as_raw().into()
}

/// The real group id of the current process.
pub fn process_gid() -> u64 {
    getgid().as_raw().into()
}

/// Replaces the file type bits of `mode` with those of `file_type`, keeping the permissions.
pub fn with_file_type(mode: u32, file_type: FileType) -> u32 {
    (mode & PERMISSION_BITS) | file_type.as_raw_mode() as u32
}

/// Returns the file type encoded in `mode`, or `None` if no type bits are set.
pub fn file_type(mode: u32) -> Option<FileType> {
    match FileType::from_raw_mode(mode as _) {
        FileType::Unknown => None,
        file_type => Some(file_type),
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn type_bits() {
        assert_eq!(with_file_type(0o644, FileType::RegularFile), 0o100644);
        assert_eq!(with_file_type(0o40755, FileType::Directory), 0o40755);
        assert_eq!(with_file_type(0o100777, FileType::Symlink), 0o120777);

        assert_eq!(file_type(0o644), None);
        assert_eq!(file_type(0o100644), Some(FileType::RegularFile));
        assert_eq!(file_type(0o40755), Some(FileType::Directory));
        assert_eq!(file_type(0o120777), Some(FileType::Symlink));
        assert_eq!(file_type(0o10644), Some(FileType::Fifo));
    }

    #[test]
    fn umask_is_stable() {
        let first = process_umask();
        assert_eq!(process_umask(), first);
        assert_eq!(first & !0o777, 0);
    }
}
