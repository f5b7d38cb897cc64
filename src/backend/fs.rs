use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::path::Path;

use nix::unistd::{AccessFlags, access};

use crate::sysfs::SysfsBackend;

/// Talks to the real filesystem. Every call opens and closes its file.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsBackend;

impl FsBackend {
    pub fn new() -> Self {
        Self
    }
}

impl SysfsBackend for FsBackend {
    fn read_attr(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn write_attr(&self, path: &Path, value: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
        file.write_all(value.as_bytes())
    }

    fn is_writable(&self, path: &Path) -> bool {
        access(path, AccessFlags::W_OK).is_ok()
    }

    fn open_notifier(&self, path: &Path) -> io::Result<OwnedFd> {
        File::open(path).map(OwnedFd::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_replace_previous_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("direction");
        fs::write(&path, "out").expect("seed");

        FsBackend.write_attr(&path, "in").expect("write");
        assert_eq!(FsBackend.read_attr(&path).expect("read"), "in");
        assert!(FsBackend.is_writable(&path));
    }

    #[test]
    fn missing_attribute_is_not_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("value");

        let err = FsBackend.write_attr(&path, "1").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!path.exists());
        assert!(!FsBackend.is_writable(&path));
    }
}
