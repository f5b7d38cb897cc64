use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{Edge, Level};
use crate::sysfs::SysfsBackend;

const GPIO_ATTRS: [(&str, &str); 3] = [("direction", "in"), ("value", "0"), ("edge", "none")];
const PWM_ATTRS: [(&str, &str); 4] = [
    ("enable", "0"),
    ("polarity", "normal"),
    ("period", "0"),
    ("duty_cycle", "0"),
];

/// In-memory stand-in for the gpio and pwm sysfs classes.
///
/// Export control files work under any directory named `gpio` or
/// `pwmchip<N>` and create the same attribute files the kernel does. Writes
/// the kernel would refuse are refused with the same errno, and readiness
/// handles are eventfds that start out readable, like a freshly opened value
/// file.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    files: FxHashMap<PathBuf, String>,
    exported: FxHashSet<PathBuf>,
    read_only: FxHashSet<PathBuf>,
    writes: Vec<(PathBuf, String)>,
    notifiers: FxHashMap<PathBuf, Vec<EventFd>>,
}

impl MockState {
    fn sibling(&self, path: &Path, name: &str) -> Option<&str> {
        let parent = path.parent()?;
        self.files.get(&parent.join(name)).map(String::as_str)
    }

    fn sibling_u64(&self, path: &Path, name: &str) -> u64 {
        self.sibling(path, name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    fn control(&mut self, path: &Path, value: &str, export: bool) -> io::Result<()> {
        let id: u32 = value.trim().parse().map_err(|_| Errno::EINVAL)?;
        let parent = path.parent().ok_or(Errno::ENOENT)?;
        let class = parent
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(Errno::ENOENT)?;

        let (node, attrs): (PathBuf, &[(&str, &str)]) = if class == "gpio" {
            (parent.join(format!("gpio{id}")), &GPIO_ATTRS[..])
        } else if class.starts_with("pwmchip") {
            (parent.join(format!("pwm{id}")), &PWM_ATTRS[..])
        } else {
            return Err(Errno::ENOENT.into());
        };

        if export {
            if !self.exported.insert(node.clone()) {
                return Err(Errno::EBUSY.into());
            }
            for (name, initial) in attrs {
                self.files.insert(node.join(name), initial.to_string());
            }
        } else {
            if !self.exported.remove(&node) {
                return Err(Errno::EINVAL.into());
            }
            self.files.retain(|p, _| !p.starts_with(&node));
            self.notifiers.retain(|p, _| !p.starts_with(&node));
        }
        Ok(())
    }

    fn attribute(&mut self, path: &Path, value: &str) -> io::Result<()> {
        if !self.files.contains_key(path) {
            return Err(io::ErrorKind::NotFound.into());
        }
        if self.read_only.contains(path) {
            return Err(Errno::EACCES.into());
        }

        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let stored = match name {
            "direction" => match value {
                "in" | "out" => value.to_string(),
                _ => return Err(Errno::EINVAL.into()),
            },
            "value" => {
                if self.sibling(path, "direction") != Some("out") {
                    return Err(Errno::EPERM.into());
                }
                match value.trim().parse::<i64>() {
                    Ok(0) => "0".to_string(),
                    Ok(_) => "1".to_string(),
                    Err(_) => return Err(Errno::EINVAL.into()),
                }
            }
            "edge" => match Edge::from_sysfs_str(value) {
                Some(edge) => edge.as_sysfs_str().to_string(),
                None => return Err(Errno::EINVAL.into()),
            },
            "enable" => match value {
                "0" | "1" => value.to_string(),
                _ => return Err(Errno::EINVAL.into()),
            },
            "polarity" => {
                if self.sibling(path, "enable") == Some("1") {
                    return Err(Errno::EBUSY.into());
                }
                match value {
                    "normal" | "inversed" => value.to_string(),
                    _ => return Err(Errno::EINVAL.into()),
                }
            }
            "period" => {
                let period: u64 = value.parse().map_err(|_| Errno::EINVAL)?;
                if period < self.sibling_u64(path, "duty_cycle") {
                    return Err(Errno::EINVAL.into());
                }
                period.to_string()
            }
            "duty_cycle" => {
                let duty: u64 = value.parse().map_err(|_| Errno::EINVAL)?;
                if duty > self.sibling_u64(path, "period") {
                    return Err(Errno::EINVAL.into());
                }
                duty.to_string()
            }
            _ => value.to_string(),
        };

        self.files.insert(path.to_path_buf(), stored);
        Ok(())
    }

    fn signal(&self, path: &Path) -> usize {
        let Some(handles) = self.notifiers.get(path) else {
            return 0;
        };
        handles.iter().filter(|efd| efd.write(1).is_ok()).count()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current content of an attribute file.
    pub fn attr(&self, path: impl AsRef<Path>) -> Option<String> {
        self.state.lock().files.get(path.as_ref()).cloned()
    }

    /// Every accepted write, in the order it happened.
    pub fn writes(&self) -> Vec<(PathBuf, String)> {
        self.state.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Simulates permissions not yet fixed up after export.
    pub fn set_writable(&self, path: impl AsRef<Path>, writable: bool) {
        let path = path.as_ref().to_path_buf();
        let mut state = self.state.lock();
        if writable {
            state.read_only.remove(&path);
        } else {
            state.read_only.insert(path);
        }
    }

    /// Raises readiness on every open handle of `path` regardless of the
    /// configured edge. Returns how many handles were signalled.
    pub fn signal(&self, path: impl AsRef<Path>) -> usize {
        self.state.lock().signal(path.as_ref())
    }

    /// Drives an input line externally. Readiness is raised only when the
    /// transition matches the pin's `edge` attribute.
    pub fn drive(&self, value_path: impl AsRef<Path>, level: Level) -> bool {
        let path = value_path.as_ref();
        let mut state = self.state.lock();
        let previous = match state.files.get(path).map(|v| v.trim()) {
            Some("0") => Level::Low,
            Some(_) => Level::High,
            None => return false,
        };
        state
            .files
            .insert(path.to_path_buf(), level.as_sysfs_str().to_string());

        let edge = state
            .sibling(path, "edge")
            .and_then(Edge::from_sysfs_str)
            .unwrap_or_default();
        edge.matches(previous, level) && state.signal(path) > 0
    }
}

impl SysfsBackend for MockBackend {
    fn read_attr(&self, path: &Path) -> io::Result<String> {
        self.state
            .lock()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| io::ErrorKind::NotFound.into())
    }

    fn write_attr(&self, path: &Path, value: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        match path.file_name().and_then(|n| n.to_str()) {
            Some("export") => state.control(path, value, true)?,
            Some("unexport") => state.control(path, value, false)?,
            _ => state.attribute(path, value)?,
        }
        state.writes.push((path.to_path_buf(), value.to_string()));
        Ok(())
    }

    fn is_writable(&self, path: &Path) -> bool {
        let state = self.state.lock();
        match path.file_name().and_then(|n| n.to_str()) {
            Some("export") | Some("unexport") => true,
            _ => state.files.contains_key(path) && !state.read_only.contains(path),
        }
    }

    fn open_notifier(&self, path: &Path) -> io::Result<OwnedFd> {
        let mut state = self.state.lock();
        if !state.files.contains_key(path) {
            return Err(io::ErrorKind::NotFound.into());
        }
        let efd = EventFd::from_value_and_flags(1, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        let handle = efd.as_fd().try_clone_to_owned()?;
        state
            .notifiers
            .entry(path.to_path_buf())
            .or_default()
            .push(efd);
        Ok(handle)
    }
}
