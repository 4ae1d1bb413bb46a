//! Device-colon namespace.
//!
//! Paths name a device or volume before the colon: `con:` is the console,
//! `sd0raw:` the raw swap partition, and `emu0:hello` a file on the RAM
//! volume. A path without a colon is resolved against the caller's
//! current directory, which is a volume prefix such as `emu0:`.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

use pion_core::sync::SleepLock;
use pion_core::thread::Thread;
use pion_core::{KernelError, Result};

use crate::file::{AccessMode, OpenFlags};
use crate::memfile::MemFile;
use crate::vnode::Vnode;

struct Volume {
    files: BTreeMap<String, Arc<MemFile>>,
}

/// The mount namespace: devices and RAM volumes.
pub struct Vfs {
    devices: SleepLock<BTreeMap<String, Arc<dyn Vnode>>>,
    volumes: SleepLock<BTreeMap<String, Volume>>,
}

/// A parsed path: the part before the colon and the remainder.
struct SplitPath<'a> {
    prefix: &'a str,
    rest: &'a str,
}

fn split(path: &str) -> Option<SplitPath<'_>> {
    let colon = path.find(':')?;
    Some(SplitPath {
        prefix: &path[..colon],
        rest: &path[colon + 1..],
    })
}

impl Vfs {
    /// Creates an empty namespace.
    pub fn new() -> Self {
        Self {
            devices: SleepLock::new(BTreeMap::new()),
            volumes: SleepLock::new(BTreeMap::new()),
        }
    }

    /// Registers a device under `name` (reachable as `name:`).
    pub fn mount_device(&self, td: &Thread, name: &str, vnode: Arc<dyn Vnode>) {
        self.devices.acquire(td).insert(name.to_string(), vnode);
    }

    /// Creates an empty RAM volume under `name`.
    pub fn mount_volume(&self, td: &Thread, name: &str) {
        self.volumes.acquire(td).insert(
            name.to_string(),
            Volume {
                files: BTreeMap::new(),
            },
        );
    }

    /// Makes `path` absolute with respect to `cwd`.
    fn absolutize(path: &str, cwd: &str) -> String {
        if path.contains(':') {
            path.to_string()
        } else {
            format!("{cwd}{path}")
        }
    }

    /// Resolves an existing object. Does not create.
    pub fn resolve(&self, td: &Thread, path: &str, cwd: &str) -> Result<Arc<dyn Vnode>> {
        let abs = Self::absolutize(path, cwd);
        let parsed = split(&abs).ok_or(KernelError::NoSuchFile)?;

        if parsed.rest.is_empty() {
            let devices = self.devices.acquire(td);
            return devices
                .get(parsed.prefix)
                .cloned()
                .ok_or(KernelError::NoSuchFile);
        }

        let volumes = self.volumes.acquire(td);
        let volume = volumes.get(parsed.prefix).ok_or(KernelError::NoSuchFile)?;
        volume
            .files
            .get(parsed.rest)
            .map(|f| Arc::clone(f) as Arc<dyn Vnode>)
            .ok_or(KernelError::NoSuchFile)
    }

    /// Opens `path`, honoring `CREATE`/`EXCL`/`TRUNC` for volume files.
    /// Devices are returned as-is (creation flags do not apply to them).
    pub fn open(
        &self,
        td: &Thread,
        path: &str,
        cwd: &str,
        _mode: AccessMode,
        flags: OpenFlags,
    ) -> Result<Arc<dyn Vnode>> {
        let abs = Self::absolutize(path, cwd);
        let parsed = split(&abs).ok_or(KernelError::NoSuchFile)?;

        if parsed.rest.is_empty() {
            let devices = self.devices.acquire(td);
            return devices
                .get(parsed.prefix)
                .cloned()
                .ok_or(KernelError::NoSuchFile);
        }

        let file = {
            let mut volumes = self.volumes.acquire(td);
            let volume = volumes
                .get_mut(parsed.prefix)
                .ok_or(KernelError::NoSuchFile)?;
            match volume.files.get(parsed.rest) {
                Some(existing) => {
                    if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
                        return Err(KernelError::Exists);
                    }
                    Arc::clone(existing)
                }
                None => {
                    if !flags.contains(OpenFlags::CREATE) {
                        return Err(KernelError::NoSuchFile);
                    }
                    log::trace!("vfs: create {abs}");
                    let fresh = MemFile::new();
                    volume
                        .files
                        .insert(parsed.rest.to_string(), Arc::clone(&fresh));
                    fresh
                }
            }
        };

        if flags.contains(OpenFlags::TRUNC) {
            file.truncate(td);
        }
        Ok(file as Arc<dyn Vnode>)
    }

    /// Removes a volume file. Devices cannot be removed.
    pub fn remove(&self, td: &Thread, path: &str, cwd: &str) -> Result<()> {
        let abs = Self::absolutize(path, cwd);
        let parsed = split(&abs).ok_or(KernelError::NoSuchFile)?;
        if parsed.rest.is_empty() {
            return Err(KernelError::Invalid);
        }
        let mut volumes = self.volumes.acquire(td);
        let volume = volumes
            .get_mut(parsed.prefix)
            .ok_or(KernelError::NoSuchFile)?;
        volume
            .files
            .remove(parsed.rest)
            .map(|_| ())
            .ok_or(KernelError::NoSuchFile)
    }

    /// Validates a directory path for `chdir` and returns its normalized
    /// form (`volume:`). Only volume roots are directories here.
    pub fn normalize_dir(&self, td: &Thread, path: &str, cwd: &str) -> Result<String> {
        let abs = Self::absolutize(path, cwd);
        let parsed = split(&abs).ok_or(KernelError::NoSuchFile)?;
        if !parsed.rest.is_empty() {
            return Err(KernelError::NoSuchFile);
        }
        let volumes = self.volumes.acquire(td);
        if volumes.contains_key(parsed.prefix) {
            Ok(format!("{}:", parsed.prefix))
        } else {
            Err(KernelError::NoSuchFile)
        }
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}
