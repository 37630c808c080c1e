// Copyright (c) 2022 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt::Debug;
use std::fs::File;
use std::mem::ManuallyDrop;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use nix::unistd::gettid;

use crate::{Error, Result};

/// The namespace capability consumed by [`NetworkNamespace`].
///
/// All operations act on the calling OS thread.
///
/// [`NetworkNamespace`]: crate::NetworkNamespace
pub trait NamespaceOps: Send + Sync {
    /// An open reference to a network namespace.
    type Handle: AsRawFd + Send + Debug;

    /// Returns a handle to the namespace the current thread is in.
    fn get(&self) -> Result<Self::Handle>;

    /// Moves the current thread into `handle`.
    fn set(&self, handle: &Self::Handle) -> Result<()>;

    /// Creates a persistent namespace called `name`. The current thread is
    /// left inside the new namespace.
    fn new_named(&self, name: &str) -> Result<Self::Handle>;

    /// Removes the persistent namespace called `name`.
    fn delete_named(&self, name: &str) -> Result<()>;

    /// Closes `handle`, reporting failures instead of swallowing them.
    fn close(&self, handle: Self::Handle) -> Result<()>;
}

/// Defines a NetNs environment behavior.
pub trait Env {
    /// The persist dir of the NetNs environment.
    fn persist_dir(&self) -> PathBuf;

    /// Returns `true` if the given path is in this Env.
    fn contains<P: AsRef<Path>>(&self, p: P) -> bool {
        p.as_ref().starts_with(self.persist_dir())
    }

    /// Initialize the environment.
    fn init(&self) -> Result<()> {
        // The persist dir needs to be a shared mountpoint in case it is
        // mounted in to other namespaces (containers).
        let persist_dir = self.persist_dir();
        std::fs::create_dir_all(&persist_dir).map_err(Error::CreateNsDirError)?;

        // Remounting shared fails if the dir is not a mountpoint yet, so
        // bind-mount it on to itself first.
        let mut made_netns_persist_dir_mount: bool = false;
        while let Err(e) = mount(
            Some(""),
            &persist_dir,
            Some("none"),
            MsFlags::MS_SHARED | MsFlags::MS_REC,
            Some(""),
        ) {
            if e != nix::errno::Errno::EINVAL || made_netns_persist_dir_mount {
                return Err(Error::MountError(
                    format!("--make-rshared {}", persist_dir.display()),
                    e,
                ));
            }
            // Recursive so that existing netns bindmounts are carried over.
            mount(
                Some(&persist_dir),
                &persist_dir,
                Some("none"),
                MsFlags::MS_BIND | MsFlags::MS_REC,
                Some(""),
            )
            .map_err(|e| {
                Error::MountError(
                    format!(
                        "-rbind {} to {}",
                        persist_dir.display(),
                        persist_dir.display()
                    ),
                    e,
                )
            })?;
            made_netns_persist_dir_mount = true;
        }

        Ok(())
    }
}

/// A default network namespace environment. Its persistence directory is `/var/run/netns`,
/// which is for consistency with the `ip-netns` tool.
/// See [ip-netns](https://man7.org/linux/man-pages/man8/ip-netns.8.html) for details.
#[derive(Copy, Clone, Default, Debug)]
pub struct DefaultEnv;

impl Env for DefaultEnv {
    fn persist_dir(&self) -> PathBuf {
        PathBuf::from("/var/run/netns")
    }
}

/// An open network namespace file, either a bind mount in an [`Env`] or a
/// thread's `/proc` entry.
#[derive(Debug)]
pub struct NsHandle {
    file: ManuallyDrop<File>,
    path: PathBuf,
    file_dropped: bool,
}

impl std::fmt::Display for NsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Ok(meta) = self.file.metadata() {
            write!(
                f,
                "NetNS {{ fd: {}, dev: {}, ino: {}, path: {} }}",
                self.file.as_raw_fd(),
                meta.dev(),
                meta.ino(),
                self.path.display()
            )
        } else {
            write!(
                f,
                "NetNS {{ fd: {}, path: {} }}",
                self.file.as_raw_fd(),
                self.path.display()
            )
        }
    }
}

impl PartialEq for NsHandle {
    fn eq(&self, other: &NsHandle) -> bool {
        if self.file.as_raw_fd() == other.file.as_raw_fd() {
            return true;
        }
        match (self.file.metadata(), other.file.metadata()) {
            (Ok(m1), Ok(m2)) => m1.dev() == m2.dev() && m1.ino() == m2.ino(),
            _ => self.path == other.path,
        }
    }
}

impl AsRawFd for NsHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Drop for NsHandle {
    fn drop(&mut self) {
        if !self.file_dropped {
            unsafe { ManuallyDrop::drop(&mut self.file) };
        }
    }
}

impl NsHandle {
    /// Opens the namespace file at `ns_path`.
    pub fn open<P: AsRef<Path>>(ns_path: P) -> Result<Self> {
        let ns_path = ns_path.as_ref().to_path_buf();
        let file = File::open(&ns_path).map_err(|e| Error::OpenNsError(ns_path.clone(), e))?;
        Ok(Self {
            file: ManuallyDrop::new(file),
            path: ns_path,
            file_dropped: false,
        })
    }

    /// Gets the path this handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the descriptor explicitly so the error is not lost on drop.
    pub fn close(mut self) -> Result<()> {
        self.file_dropped = true;
        nix::unistd::close(self.file.as_raw_fd()).map_err(Error::CloseNsError)
    }
}

/// The kernel implementation of [`NamespaceOps`]. Named namespaces are
/// persisted as bind mounts under the persist dir of `E`.
#[derive(Copy, Clone, Default, Debug)]
pub struct Netns<E: Env = DefaultEnv> {
    env: E,
}

impl<E: Env> Netns<E> {
    pub fn with_env(env: E) -> Self {
        Self { env }
    }

    /// Gets the Env of this adapter.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Returns the mount point used for the namespace called `ns_name`.
    pub fn path_of<S: AsRef<str>>(&self, ns_name: S) -> PathBuf {
        self.env.persist_dir().join(ns_name.as_ref())
    }

    fn persistent<P: AsRef<Path>>(ns_path: &P) -> Result<()> {
        // Create a new netns on the current thread.
        unshare(CloneFlags::CLONE_NEWNET).map_err(Error::UnshareError)?;
        // bind mount the netns from the current thread (from /proc) onto the
        // mount point. This causes the namespace to persist, even when there
        // are no threads in the ns.
        let src = get_current_thread_netns_path();
        mount(
            Some(src.as_path()),
            ns_path.as_ref(),
            Some("none"),
            MsFlags::MS_BIND,
            Some(""),
        )
        .map_err(|e| {
            Error::MountError(
                format!("-rbind {} to {}", src.display(), ns_path.as_ref().display()),
                e,
            )
        })
    }
}

impl<E: Env + Send + Sync> NamespaceOps for Netns<E> {
    type Handle = NsHandle;

    fn get(&self) -> Result<NsHandle> {
        get_from_current_thread()
    }

    fn set(&self, handle: &NsHandle) -> Result<()> {
        setns(handle.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(Error::SetnsError)
    }

    fn new_named(&self, name: &str) -> Result<NsHandle> {
        self.env.init()?;

        // create an empty file at the mount point
        let ns_path = self.path_of(name);
        let _ = File::create(&ns_path).map_err(Error::CreateNsError)?;
        Self::persistent(&ns_path).map_err(|e| {
            // Ensure the mount point is cleaned up on errors; if the namespace
            // was successfully mounted this will have no effect because the file
            // is in-use
            std::fs::remove_file(&ns_path).ok();
            e
        })?;
        NsHandle::open(&ns_path)
    }

    fn delete_named(&self, name: &str) -> Result<()> {
        let ns_path = self.path_of(name);
        // Only unmount if it's been bind-mounted (don't touch namespaces in /proc...)
        if self.env.contains(&ns_path) {
            umount2(&ns_path, MntFlags::MNT_DETACH)
                .map_err(|e| Error::UnmountError(ns_path.clone(), e))?;
            std::fs::remove_file(&ns_path).map_err(|e| Error::RemoveNsError(ns_path, e))?;
        }
        Ok(())
    }

    fn close(&self, handle: NsHandle) -> Result<()> {
        handle.close()
    }
}

/// Returns the namespace handle of the current thread.
pub fn get_from_current_thread() -> Result<NsHandle> {
    NsHandle::open(get_current_thread_netns_path())
}

#[inline]
fn get_current_thread_netns_path() -> PathBuf {
    PathBuf::from(format!("/proc/self/task/{}/ns/net", gettid()))
}
