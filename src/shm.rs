//! Shared memory segment backends.
//!
//! Four interchangeable ways to obtain a named, sized, shared byte range:
//! POSIX named segments (`shm_open`), System V segments keyed from a
//! filesystem path, plain memory-mapped files, and POSIX segments mapped
//! with huge pages (falling back to regular pages when the kernel refuses).
//! All four expose identical byte-level semantics; the protocol layer never
//! cares which one is underneath.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::BackendKind;
use crate::error::ShmError;

/// Huge-page granularity used to round segment sizes for [`BackendKind::HugePages`].
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// A mapped shared memory segment.
///
/// Creating one truncates the backend to the requested size and maps it
/// read/write; attaching maps whatever size the creator established. The
/// creator removes the backend identifier from the host namespace on drop.
#[derive(Debug)]
pub struct SharedSegment {
    ptr: NonNull<u8>,
    len: usize,
    creator: bool,
    locked: AtomicBool,
    backend: Backend,
}

#[derive(Debug)]
enum Backend {
    /// mmap-based backends (POSIX, file, huge pages) share teardown.
    Mapped { _fd: OwnedFd, unlink: Unlink },
    /// System V segments detach with `shmdt` instead of `munmap`.
    SysV { shmid: i32, key_path: PathBuf },
}

#[derive(Debug)]
enum Unlink {
    PosixName(CString),
    FilePath(PathBuf),
}

// SAFETY: the mapping is plain shared bytes; all cross-thread coordination
// happens through the atomics the protocol layer places inside it.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create (producer) or open (attacher) the named segment.
    ///
    /// On create the backend is truncated to `size` bytes; on attach `size`
    /// is ignored and the existing extent wins. `file_path` overrides the
    /// default backing path for the `File` backend and the key-file path for
    /// `SysV`.
    pub fn create_or_open(
        name: &str,
        size: usize,
        backend: BackendKind,
        create: bool,
        file_path: Option<&Path>,
    ) -> Result<Self, ShmError> {
        match backend {
            BackendKind::Posix => Self::posix(name, size, create, false),
            BackendKind::HugePages => Self::posix(name, size, create, true),
            BackendKind::File => Self::file(name, size, create, file_path),
            BackendKind::SysV => Self::sysv(name, size, create, file_path),
        }
    }

    // =========================================================================
    // POSIX named segment (and the huge-page variant on top of it)
    // =========================================================================

    fn posix(name: &str, size: usize, create: bool, huge: bool) -> Result<Self, ShmError> {
        let backend_name = if huge { "hugepages" } else { "posix" };
        let shm_name = CString::new(format!("/{}", name))
            .map_err(|_| ShmError::InvalidFrame("segment name must not contain NUL"))?;

        let size = if huge {
            size.div_ceil(HUGE_PAGE_SIZE) * HUGE_PAGE_SIZE
        } else {
            size
        };

        let fd = if create {
            let raw = unsafe {
                libc::shm_open(
                    shm_name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    0o600,
                )
            };
            if raw < 0 {
                return Err(classify_create_error(backend_name, io::Error::last_os_error()));
            }
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };
            if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::shm_unlink(shm_name.as_ptr()) };
                return Err(ShmError::CreationFailed {
                    backend: backend_name,
                    source: err,
                });
            }
            fd
        } else {
            let raw = unsafe { libc::shm_open(shm_name.as_ptr(), libc::O_RDWR, 0o600) };
            if raw < 0 {
                return Err(classify_create_error(backend_name, io::Error::last_os_error()));
            }
            unsafe { OwnedFd::from_raw_fd(raw) }
        };

        let len = if create {
            size
        } else {
            fd_size(&fd).map_err(|source| ShmError::CreationFailed {
                backend: backend_name,
                source,
            })?
        };

        let ptr = map_fd(&fd, len, huge).map_err(|source| {
            if create {
                unsafe { libc::shm_unlink(shm_name.as_ptr()) };
            }
            ShmError::CreationFailed {
                backend: backend_name,
                source,
            }
        })?;

        Ok(Self {
            ptr,
            len,
            creator: create,
            locked: AtomicBool::new(false),
            backend: Backend::Mapped {
                _fd: fd,
                unlink: Unlink::PosixName(shm_name),
            },
        })
    }

    // =========================================================================
    // Memory-mapped file
    // =========================================================================

    fn file(
        name: &str,
        size: usize,
        create: bool,
        file_path: Option<&Path>,
    ) -> Result<Self, ShmError> {
        let path = match file_path {
            Some(path) => path.to_path_buf(),
            None => default_file_path(name),
        };

        let file = if create {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
                .map_err(|source| classify_create_error("file", source))?;
            file.set_len(size as u64).map_err(|source| {
                let _ = std::fs::remove_file(&path);
                ShmError::CreationFailed {
                    backend: "file",
                    source,
                }
            })?;
            file
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|source| classify_create_error("file", source))?
        };

        let fd: OwnedFd = file.into();
        let len = if create {
            size
        } else {
            fd_size(&fd).map_err(|source| ShmError::CreationFailed {
                backend: "file",
                source,
            })?
        };

        let ptr = map_fd(&fd, len, false).map_err(|source| {
            if create {
                let _ = std::fs::remove_file(&path);
            }
            ShmError::CreationFailed {
                backend: "file",
                source,
            }
        })?;

        Ok(Self {
            ptr,
            len,
            creator: create,
            locked: AtomicBool::new(false),
            backend: Backend::Mapped {
                _fd: fd,
                unlink: Unlink::FilePath(path),
            },
        })
    }

    // =========================================================================
    // System V segment
    // =========================================================================

    fn sysv(
        name: &str,
        size: usize,
        create: bool,
        file_path: Option<&Path>,
    ) -> Result<Self, ShmError> {
        let key_path = match file_path {
            Some(path) => path.to_path_buf(),
            None => std::env::temp_dir().join(format!("{}.shmkey", name)),
        };

        if create {
            // The key is derived from an inode, so the file must exist first.
            File::create(&key_path).map_err(|source| classify_create_error("sysv", source))?;
        }

        let c_path = CString::new(key_path.as_os_str().as_encoded_bytes())
            .map_err(|_| ShmError::InvalidFrame("key path must not contain NUL"))?;
        let key = unsafe { libc::ftok(c_path.as_ptr(), b'S' as libc::c_int) };
        if key == -1 {
            return Err(classify_create_error("sysv", io::Error::last_os_error()));
        }

        let shmid = if create {
            unsafe {
                libc::shmget(
                    key,
                    size,
                    libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
                )
            }
        } else {
            unsafe { libc::shmget(key, 0, 0o600) }
        };
        if shmid < 0 {
            let err = io::Error::last_os_error();
            if create {
                let _ = std::fs::remove_file(&key_path);
            }
            return Err(classify_create_error("sysv", err));
        }

        let ptr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if ptr == usize::MAX as *mut libc::c_void {
            let err = io::Error::last_os_error();
            if create {
                unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) };
                let _ = std::fs::remove_file(&key_path);
            }
            return Err(ShmError::CreationFailed {
                backend: "sysv",
                source: err,
            });
        }

        let len = if create {
            size
        } else {
            let mut stat: libc::shmid_ds = unsafe { std::mem::zeroed() };
            if unsafe { libc::shmctl(shmid, libc::IPC_STAT, &mut stat) } < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::shmdt(ptr) };
                return Err(ShmError::CreationFailed {
                    backend: "sysv",
                    source: err,
                });
            }
            stat.shm_segsz as usize
        };

        Ok(Self {
            ptr: NonNull::new(ptr as *mut u8).expect("shmat returned null"),
            len,
            creator: create,
            locked: AtomicBool::new(false),
            backend: Backend::SysV { shmid, key_path },
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Base pointer of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a live segment).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this handle created the segment.
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    /// Whether `ptr` points inside this mapping.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.len
    }

    /// Get a slice view of the segment.
    ///
    /// # Safety
    /// Caller must ensure no concurrent writes to the range being read.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Ask the kernel to pin the mapping in physical memory.
    ///
    /// Soft capability: callers are expected to log and continue on failure.
    pub fn lock_in_memory(&self) -> io::Result<()> {
        let rc = unsafe { libc::mlock(self.ptr.as_ptr() as *const libc::c_void, self.len) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        self.locked.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Release a previous [`lock_in_memory`](Self::lock_in_memory) request.
    pub fn unlock_memory(&self) -> io::Result<()> {
        let rc = unsafe { libc::munlock(self.ptr.as_ptr() as *const libc::c_void, self.len) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        self.locked.store(false, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.locked.load(Ordering::Relaxed) {
            unsafe { libc::munlock(self.ptr.as_ptr() as *const libc::c_void, self.len) };
        }
        match &self.backend {
            Backend::Mapped { unlink, .. } => {
                unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
                if self.creator {
                    match unlink {
                        Unlink::PosixName(name) => unsafe {
                            libc::shm_unlink(name.as_ptr());
                        },
                        Unlink::FilePath(path) => {
                            let _ = std::fs::remove_file(path);
                        }
                    }
                }
            }
            Backend::SysV { shmid, key_path } => {
                unsafe { libc::shmdt(self.ptr.as_ptr() as *const libc::c_void) };
                if self.creator {
                    unsafe { libc::shmctl(*shmid, libc::IPC_RMID, std::ptr::null_mut()) };
                    let _ = std::fs::remove_file(key_path);
                }
            }
        }
    }
}

/// Map `len` bytes of `fd` shared read/write, trying huge pages first when
/// asked and falling back to regular pages.
fn map_fd(fd: &OwnedFd, len: usize, huge: bool) -> io::Result<NonNull<u8>> {
    #[cfg(target_os = "linux")]
    if huge {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_HUGETLB,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr != libc::MAP_FAILED {
            return Ok(NonNull::new(ptr as *mut u8).expect("mmap returned null"));
        }
        tracing::debug!(len, "huge-page mapping refused, falling back to regular pages");
    }
    #[cfg(not(target_os = "linux"))]
    let _ = huge;

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(NonNull::new(ptr as *mut u8).expect("mmap returned null"))
}

fn fd_size(fd: &OwnedFd) -> io::Result<usize> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_size as usize)
}

fn default_file_path(name: &str) -> PathBuf {
    // Prefer the RAM-backed filesystem where one exists.
    #[cfg(target_os = "linux")]
    {
        let dev_shm = Path::new("/dev/shm");
        if dev_shm.is_dir() {
            return dev_shm.join(name);
        }
    }
    std::env::temp_dir().join(name)
}

fn classify_create_error(backend: &'static str, source: io::Error) -> ShmError {
    match source.raw_os_error() {
        Some(libc::EEXIST) => ShmError::AlreadyExists,
        Some(libc::EACCES) | Some(libc::EPERM) => ShmError::PermissionDenied(source),
        Some(libc::ENOSYS) => ShmError::NotSupported("backend unavailable on this host"),
        _ if source.kind() == io::ErrorKind::AlreadyExists => ShmError::AlreadyExists,
        _ if source.kind() == io::ErrorKind::PermissionDenied => {
            ShmError::PermissionDenied(source)
        }
        _ => ShmError::CreationFailed { backend, source },
    }
}
