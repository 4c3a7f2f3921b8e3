use std::ffi::OsStr;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite,
    Request as FuseRequest,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use vdisk_core::{Access, Disposition, FileInfo, FileSystemOps, FsError, HandleId};

use crate::inode::{InodeTable, ROOT_INO};
use crate::mapping::{
    BLOCK_SIZE, DIR_PERM, access_from_flags, create_disposition, errno, file_type,
    info_to_fileattr, open_disposition,
};

const TTL: Duration = Duration::from_secs(1);

const NAME_MAX: u32 = 255;

// Linux renameat2 flag; the value is fixed by the kernel ABI.
const RENAME_NOREPLACE: u32 = 1;

/// FUSE adapter over the filesystem verbs.
///
/// The FUSE session calls in on its own thread; each callback blocks on the
/// matching async verb on `runtime`, so this must not run inside that runtime.
pub struct VdiskFs {
    ops: Arc<dyn FileSystemOps>,
    runtime: Handle,
    pub inodes: InodeTable,
    uid: u32,
    gid: u32,
}

impl VdiskFs {
    pub fn new(ops: Arc<dyn FileSystemOps>, runtime: Handle, uid: u32, gid: u32) -> Self {
        Self {
            ops,
            runtime,
            inodes: InodeTable::new(),
            uid,
            gid,
        }
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn root_attr(&self) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: DIR_PERM,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Attributes for `path`, tree entries and pending uploads alike.
    pub fn stat(&mut self, path: &str) -> Result<FileAttr, FsError> {
        if path == "/" {
            return Ok(self.root_attr());
        }
        let info = self.block_on(self.ops.get_file_information(path))?;
        let ino = self.inodes.assign(path);
        Ok(info_to_fileattr(ino, &info, self.uid, self.gid))
    }

    /// Stat `path` for an entry reply, counting the kernel reference.
    pub fn entry(&mut self, path: &str) -> Result<FileAttr, FsError> {
        let attr = self.stat(path)?;
        self.inodes.remember(path);
        Ok(attr)
    }

    /// Directory listing with `.` and `..` first, as `(ino, kind, name)`.
    pub fn list(&mut self, ino: u64) -> Result<Vec<(u64, FileType, String)>, FsError> {
        let path = self.inodes.path(ino).ok_or(FsError::NotFound)?.to_string();
        let children: Vec<FileInfo> = self.block_on(self.ops.find_files(&path))?;

        let parent = match vdisk_core::tree::split_parent(&path) {
            (_, None) => ROOT_INO,
            (dir, Some(_)) => self.inodes.assign(dir),
        };
        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent, FileType::Directory, "..".to_string()),
        ];
        for child in children {
            let child_path = vdisk_core::tree::join_path(&path, &child.name);
            let child_ino = self.inodes.assign(&child_path);
            entries.push((child_ino, file_type(&child), child.name));
        }
        Ok(entries)
    }

    /// Close a handle the kernel will never see.
    pub fn discard(&self, handle: HandleId) {
        if let Err(e) = self.block_on(self.ops.close_file(handle)) {
            warn!(handle = %handle, error = %e, "Close of unused handle failed");
        }
    }

    /// Open `path` through the verb layer, returning the handle number.
    pub fn open_path(
        &mut self,
        path: &str,
        access: Access,
        disposition: Disposition,
        want_directory: bool,
    ) -> Result<u64, libc::c_int> {
        let opened = self
            .block_on(self.ops.create_file(path, access, disposition))
            .map_err(|e| errno(&e))?;
        if opened.is_directory != want_directory {
            self.discard(opened.handle);
            return Err(if want_directory {
                libc::ENOTDIR
            } else {
                libc::EISDIR
            });
        }
        Ok(opened.handle.0)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<String, libc::c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        self.inodes.child_path(parent, name).ok_or(libc::ENOENT)
    }

    fn path_of(&self, ino: u64) -> Result<String, libc::c_int> {
        self.inodes
            .path(ino)
            .map(str::to_string)
            .ok_or(libc::ENOENT)
    }
}

impl Filesystem for VdiskFs {
    fn init(
        &mut self,
        _req: &FuseRequest<'_>,
        _config: &mut KernelConfig,
    ) -> Result<(), libc::c_int> {
        info!("vdisk mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("vdisk unmounting, waiting for deferred uploads");
        self.block_on(self.ops.shutdown());
    }

    fn lookup(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        debug!("lookup: {path}");
        match self.entry(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn forget(&mut self, _req: &FuseRequest<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        match self.stat(&path) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr: ino={ino} size={size:?} fh={fh:?}");

        // A zero-length truncate on a fresh upload is the O_TRUNC that opened
        // it, not the final size; only a real length is declared.
        if let (Some(length), Some(fh)) = (size, fh) {
            if length > 0 {
                if let Err(e) = self.block_on(self.ops.set_end_of_file(HandleId(fh), length)) {
                    return reply.error(errno(&e));
                }
            }
        }

        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        match self.stat(&path) {
            Ok(mut attr) => {
                if let Some(length) = size {
                    attr.size = length;
                    attr.blocks = length.div_ceil(BLOCK_SIZE as u64);
                }
                reply.attr(&TTL, &attr)
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir: ino={ino} offset={offset}");
        let entries = match self.list(ino) {
            Ok(entries) => entries,
            Err(e) => return reply.error(errno(&e)),
        };

        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset.max(0) as usize)
        {
            // Buffer full
            if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &FuseRequest<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        match self.open_path(&path, Access::Read, Disposition::OpenExisting, true) {
            Ok(fh) => reply.opened(fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn releasedir(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        match self.block_on(self.ops.close_file(HandleId(fh))) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn open(&mut self, _req: &FuseRequest<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        debug!("open: {path} flags={flags:#o}");
        match self.open_path(&path, access_from_flags(flags), open_disposition(flags), false) {
            Ok(fh) => reply.opened(fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read: ino={ino} fh={fh} offset={offset} size={size}");
        let mut buf = vec![0u8; size as usize];
        let read = self.block_on(
            self.ops
                .read_file(HandleId(fh), &mut buf, offset.max(0) as u64),
        );
        match read {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write: ino={ino} fh={fh} offset={offset} len={}", data.len());
        match self.block_on(self.ops.write_file(HandleId(fh), data, offset.max(0) as u64)) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &FuseRequest<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        debug!("create: {path} flags={flags:#o}");

        let fh = match self.open_path(&path, access_from_flags(flags), create_disposition(flags), false)
        {
            Ok(fh) => fh,
            Err(code) => return reply.error(code),
        };
        match self.entry(&path) {
            Ok(attr) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => {
                warn!(path = %path, error = %e, "Created file has no attributes");
                self.discard(HandleId(fh));
                reply.error(errno(&e))
            }
        }
    }

    fn flush(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // Uploads complete on release, once the whole stream is known.
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release: ino={ino} fh={fh}");
        match self.block_on(self.ops.close_file(HandleId(fh))) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &FuseRequest<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        if let Err(e) = self.block_on(self.ops.create_directory(&path)) {
            return reply.error(errno(&e));
        }
        match self.entry(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        match self.block_on(self.ops.delete_file(&path)) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok()
            }
            Err(FsError::AccessDenied) => reply.error(libc::EISDIR),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child(parent, name) {
            Ok(path) => path,
            Err(code) => return reply.error(code),
        };
        match self.block_on(self.ops.delete_directory(&path)) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok()
            }
            Err(FsError::AccessDenied) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &FuseRequest<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (from, to) = match (self.child(parent, name), self.child(newparent, newname)) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(code), _) | (_, Err(code)) => return reply.error(code),
        };
        let replace = flags & RENAME_NOREPLACE == 0;
        debug!("rename: {from} -> {to} replace={replace}");

        match self.block_on(self.ops.move_file(&from, &to, replace)) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok()
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn statfs(&mut self, _req: &FuseRequest<'_>, _ino: u64, reply: ReplyStatfs) {
        let space = self.ops.disk_free_space();
        let block = BLOCK_SIZE as u64;
        reply.statfs(
            space.total / block,
            space.free / block,
            space.free / block,
            0,
            0,
            BLOCK_SIZE,
            NAME_MAX,
            BLOCK_SIZE,
        );
    }

    fn access(&mut self, _req: &FuseRequest<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        // Permissions are reported through getattr only.
        if self.inodes.path(ino).is_some() {
            reply.ok();
        } else {
            reply.error(libc::ENOENT);
        }
    }
}
