use std::time::SystemTime;

use fuser::{FileAttr, FileType};
use vdisk_core::{Access, Disposition, FileInfo, FsError};

pub const FILE_PERM: u16 = 0o644;
pub const DIR_PERM: u16 = 0o755;
pub const BLOCK_SIZE: u32 = 512;

/// Build FileAttr for a tree entry or pending upload.
pub fn info_to_fileattr(ino: u64, info: &FileInfo, uid: u32, gid: u32) -> FileAttr {
    let time = SystemTime::from(info.modified);
    let (kind, perm, size, nlink) = if info.is_directory {
        (FileType::Directory, DIR_PERM, 0, 2)
    } else {
        (FileType::RegularFile, FILE_PERM, info.size, 1)
    };
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(BLOCK_SIZE as u64),
        atime: time,
        mtime: time,
        ctime: time,
        crtime: time,
        kind,
        perm,
        nlink,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

pub fn file_type(info: &FileInfo) -> FileType {
    if info.is_directory {
        FileType::Directory
    } else {
        FileType::RegularFile
    }
}

/// Kernel errno for a failed verb.
pub fn errno(err: &FsError) -> libc::c_int {
    match err {
        FsError::NotFound | FsError::PathNotFound => libc::ENOENT,
        FsError::AlreadyExists => libc::EEXIST,
        FsError::InvalidName => libc::EINVAL,
        FsError::AccessDenied => libc::EACCES,
        FsError::DirectoryNotEmpty => libc::ENOTEMPTY,
        FsError::InvalidHandle => libc::EBADF,
        FsError::Pending => libc::EAGAIN,
        FsError::Transport(_) => libc::EIO,
    }
}

pub fn access_from_flags(flags: i32) -> Access {
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => Access::Write,
        libc::O_RDWR => Access::ReadWrite,
        _ => Access::Read,
    }
}

/// Disposition for `open(2)` on an existing entry.
pub fn open_disposition(flags: i32) -> Disposition {
    if flags & libc::O_TRUNC != 0 {
        Disposition::CreateAlways
    } else {
        Disposition::OpenExisting
    }
}

/// Disposition for `open(2)` with `O_CREAT`.
pub fn create_disposition(flags: i32) -> Disposition {
    if flags & libc::O_EXCL != 0 {
        Disposition::CreateNew
    } else if flags & libc::O_TRUNC != 0 {
        Disposition::CreateAlways
    } else {
        Disposition::OpenOrCreate
    }
}
