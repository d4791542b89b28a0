//! The virtual filesystem: a read-only two-level tree over the runtime index,
//! backed by `fuser`.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, Request,
};
use libc::{EIO, ENOENT};

use crate::index::RuntimeIndex;

pub const META_FILE_NAME: &str = ".para";
const ROOT_INO: u64 = 1;
const META_INO: u64 = 2;
const FIRST_DYNAMIC_INO: u64 = 3;
const TTL: Duration = Duration::from_secs(1);

enum Node {
    Dir(String),
    File(String, String),
}

/// `fuser::Filesystem` adapter over a [`RuntimeIndex`]. Inodes for platform
/// directories and plugin files are assigned lazily on first lookup/readdir
/// and kept stable for the life of the mount.
pub struct ParaFilesystem {
    host_tool: String,
    index: Arc<RuntimeIndex>,
    pid: u32,
    inodes: HashMap<u64, Node>,
    platform_inodes: HashMap<String, u64>,
    file_inodes: HashMap<(String, String), u64>,
    next_ino: u64,
}

impl ParaFilesystem {
    pub fn new(index: Arc<RuntimeIndex>, host_tool: String) -> Self {
        Self {
            host_tool,
            index,
            pid: std::process::id(),
            inodes: HashMap::new(),
            platform_inodes: HashMap::new(),
            file_inodes: HashMap::new(),
            next_ino: FIRST_DYNAMIC_INO,
        }
    }

    fn alloc_ino(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn dir_ino(&mut self, platform: &str) -> u64 {
        if let Some(&ino) = self.platform_inodes.get(platform) {
            return ino;
        }
        let ino = self.alloc_ino();
        self.platform_inodes.insert(platform.to_owned(), ino);
        self.inodes.insert(ino, Node::Dir(platform.to_owned()));
        ino
    }

    fn file_ino(&mut self, platform: &str, filename: &str) -> u64 {
        let key = (platform.to_owned(), filename.to_owned());
        if let Some(&ino) = self.file_inodes.get(&key) {
            return ino;
        }
        let ino = self.alloc_ino();
        self.file_inodes.insert(key.clone(), ino);
        self.inodes.insert(ino, Node::File(key.0, key.1));
        ino
    }

    fn meta_content(&self) -> String {
        format!("{}\n", self.pid)
    }

    fn dir_attr(ino: u64) -> FileAttr {
        attr(ino, 0, FileType::Directory, 0o555, 2)
    }

    fn file_attr(ino: u64, size: u64) -> FileAttr {
        attr(ino, size, FileType::RegularFile, 0o555, 1)
    }

    fn meta_attr(&self, ino: u64) -> FileAttr {
        attr(ino, self.meta_content().len() as u64, FileType::RegularFile, 0o444, 1)
    }
}

fn attr(ino: u64, size: u64, kind: FileType, perm: u16, nlink: u32) -> FileAttr {
    let now = SystemTime::now();
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind,
        perm,
        nlink,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

impl Filesystem for ParaFilesystem {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };

        if parent == ROOT_INO {
            if name == META_FILE_NAME {
                reply.entry(&TTL, &self.meta_attr(META_INO), 0);
                return;
            }
            let ino = self.dir_ino(name);
            reply.entry(&TTL, &Self::dir_attr(ino), 0);
            return;
        }

        let Some(Node::Dir(platform)) = self.inodes.get(&parent) else {
            reply.error(ENOENT);
            return;
        };
        let platform = platform.clone();

        match self.index.lookup(&platform, name) {
            Some(descriptor) => {
                let size = descriptor.size;
                let ino = self.file_ino(&platform, name);
                reply.entry(&TTL, &Self::file_attr(ino, size), 0);
            }
            None => reply.error(ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&TTL, &Self::dir_attr(ROOT_INO));
            return;
        }
        if ino == META_INO {
            reply.attr(&TTL, &self.meta_attr(META_INO));
            return;
        }

        match self.inodes.get(&ino) {
            Some(Node::Dir(_)) => reply.attr(&TTL, &Self::dir_attr(ino)),
            Some(Node::File(platform, filename)) => {
                match self.index.lookup(platform, filename) {
                    Some(descriptor) => reply.attr(&TTL, &Self::file_attr(ino, descriptor.size)),
                    None => reply.error(ENOENT),
                }
            }
            None => reply.error(ENOENT),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let mut entries: Vec<(u64, FileType, String)> = Vec::new();

        if ino == ROOT_INO {
            let mut platforms = self.index.list_platforms();
            platforms.sort();
            for platform in platforms {
                let dir_ino = self.dir_ino(&platform);
                entries.push((dir_ino, FileType::Directory, platform));
            }
            entries.push((META_INO, FileType::RegularFile, META_FILE_NAME.to_owned()));
        } else {
            let Some(Node::Dir(platform)) = self.inodes.get(&ino) else {
                reply.error(ENOENT);
                return;
            };
            let platform = platform.clone();
            let mut filenames = self.index.list_plugins(&platform);
            filenames.sort();
            for filename in filenames {
                let file_ino = self.file_ino(&platform, &filename);
                entries.push((file_ino, FileType::RegularFile, filename));
            }
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(Node::File(platform, filename)) = self.inodes.get(&ino) else {
            reply.error(ENOENT);
            return;
        };

        let Some(descriptor) = self.index.lookup(platform, filename).cloned() else {
            reply.error(ENOENT);
            return;
        };

        match self.index.open(&descriptor) {
            Ok(()) => reply.opened(ino, 0),
            Err(_) => reply.error(EIO),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if ino == META_INO {
            let content = self.meta_content();
            let bytes = content.as_bytes();
            let start = (offset as usize).min(bytes.len());
            let end = (start + size as usize).min(bytes.len());
            reply.data(&bytes[start..end]);
            return;
        }

        let Some(Node::File(platform, filename)) = self.inodes.get(&ino) else {
            reply.error(ENOENT);
            return;
        };

        let Some(descriptor) = self.index.lookup(platform, filename).cloned() else {
            reply.error(ENOENT);
            return;
        };

        match self.index.read_at(&descriptor, offset as u64, size) {
            Ok(bytes) => reply.data(&bytes),
            Err(_) => reply.error(EIO),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(Node::File(platform, filename)) = self.inodes.get(&ino) {
            if let Some(descriptor) = self.index.lookup(platform, filename).cloned() {
                self.index.close(&descriptor);
            }
        }
        reply.ok();
    }
}

/// Mount options for a read-only, single-user overlay identifying itself to
/// the host tool by name.
pub fn mount_options(host_tool: &str) -> Vec<MountOption> {
    vec![
        MountOption::RO,
        MountOption::FSName(format!("{host_tool}-plugins")),
        MountOption::Subtype("para".to_owned()),
    ]
}

/// Spawn the filesystem on a background thread; dropping the returned
/// session unmounts it.
pub fn spawn(
    index: Arc<RuntimeIndex>,
    host_tool: String,
    mount_point: &Path,
) -> std::io::Result<fuser::BackgroundSession> {
    let options = mount_options(&host_tool);
    let fs = ParaFilesystem::new(index, host_tool);
    fuser::spawn_mount2(fs, mount_point, &options)
}
