//! Shared fixtures: a RAM-backed NOR flash, a probe asserting that
//! block-device calls never overlap, and a reference engine that keeps
//! its tree in memory but stores file payloads through the block device.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use norfs::{
    BlockDevice, BlockIndex, Engine, EntryType, Error, Geometry, LockHooks, Metadata, NAME_MAX,
    OpenFlags, Result, Whence,
};

pub const PAGE: u32 = 256;
pub const SECTOR: u32 = 4096;

/// RAM-backed NOR flash. Erase fills a sector with 0xFF; programming
/// clears bits, so a missing erase corrupts data just as it would on the
/// real part.
pub struct MemFlash {
    mem: Vec<u8>,
}

impl MemFlash {
    pub fn new(sectors: usize) -> Self {
        Self {
            mem: vec![0xFF; sectors * SECTOR as usize],
        }
    }
}

#[derive(Debug)]
pub struct MemFlashError;

impl NorFlashError for MemFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for MemFlash {
    type Error = MemFlashError;
}

impl ReadNorFlash for MemFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> std::result::Result<(), Self::Error> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.mem.len() {
            return Err(MemFlashError);
        }
        bytes.copy_from_slice(&self.mem[start..end]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl NorFlash for MemFlash {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = SECTOR as usize;

    fn erase(&mut self, from: u32, to: u32) -> std::result::Result<(), Self::Error> {
        if to as usize > self.mem.len() || from % SECTOR != 0 || to % SECTOR != 0 {
            return Err(MemFlashError);
        }
        self.mem[from as usize..to as usize].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> std::result::Result<(), Self::Error> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.mem.len() {
            return Err(MemFlashError);
        }
        for (cell, byte) in self.mem[start..end].iter_mut().zip(bytes) {
            *cell &= byte;
        }
        Ok(())
    }
}

/// Decorator asserting that no two block-device calls ever execute
/// concurrently. The yield while busy widens the race window so missing
/// serialization fails loudly rather than flakily.
pub struct SerialProbe<D> {
    inner: D,
    busy: AtomicBool,
}

impl<D> SerialProbe<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            busy: AtomicBool::new(false),
        }
    }

    fn enter(&self) {
        assert!(
            !self.busy.swap(true, Ordering::SeqCst),
            "overlapped block-device call"
        );
        std::thread::yield_now();
    }

    fn exit(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl<D: BlockDevice> BlockDevice for SerialProbe<D> {
    type Error = D::Error;

    fn geometry(&self) -> &Geometry {
        self.inner.geometry()
    }

    fn read(
        &self,
        block: BlockIndex,
        offset: u32,
        buf: &mut [u8],
    ) -> std::result::Result<(), Self::Error> {
        self.enter();
        let result = self.inner.read(block, offset, buf);
        self.exit();
        result
    }

    fn program(
        &mut self,
        block: BlockIndex,
        offset: u32,
        buf: &[u8],
    ) -> std::result::Result<(), Self::Error> {
        self.enter();
        let result = self.inner.program(block, offset, buf);
        self.exit();
        result
    }

    fn erase(&mut self, block: BlockIndex) -> std::result::Result<(), Self::Error> {
        self.enter();
        let result = self.inner.erase(block);
        self.exit();
        result
    }

    fn sync(&mut self) -> std::result::Result<(), Self::Error> {
        self.enter();
        let result = self.inner.sync();
        self.exit();
        result
    }
}

/// Block allocator for [`MemEngine`] file payloads.
struct Allocator {
    free: Vec<u32>,
    next: u32,
    count: u32,
}

impl Allocator {
    fn new(count: u32) -> Self {
        Self {
            free: Vec::new(),
            next: 0,
            count,
        }
    }

    fn alloc(&mut self) -> Result<u32> {
        if let Some(block) = self.free.pop() {
            return Ok(block);
        }
        if self.next == self.count {
            return Err(Error::NoSpace);
        }
        let block = self.next;
        self.next += 1;
        Ok(block)
    }

    fn release(&mut self, block: u32) {
        self.free.push(block);
    }

    fn used(&self) -> u32 {
        self.next - self.free.len() as u32
    }
}

struct FileNode {
    blocks: Vec<u32>,
    size: u32,
}

enum Node {
    File(FileNode),
    Dir(BTreeMap<String, Node>),
}

type Tree = BTreeMap<String, Node>;

/// Open-file state handed out by [`MemEngine`].
pub struct MemFile {
    path: String,
    pos: u64,
    flags: OpenFlags,
}

/// Directory-iteration state: a snapshot of the entries present at open.
pub struct MemDir {
    entries: Vec<Metadata>,
    pos: usize,
}

fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
        .collect()
}

fn canonical(path: &str) -> String {
    let mut joined = String::from("/");
    joined.push_str(&segments(path).join("/"));
    joined
}

fn dir_mut<'a>(root: &'a mut Tree, segs: &[String]) -> Result<&'a mut Tree> {
    let mut current = root;
    for segment in segs {
        match current.get_mut(segment) {
            Some(Node::Dir(next)) => current = next,
            Some(Node::File(_)) => return Err(Error::NotADirectory),
            None => return Err(Error::NotFound),
        }
    }
    Ok(current)
}

fn dir_ref<'a>(root: &'a Tree, segs: &[String]) -> Result<&'a Tree> {
    let mut current = root;
    for segment in segs {
        match current.get(segment) {
            Some(Node::Dir(next)) => current = next,
            Some(Node::File(_)) => return Err(Error::NotADirectory),
            None => return Err(Error::NotFound),
        }
    }
    Ok(current)
}

/// Parent directory and entry name of `path`.
fn parent_dir<'a>(root: &'a mut Tree, path: &str) -> Result<(&'a mut Tree, String)> {
    let mut segs = segments(path);
    let name = segs.pop().ok_or(Error::InvalidArgument)?;
    if name.len() > NAME_MAX {
        return Err(Error::NameTooLong);
    }
    let parent = dir_mut(root, &segs)?;
    Ok((parent, name))
}

fn node_ref<'a>(root: &'a Tree, path: &str) -> Result<&'a Node> {
    let mut segs = segments(path);
    let name = segs.pop().ok_or(Error::InvalidArgument)?;
    dir_ref(root, &segs)?.get(&name).ok_or(Error::NotFound)
}

fn file_ref<'a>(root: &'a Tree, path: &str) -> Result<&'a FileNode> {
    match node_ref(root, path)? {
        Node::File(file) => Ok(file),
        Node::Dir(_) => Err(Error::IsADirectory),
    }
}

fn file_mut<'a>(root: &'a mut Tree, path: &str) -> Result<&'a mut FileNode> {
    let (parent, name) = parent_dir(root, path)?;
    match parent.get_mut(&name) {
        Some(Node::File(file)) => Ok(file),
        Some(Node::Dir(_)) => Err(Error::IsADirectory),
        None => Err(Error::NotFound),
    }
}

fn metadata(name: &str, node: &Node) -> Result<Metadata> {
    let name = heapless::String::try_from(name).map_err(|_| Error::NameTooLong)?;
    Ok(match node {
        Node::File(file) => Metadata {
            entry_type: EntryType::File,
            size: file.size,
            name,
        },
        Node::Dir(_) => Metadata {
            entry_type: EntryType::Directory,
            size: 0,
            name,
        },
    })
}

/// Reference engine: directory tree and attributes in RAM, file payloads
/// stored through the block device (erase before program, whole blocks
/// per file). Top-level operations bracket themselves with the lock
/// hooks installed at mount; rename re-enters the lock through a nested
/// stat to exercise the gate's re-entrancy.
pub struct MemEngine<D: BlockDevice<Error = Error>> {
    device: D,
    hooks: Option<Arc<dyn LockHooks>>,
    root: Tree,
    attrs: BTreeMap<(String, u8), Vec<u8>>,
    allocator: Allocator,
    formatted: bool,
}

impl<D: BlockDevice<Error = Error>> MemEngine<D> {
    pub fn new(device: D) -> Self {
        let block_count = device.geometry().block_count();
        Self {
            device,
            hooks: None,
            root: BTreeMap::new(),
            attrs: BTreeMap::new(),
            allocator: Allocator::new(block_count),
            formatted: false,
        }
    }

    /// Bracket `f` with the lock hooks, once mounted.
    fn locked<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        match self.hooks.clone() {
            Some(hooks) => {
                hooks.lock()?;
                let result = f(self);
                hooks.unlock()?;
                result
            }
            None => f(self),
        }
    }

    fn load(&self, file: &FileNode) -> Result<Vec<u8>> {
        let block_size = self.device.geometry().block_size() as usize;
        let mut content = vec![0u8; file.size as usize];
        for (i, chunk) in content.chunks_mut(block_size).enumerate() {
            self.device.read(BlockIndex::new(file.blocks[i]), 0, chunk)?;
        }
        Ok(content)
    }

    /// Store `content` as the file's payload: adjust the block run, erase
    /// each block, then program page-aligned data into it.
    fn store(
        device: &mut D,
        allocator: &mut Allocator,
        file: &mut FileNode,
        content: &[u8],
    ) -> Result<()> {
        let block_size = device.geometry().block_size() as usize;
        let prog_size = device.geometry().prog_size() as usize;
        let needed = content.len().div_ceil(block_size);

        while file.blocks.len() < needed {
            file.blocks.push(allocator.alloc()?);
        }
        while file.blocks.len() > needed {
            if let Some(block) = file.blocks.pop() {
                allocator.release(block);
            }
        }

        for (i, chunk) in content.chunks(block_size).enumerate() {
            let block = BlockIndex::new(file.blocks[i]);
            device.erase(block)?;
            let mut padded = chunk.to_vec();
            padded.resize(chunk.len().div_ceil(prog_size) * prog_size, 0xFF);
            device.program(block, 0, &padded)?;
        }
        file.size = content.len() as u32;
        Ok(())
    }

    /// Load, edit and store a file payload in one step.
    fn update(&mut self, path: &str, edit: impl FnOnce(&mut Vec<u8>)) -> Result<()> {
        let mut content = self.load(file_ref(&self.root, path)?)?;
        edit(&mut content);
        let Self {
            device,
            allocator,
            root,
            ..
        } = self;
        Self::store(device, allocator, file_mut(root, path)?, &content)
    }
}

impl<D: BlockDevice<Error = Error>> Engine for MemEngine<D> {
    type File = MemFile;
    type Dir = MemDir;

    fn format(&mut self) -> Result<()> {
        for block in 0..self.device.geometry().block_count() {
            self.device.erase(BlockIndex::new(block))?;
        }
        self.root.clear();
        self.attrs.clear();
        self.allocator = Allocator::new(self.device.geometry().block_count());
        self.formatted = true;
        Ok(())
    }

    fn mount(&mut self, hooks: Arc<dyn LockHooks>) -> Result<()> {
        if !self.formatted {
            return Err(Error::Corrupt);
        }
        self.hooks = Some(hooks);
        Ok(())
    }

    fn unmount(&mut self) -> Result<()> {
        self.hooks = None;
        Ok(())
    }

    fn file_open(&mut self, path: &str, flags: OpenFlags) -> Result<MemFile> {
        self.locked(|this| {
            if !flags.intersects(OpenFlags::READ_WRITE) {
                return Err(Error::InvalidArgument);
            }
            let path = canonical(path);
            let (parent, name) = parent_dir(&mut this.root, &path)?;
            match parent.get(&name) {
                Some(Node::Dir(_)) => return Err(Error::IsADirectory),
                Some(Node::File(_)) => {
                    if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                        return Err(Error::AlreadyExists);
                    }
                }
                None => {
                    if !flags.contains(OpenFlags::CREATE) {
                        return Err(Error::NotFound);
                    }
                    parent.insert(
                        name,
                        Node::File(FileNode {
                            blocks: Vec::new(),
                            size: 0,
                        }),
                    );
                }
            }
            if flags.contains(OpenFlags::TRUNCATE) {
                this.update(&path, |content| content.clear())?;
            }
            Ok(MemFile {
                path,
                pos: 0,
                flags,
            })
        })
    }

    fn file_close(&mut self, file: MemFile) -> Result<()> {
        self.locked(|_| {
            drop(file);
            Ok(())
        })
    }

    fn file_read(&mut self, file: &mut MemFile, buf: &mut [u8]) -> Result<usize> {
        self.locked(|this| {
            if !file.flags.intersects(OpenFlags::READ) {
                return Err(Error::InvalidArgument);
            }
            let content = this.load(file_ref(&this.root, &file.path)?)?;
            let pos = (file.pos as usize).min(content.len());
            let n = buf.len().min(content.len() - pos);
            buf[..n].copy_from_slice(&content[pos..pos + n]);
            file.pos += n as u64;
            Ok(n)
        })
    }

    fn file_write(&mut self, file: &mut MemFile, buf: &[u8]) -> Result<usize> {
        self.locked(|this| {
            if !file.flags.intersects(OpenFlags::WRITE) {
                return Err(Error::InvalidArgument);
            }
            if file.flags.contains(OpenFlags::APPEND) {
                file.pos = file_ref(&this.root, &file.path)?.size as u64;
            }
            let pos = file.pos as usize;
            this.update(&file.path, |content| {
                if pos + buf.len() > content.len() {
                    content.resize(pos + buf.len(), 0);
                }
                content[pos..pos + buf.len()].copy_from_slice(buf);
            })?;
            file.pos += buf.len() as u64;
            Ok(buf.len())
        })
    }

    fn file_seek(&mut self, file: &mut MemFile, offset: i64, whence: Whence) -> Result<u64> {
        self.locked(|this| {
            let base = match whence {
                Whence::Set => 0,
                Whence::Current => file.pos as i64,
                Whence::End => file_ref(&this.root, &file.path)?.size as i64,
            };
            let target = base + offset;
            if target < 0 {
                return Err(Error::InvalidArgument);
            }
            file.pos = target as u64;
            Ok(file.pos)
        })
    }

    fn file_tell(&mut self, file: &mut MemFile) -> Result<u64> {
        self.locked(|_| Ok(file.pos))
    }

    fn file_truncate(&mut self, file: &mut MemFile, size: u64) -> Result<()> {
        self.locked(|this| {
            this.update(&file.path, |content| content.resize(size as usize, 0))
        })
    }

    fn file_size(&mut self, file: &mut MemFile) -> Result<u64> {
        self.locked(|this| Ok(file_ref(&this.root, &file.path)?.size as u64))
    }

    fn file_sync(&mut self, _file: &mut MemFile) -> Result<()> {
        // Payloads are written through on every write.
        self.locked(|_| Ok(()))
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        self.locked(|this| {
            let path = canonical(path);
            let (parent, name) = parent_dir(&mut this.root, &path)?;
            match parent.get(&name) {
                None => return Err(Error::NotFound),
                Some(Node::Dir(entries)) if !entries.is_empty() => {
                    return Err(Error::DirectoryNotEmpty);
                }
                Some(_) => {}
            }
            if let Some(Node::File(file)) = parent.remove(&name) {
                for block in file.blocks {
                    this.allocator.release(block);
                }
            }
            this.attrs.retain(|(attr_path, _), _| *attr_path != path);
            Ok(())
        })
    }

    fn rename(&mut self, old_path: &str, new_path: &str) -> Result<()> {
        self.locked(|this| {
            // Nested top-level call: re-enters the gate through the hooks,
            // the way real engine call chains do.
            this.stat(old_path)?;

            let old = canonical(old_path);
            let new = canonical(new_path);

            // Validate the destination before detaching the source.
            let (new_parent, new_name) = parent_dir(&mut this.root, &new)?;
            if let Some(Node::Dir(entries)) = new_parent.get(&new_name) {
                if !entries.is_empty() {
                    return Err(Error::DirectoryNotEmpty);
                }
            }

            let (old_parent, old_name) = parent_dir(&mut this.root, &old)?;
            let node = old_parent.remove(&old_name).ok_or(Error::NotFound)?;

            let (new_parent, new_name) = parent_dir(&mut this.root, &new)?;
            let displaced = new_parent.insert(new_name, node);
            if let Some(Node::File(prev)) = displaced {
                for block in prev.blocks {
                    this.allocator.release(block);
                }
            }

            let moved: Vec<_> = this
                .attrs
                .iter()
                .filter(|((attr_path, _), _)| *attr_path == old)
                .map(|((_, tag), value)| (*tag, value.clone()))
                .collect();
            this.attrs.retain(|(attr_path, _), _| *attr_path != old);
            for (tag, value) in moved {
                this.attrs.insert((new.clone(), tag), value);
            }
            Ok(())
        })
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        self.locked(|this| {
            let path = canonical(path);
            let (parent, name) = parent_dir(&mut this.root, &path)?;
            if parent.contains_key(&name) {
                return Err(Error::AlreadyExists);
            }
            parent.insert(name, Node::Dir(BTreeMap::new()));
            Ok(())
        })
    }

    fn stat(&mut self, path: &str) -> Result<Metadata> {
        self.locked(|this| {
            if segments(path).is_empty() {
                return metadata("/", &Node::Dir(BTreeMap::new()));
            }
            let path = canonical(path);
            let node = node_ref(&this.root, &path)?;
            let name = path.rsplit('/').next().unwrap_or("");
            metadata(name, node)
        })
    }

    fn getattr(&mut self, path: &str, tag: u8, buf: &mut [u8]) -> Result<usize> {
        self.locked(|this| {
            let path = canonical(path);
            node_ref(&this.root, &path)?;
            let value = this.attrs.get(&(path, tag)).ok_or(Error::NoAttribute)?;
            let n = buf.len().min(value.len());
            buf[..n].copy_from_slice(&value[..n]);
            Ok(n)
        })
    }

    fn setattr(&mut self, path: &str, tag: u8, value: &[u8]) -> Result<()> {
        self.locked(|this| {
            let path = canonical(path);
            node_ref(&this.root, &path)?;
            this.attrs.insert((path, tag), value.to_vec());
            Ok(())
        })
    }

    fn removeattr(&mut self, path: &str, tag: u8) -> Result<()> {
        self.locked(|this| {
            let path = canonical(path);
            node_ref(&this.root, &path)?;
            this.attrs
                .remove(&(path, tag))
                .map(|_| ())
                .ok_or(Error::NoAttribute)
        })
    }

    fn dir_open(&mut self, path: &str) -> Result<MemDir> {
        self.locked(|this| {
            let segs = segments(path);
            let dir = dir_ref(&this.root, &segs)?;
            let entries = dir
                .iter()
                .map(|(name, node)| metadata(name, node))
                .collect::<Result<Vec<_>>>()?;
            Ok(MemDir { entries, pos: 0 })
        })
    }

    fn dir_close(&mut self, dir: MemDir) -> Result<()> {
        self.locked(|_| {
            drop(dir);
            Ok(())
        })
    }

    fn dir_read(&mut self, dir: &mut MemDir) -> Result<Option<Metadata>> {
        self.locked(|_| {
            let entry = dir.entries.get(dir.pos).cloned();
            if entry.is_some() {
                dir.pos += 1;
            }
            Ok(entry)
        })
    }

    fn dir_seek(&mut self, dir: &mut MemDir, offset: u64) -> Result<()> {
        self.locked(|_| {
            dir.pos = offset as usize;
            Ok(())
        })
    }

    fn dir_tell(&mut self, dir: &mut MemDir) -> Result<u64> {
        self.locked(|_| Ok(dir.pos as u64))
    }

    fn dir_rewind(&mut self, dir: &mut MemDir) -> Result<()> {
        self.locked(|_| {
            dir.pos = 0;
            Ok(())
        })
    }

    fn geometry(&self) -> &Geometry {
        self.device.geometry()
    }

    fn blocks_used(&mut self) -> Result<u32> {
        Ok(self.allocator.used())
    }
}
