//! # 目录层
//!
//! 目录文件就是定长目录项的序列。[`Inode::locate`] 按目录项的步长逐块遍历目录文件，
//! 所有检索方式共用同一套遍历与空位记录逻辑，区别只在于遇到目录项时做什么。
//!
//! 目录项的 inode 编号为 0 即空位。"." 与 ".." 若指向根目录（编号 0），
//! 在磁盘上记作 [`HAS_DOTS`]，读出时再换回 0。

use std::sync::Arc;

use enumflags2::BitFlags;

use crate::inode::{FileKind, Inode, InodeInner};
use crate::layout::{DirEntry, HAS_DOTS, NAME_MAX_LEN, ROOT_INO};
use crate::volume::{DotLayout, Volume};
use crate::{BLOCK_SIZE, Corruption, Error, Result};

const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / DirEntry::SIZE;

/// 检索方式
pub enum Search<'a> {
    /// 按名查找，跳过 "." 与 ".."
    Lookup,
    /// 按名查找，"." 与 ".." 也参与匹配
    LookupDots,
    /// 寻找可以写入新目录项的位置，同名目录项已存在时失败
    Create,
    /// 除 "." 与 ".." 外是否全是空位
    CheckEmpty,
    /// 从 `cursor` 起按存放顺序列出目录项，`emit` 返回假时提前停止
    List {
        cursor: u64,
        emit: &'a mut dyn FnMut(DirEntryInfo<'_>) -> bool,
    },
}

/// 列目录时交给回调的目录项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryInfo<'a> {
    pub name: &'a [u8],
    pub ino: u32,
    /// 该目录项的游标
    pub cursor: u64,
}

/// 检索结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Located {
    /// 找到的目录项及其在目录文件中的偏移
    Found { ino: u32, offset: u32 },
    /// 可写入的位置；`append` 为真表示位于目录文件末尾
    Vacant { offset: u32, append: bool },
    Empty(bool),
    /// 列目录结束时的游标，即下一个未交出的目录项
    Listed { cursor: u64 },
}

impl Inode {
    /// 在目录中检索 `name`
    ///
    /// `Lookup` 与 `LookupDots` 找不到时返回 [`Error::NotFound`]，
    /// `Create` 遇到同名目录项时返回 [`Error::AlreadyExists`]。
    pub fn locate(&self, name: &[u8], search: Search<'_>) -> Result<Located> {
        self.lock().locate(self.volume(), name, search)
    }

    /// 按名取得目录中的文件
    pub fn find(&self, name: &[u8]) -> Result<Arc<Inode>> {
        let search = if is_dot_name(name) {
            Search::LookupDots
        } else {
            Search::Lookup
        };
        match self.locate(name, search)? {
            Located::Found { ino, .. } => self.volume().iget(ino),
            _ => Err(Error::NotFound),
        }
    }

    /// 在目录中增加一项 `name` → `ino`
    pub fn link(&self, name: &[u8], ino: u32) -> Result<()> {
        check_name(name)?;
        if self.volume().is_read_only() {
            return Err(Error::ReadOnly);
        }
        if ino == ROOT_INO || ino >= self.volume().inode_count() {
            return Err(Corruption::BadInode(ino).into());
        }
        let entry = DirEntry::new(name, ino).ok_or(Error::NameTooLong)?;

        // 检索与写入在同一把锁下完成
        let mut inner = self.lock();
        let offset = match inner.locate(self.volume(), name, Search::Create)? {
            Located::Vacant { offset, .. } => offset,
            _ => return Err(Error::AlreadyExists),
        };
        inner.write_at(self.volume(), offset as usize, &entry.to_bytes())?;
        log::debug!("link {:?} -> {ino} in dir {}", name.escape_ascii().to_string(), self.number());
        Ok(())
    }

    /// 删除目录项 `name`，返回它指向的 inode 编号
    pub fn unlink(&self, name: &[u8]) -> Result<u32> {
        check_name(name)?;
        if self.volume().is_read_only() {
            return Err(Error::ReadOnly);
        }

        let mut inner = self.lock();
        let Located::Found { ino, offset } = inner.locate(self.volume(), name, Search::Lookup)? else {
            return Err(Error::NotFound);
        };
        inner.write_at(self.volume(), offset as usize, &DirEntry::vacant().to_bytes())?;
        log::debug!("unlink {:?} in dir {}", name.escape_ascii().to_string(), self.number());
        Ok(ino)
    }

    /// 新建文件并登记到目录中
    pub fn create(&self, name: &[u8], kind: FileKind) -> Result<Arc<Inode>> {
        check_name(name)?;
        if self.volume().is_read_only() {
            return Err(Error::ReadOnly);
        }
        match self.locate(name, Search::Lookup) {
            Ok(_) => return Err(Error::AlreadyExists),
            Err(Error::NotFound) => {}
            Err(err) => return Err(err),
        }

        let inode = self.volume().alloc_inode()?;
        let perm = match kind {
            FileKind::Directory => 0o755,
            _ => 0o644,
        };
        inode.init(kind, BitFlags::from_bits_truncate(perm));
        if let Err(err) = self.link(name, inode.number()) {
            // 引用消失时连同编号一起释放
            inode.set_nlink(0);
            return Err(err);
        }
        Ok(inode)
    }

    /// 新建子目录
    ///
    /// 目录内含 "." 与 ".." 时，子目录的链接数为 2，父目录的链接数加 1。
    pub fn mkdir(&self, name: &[u8]) -> Result<Arc<Inode>> {
        let dir = self.create(name, FileKind::Directory)?;
        if self.volume().dots() == DotLayout::Absent {
            return Ok(dir);
        }

        if let Err(err) = dir.add_dots(self.number()) {
            if let Err(err) = self.unlink(name) {
                log::error!("mkdir rollback failed: {err}");
            }
            dir.set_nlink(0);
            return Err(err);
        }
        dir.set_nlink(2);
        self.set_nlink(self.nlink() + 1);
        Ok(dir)
    }

    /// 删除目录项并减少目标的链接数，非空目录拒绝删除
    pub fn remove(&self, name: &[u8]) -> Result<()> {
        check_name(name)?;
        let target = self.find(name)?;
        let is_dir = target.is_dir();
        if is_dir && target.locate(b"", Search::CheckEmpty)? == Located::Empty(false) {
            return Err(Error::DirectoryNotEmpty);
        }

        let ino = self.unlink(name)?;
        if ino != target.number() {
            log::warn!("entry {:?} changed during remove", name.escape_ascii().to_string());
            return Ok(());
        }
        if is_dir {
            target.set_nlink(0);
            if self.volume().dots() == DotLayout::Embedded {
                self.set_nlink(self.nlink().saturating_sub(1));
            }
        } else {
            target.set_nlink(target.nlink().saturating_sub(1));
        }
        Ok(())
    }

    /// 从 `cursor` 起列目录，返回结束时的游标
    pub fn list(&self, cursor: u64, mut emit: impl FnMut(DirEntryInfo<'_>) -> bool) -> Result<u64> {
        match self.locate(b"", Search::List { cursor, emit: &mut emit })? {
            Located::Listed { cursor } => Ok(cursor),
            _ => Ok(cursor),
        }
    }

    /// 目录中除 "." 与 ".." 外的全部文件名
    pub fn ls(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.list(0, |entry| {
            names.push(String::from_utf8_lossy(entry.name).into_owned());
            true
        })?;
        Ok(names)
    }

    fn add_dots(&self, parent: u32) -> Result<()> {
        let mut inner = self.lock();
        let dots = [(b".".as_slice(), self.number()), (b"..".as_slice(), parent)];
        for (index, (name, ino)) in dots.into_iter().enumerate() {
            let stored = if ino == ROOT_INO { HAS_DOTS } else { ino };
            let entry = DirEntry::new(name, stored).ok_or(Error::NameTooLong)?;
            inner.write_at(self.volume(), index * DirEntry::SIZE, &entry.to_bytes())?;
        }
        inner.mark_updated();
        Ok(())
    }
}

impl InodeInner {
    pub(crate) fn locate(&mut self, volume: &Volume, name: &[u8], mut search: Search<'_>) -> Result<Located> {
        if FileKind::from_mode(self.disk.mode) != FileKind::Directory {
            return Err(Error::NotADirectory);
        }
        if name.len() > NAME_MAX_LEN {
            return Err(Error::NameTooLong);
        }

        let dots = volume.dots();
        let size = self.disk.size;
        let entry_size = DirEntry::SIZE as u32;
        let mut offset = match &search {
            Search::List { cursor, .. } => dots.offset(*cursor) / entry_size * entry_size,
            _ => 0,
        };
        let mut first_vacant = None;

        while offset < size {
            let lbn = offset / BLOCK_SIZE as u32;
            let entries = self.dir_block(volume, lbn)?;
            let first = offset as usize % BLOCK_SIZE / DirEntry::SIZE;

            for entry in &entries[first..] {
                if offset >= size {
                    break;
                }
                let at = offset;
                offset += entry_size;

                if entry.is_vacant() {
                    first_vacant.get_or_insert(at);
                    continue;
                }
                let is_dot = entry.is_dot();
                let ino = if is_dot && entry.ino == HAS_DOTS {
                    ROOT_INO
                } else {
                    entry.ino
                };

                match &mut search {
                    Search::Lookup if !is_dot && entry.name() == name => {
                        return Ok(Located::Found { ino, offset: at });
                    }
                    Search::LookupDots if entry.name() == name => {
                        return Ok(Located::Found { ino, offset: at });
                    }
                    Search::Create if entry.name() == name => {
                        return Err(Error::AlreadyExists);
                    }
                    Search::CheckEmpty if !is_dot => return Ok(Located::Empty(false)),
                    Search::List { emit, .. } if !is_dot => {
                        let cursor = dots.cursor(at);
                        let info = DirEntryInfo {
                            name: entry.name(),
                            ino,
                            cursor,
                        };
                        if !(*emit)(info) {
                            return Ok(Located::Listed { cursor });
                        }
                    }
                    _ => {}
                }
            }
        }

        match search {
            Search::Lookup | Search::LookupDots => Err(Error::NotFound),
            Search::Create => Ok(match first_vacant {
                Some(offset) => Located::Vacant {
                    offset,
                    append: false,
                },
                None => Located::Vacant {
                    offset: size,
                    append: true,
                },
            }),
            Search::CheckEmpty => Ok(Located::Empty(true)),
            Search::List { .. } => Ok(Located::Listed {
                cursor: dots.cursor(size),
            }),
        }
    }

    /// 目录文件第 `lbn` 块中的全部目录项，空洞视为全是空位
    fn dir_block(&mut self, volume: &Volume, lbn: u32) -> Result<Vec<DirEntry>> {
        self.set_last_read(lbn);
        let Some(block) = self.map(volume, lbn, false)? else {
            return Ok(vec![DirEntry::vacant(); ENTRIES_PER_BLOCK]);
        };
        let buf = volume.read_block(block)?;
        buf.chunks_exact(DirEntry::SIZE).map(DirEntry::load).collect()
    }
}

/// 是否是 "." 或 ".."
fn is_dot_name(name: &[u8]) -> bool {
    matches!(name, b"." | b"..")
}

/// 可以增删的目录项名字
fn check_name(name: &[u8]) -> Result<()> {
    if name.len() > NAME_MAX_LEN {
        return Err(Error::NameTooLong);
    }
    if name.is_empty() || is_dot_name(name) || name.iter().any(|&c| c == 0 || c == b'/') {
        return Err(Error::InvalidName);
    }
    Ok(())
}
