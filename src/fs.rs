//! File system collaborator: virtual paths and the local directory backend

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite};

use crate::error::FtpError;
use crate::login::Principal;
use crate::protocol::reply;

/// Directory entry or file as seen by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;
pub type FileWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Storage seen by one logged-in user. Paths are virtual path components,
/// already resolved against the working directory (see [`resolve`]).
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn list(&self, path: &[String]) -> Result<Vec<FileEntry>, FtpError>;
    async fn metadata(&self, path: &[String]) -> Result<FileEntry, FtpError>;
    /// Reads from byte `offset` on (`REST`).
    async fn open_read(&self, path: &[String], offset: u64) -> Result<FileReader, FtpError>;
    /// Writes from byte `offset` on; anything past it is cut off. Offset 0
    /// creates or truncates the file.
    async fn create(&self, path: &[String], offset: u64) -> Result<FileWriter, FtpError>;
    async fn append(&self, path: &[String]) -> Result<FileWriter, FtpError>;
    async fn rename(&self, from: &[String], to: &[String]) -> Result<(), FtpError>;
}

/// Creates the file system for an authorized user.
pub trait FileSystemFactory: Send + Sync {
    fn create(&self, principal: &Principal) -> Result<Arc<dyn FileSystem>, FtpError>;
}

/// Resolves a client supplied path against the working directory stack.
/// `..` never climbs above the root.
pub fn resolve(cwd: &[String], arg: &str) -> Result<Vec<String>, FtpError> {
    if arg.contains('\0') {
        return Err(FtpError::file_system(reply::FILE_UNAVAILABLE, "Invalid path."));
    }
    let mut out: Vec<String> = if arg.starts_with('/') { Vec::new() } else { cwd.to_vec() };
    for part in arg.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            name => out.push(name.to_string()),
        }
    }
    Ok(out)
}

/// Client facing form of a virtual path, always absolute.
pub fn display_path(path: &[String]) -> String {
    format!("/{}", path.join("/"))
}

fn outside_root() -> FtpError {
    FtpError::file_system(reply::FILE_UNAVAILABLE, "Invalid path.")
}

/// Maps resolved virtual path components onto a directory below `root`.
///
/// Components come from [`resolve`], so `..` is already folded away; what
/// remains is checked again here, and symlinks are followed so that a link
/// can't lead out of the root. A missing leaf is checked through its parent.
pub fn jail_path(root: &Path, path: &[String]) -> Result<PathBuf, FtpError> {
    let mut local = root.to_path_buf();
    for part in path {
        let bad_char = part.contains(&['/', '\0'][..]) || (cfg!(windows) && part.contains(&['\\', ':'][..]));
        if part.is_empty() || part == "." || part == ".." || bad_char {
            return Err(outside_root());
        }
        local.push(part);
    }

    let checked = match std::fs::canonicalize(&local) {
        Ok(real) => real,
        Err(_) => match (local.parent().map(std::fs::canonicalize), local.file_name()) {
            (Some(Ok(parent)), Some(name)) => parent.join(name),
            _ => local,
        },
    };
    if checked.starts_with(root) {
        Ok(checked)
    } else {
        Err(outside_root())
    }
}

fn modified(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(|t: SystemTime| DateTime::<Utc>::from(t))
}

/// Serves a local directory tree.
#[derive(Debug)]
pub struct LocalFileSystem {
    root: PathBuf,
    read_only: bool,
}

impl LocalFileSystem {
    /// `root` must already be canonical.
    pub fn new(root: PathBuf, read_only: bool) -> Self {
        Self { root, read_only }
    }

    fn local_path(&self, path: &[String]) -> Result<PathBuf, FtpError> {
        jail_path(&self.root, path)
    }

    fn writable_path(&self, path: &[String]) -> Result<PathBuf, FtpError> {
        if self.read_only {
            return Err(FtpError::file_system(reply::FILE_UNAVAILABLE, "Permission denied."));
        }
        self.local_path(path)
    }

    fn entry(name: String, meta: &std::fs::Metadata) -> FileEntry {
        FileEntry { name, is_dir: meta.is_dir(), size: if meta.is_dir() { 0 } else { meta.len() }, modified: modified(meta) }
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn list(&self, path: &[String]) -> Result<Vec<FileEntry>, FtpError> {
        let dir = self.local_path(path)?;
        let mut rd = tokio::fs::read_dir(&dir).await?;
        let mut entries = Vec::new();
        while let Some(e) = rd.next_entry().await? {
            let meta = match e.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            entries.push(Self::entry(e.file_name().to_string_lossy().into_owned(), &meta));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn metadata(&self, path: &[String]) -> Result<FileEntry, FtpError> {
        let local = self.local_path(path)?;
        let meta = tokio::fs::metadata(&local).await?;
        let name = path.last().cloned().unwrap_or_else(|| "/".to_string());
        Ok(Self::entry(name, &meta))
    }

    async fn open_read(&self, path: &[String], offset: u64) -> Result<FileReader, FtpError> {
        let local = self.local_path(path)?;
        let mut file = tokio::fs::File::open(&local).await?;
        let meta = file.metadata().await?;
        if meta.is_dir() {
            return Err(FtpError::file_system(reply::FILE_UNAVAILABLE, "Not a plain file."));
        }
        if offset > meta.len() {
            return Err(FtpError::file_system(reply::FILE_UNAVAILABLE, "Restart offset is past the end of the file."));
        }
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }

    async fn create(&self, path: &[String], offset: u64) -> Result<FileWriter, FtpError> {
        let local = self.writable_path(path)?;
        if offset == 0 {
            return Ok(Box::new(tokio::fs::File::create(&local).await?));
        }
        let mut file = tokio::fs::OpenOptions::new().write(true).open(&local).await?;
        if offset > file.metadata().await?.len() {
            return Err(FtpError::file_system(reply::FILE_UNAVAILABLE, "Restart offset is past the end of the file."));
        }
        file.set_len(offset).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        Ok(Box::new(file))
    }

    async fn append(&self, path: &[String]) -> Result<FileWriter, FtpError> {
        let local = self.writable_path(path)?;
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(&local).await?;
        Ok(Box::new(file))
    }

    async fn rename(&self, from: &[String], to: &[String]) -> Result<(), FtpError> {
        if from.is_empty() || to.is_empty() {
            return Err(FtpError::file_system(reply::FILE_UNAVAILABLE, "Can't rename the root directory."));
        }
        let source = self.writable_path(from)?;
        let target = self.local_path(to)?;
        tokio::fs::rename(&source, &target).await?;
        Ok(())
    }
}

/// Every user shares one root; anonymous users can't write.
#[derive(Debug)]
pub struct LocalFileSystemFactory {
    root: PathBuf,
}

impl LocalFileSystemFactory {
    pub fn new(root: &Path) -> Result<Self> {
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("Failed to canonicalize root path: {}", root.display()))?;
        if !root.is_dir() {
            bail!("Root path is not a directory: {}", root.display());
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileSystemFactory for LocalFileSystemFactory {
    fn create(&self, principal: &Principal) -> Result<Arc<dyn FileSystem>, FtpError> {
        Ok(Arc::new(LocalFileSystem::new(self.root.clone(), principal.anonymous)))
    }
}

/// File system used before login. Every operation fails.
#[derive(Debug)]
pub struct EmptyFileSystem;

#[async_trait]
impl FileSystem for EmptyFileSystem {
    async fn list(&self, _path: &[String]) -> Result<Vec<FileEntry>, FtpError> {
        Ok(Vec::new())
    }

    async fn metadata(&self, _path: &[String]) -> Result<FileEntry, FtpError> {
        Err(FtpError::file_system(reply::FILE_UNAVAILABLE, "File not found."))
    }

    async fn open_read(&self, _path: &[String], _offset: u64) -> Result<FileReader, FtpError> {
        Err(FtpError::file_system(reply::FILE_UNAVAILABLE, "File not found."))
    }

    async fn create(&self, _path: &[String], _offset: u64) -> Result<FileWriter, FtpError> {
        Err(FtpError::file_system(reply::FILE_UNAVAILABLE, "Permission denied."))
    }

    async fn append(&self, _path: &[String]) -> Result<FileWriter, FtpError> {
        Err(FtpError::file_system(reply::FILE_UNAVAILABLE, "Permission denied."))
    }

    async fn rename(&self, _from: &[String], _to: &[String]) -> Result<(), FtpError> {
        Err(FtpError::file_system(reply::FILE_UNAVAILABLE, "Permission denied."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn parts(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolve_relative_and_absolute() {
        let cwd = parts(&["pub", "docs"]);
        assert_eq!(resolve(&cwd, "a.txt").unwrap(), parts(&["pub", "docs", "a.txt"]));
        assert_eq!(resolve(&cwd, "../x").unwrap(), parts(&["pub", "x"]));
        assert_eq!(resolve(&cwd, "/etc/./passwd").unwrap(), parts(&["etc", "passwd"]));
        assert_eq!(resolve(&cwd, "../../../..").unwrap(), Vec::<String>::new());
        assert_eq!(display_path(&resolve(&cwd, "..").unwrap()), "/pub");
        assert!(resolve(&cwd, "a\0b").is_err());
    }

    #[test]
    fn jailed_paths_stay_below_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir(root.join("pub")).unwrap();

        assert_eq!(jail_path(&root, &[]).unwrap(), root);
        assert_eq!(jail_path(&root, &parts(&["pub"])).unwrap(), root.join("pub"));
        // Not created yet
        assert_eq!(jail_path(&root, &parts(&["pub", "new.txt"])).unwrap(), root.join("pub").join("new.txt"));

        assert!(jail_path(&root, &parts(&["..", "etc"])).is_err());
        assert!(jail_path(&root, &parts(&["a/b"])).is_err());
        assert!(jail_path(&root, &parts(&[""])).is_err());
        assert!(jail_path(&root, &parts(&["file\0.txt"])).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let outside = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();
        assert!(jail_path(&root, &parts(&["link"])).is_err());
        assert!(jail_path(&root, &parts(&["link", "x.txt"])).is_err());
    }

    #[tokio::test]
    async fn local_file_system_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        fs::write(temp_dir.path().join("b.txt"), b"hello").unwrap();
        let factory = LocalFileSystemFactory::new(temp_dir.path()).unwrap();
        let fs = factory.create(&Principal::user("bob")).unwrap();

        let names: Vec<String> = fs.list(&[]).await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["b.txt", "sub"]);
        assert_eq!(fs.metadata(&parts(&["b.txt"])).await.unwrap().size, 5);

        let mut w = fs.create(&parts(&["sub", "new.bin"]), 0).await.unwrap();
        w.write_all(b"data").await.unwrap();
        w.shutdown().await.unwrap();
        drop(w);

        let mut r = fs.open_read(&parts(&["sub", "new.bin"]), 0).await.unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"data");

        let err = fs.open_read(&parts(&["missing"]), 0).await.err().unwrap();
        assert_eq!(err.code(), 550);
    }

    async fn read_from(fs: &dyn FileSystem, path: &[String], offset: u64) -> Vec<u8> {
        let mut r = fs.open_read(path, offset).await.unwrap();
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn restart_offsets_and_append() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("log.txt"), b"0123456789").unwrap();
        let factory = LocalFileSystemFactory::new(temp_dir.path()).unwrap();
        let fs = factory.create(&Principal::user("bob")).unwrap();
        let log = parts(&["log.txt"]);

        assert_eq!(read_from(fs.as_ref(), &log, 6).await, b"6789");
        assert_eq!(fs.open_read(&log, 11).await.err().unwrap().code(), 550);

        let mut w = fs.create(&log, 4).await.unwrap();
        w.write_all(b"ab").await.unwrap();
        w.shutdown().await.unwrap();
        drop(w);
        assert_eq!(read_from(fs.as_ref(), &log, 0).await, b"0123ab");

        let mut w = fs.append(&log).await.unwrap();
        w.write_all(b"+").await.unwrap();
        w.shutdown().await.unwrap();
        drop(w);
        assert_eq!(read_from(fs.as_ref(), &log, 0).await, b"0123ab+");
    }

    #[tokio::test]
    async fn rename_moves_within_the_root() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        fs::write(temp_dir.path().join("a.txt"), b"a").unwrap();
        let factory = LocalFileSystemFactory::new(temp_dir.path()).unwrap();
        let fs = factory.create(&Principal::user("bob")).unwrap();

        fs.rename(&parts(&["a.txt"]), &parts(&["sub", "b.txt"])).await.unwrap();
        assert!(!temp_dir.path().join("a.txt").exists());
        assert_eq!(std::fs::read(temp_dir.path().join("sub/b.txt")).unwrap(), b"a");
        assert_eq!(fs.rename(&parts(&["a.txt"]), &parts(&["c.txt"])).await.err().unwrap().code(), 550);
        assert_eq!(fs.rename(&[], &parts(&["c.txt"])).await.err().unwrap().code(), 550);
    }

    #[tokio::test]
    async fn anonymous_users_are_read_only() {
        let temp_dir = TempDir::new().unwrap();
        let factory = LocalFileSystemFactory::new(temp_dir.path()).unwrap();
        let fs = factory.create(&Principal::anonymous("guest@")).unwrap();
        let err = fs.create(&parts(&["x"]), 0).await.err().unwrap();
        assert_eq!(err.code(), 550);
        assert_eq!(fs.append(&parts(&["x"])).await.err().unwrap().code(), 550);
        assert_eq!(fs.rename(&parts(&["x"]), &parts(&["y"])).await.err().unwrap().code(), 550);
    }
}
