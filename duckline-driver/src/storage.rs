//! Flash filesystem adapter.
//!
//! A host directory stands in for the flash partition. Besides the plain
//! file operations the adapter supports stream mode: while a stream is
//! open, console input bypasses command parsing and is written straight to
//! the file (only `close` and `read` still execute).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Nominal flash partition size, reported by `mem`.
pub const FLASH_CAPACITY: u64 = 2 * 1024 * 1024;

/// Chunk size of the stream `read` command.
const STREAM_READ_CHUNK: usize = 1024;

pub struct Storage {
    root: PathBuf,
    stream: Option<StreamState>,
}

struct StreamState {
    path: PathBuf,
    write: File,
    read_pos: u64,
}

impl Storage {
    /// Open (creating if needed) the storage directory.
    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Storage {
            root: root.as_ref().to_path_buf(),
            stream: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let rel = name.trim_start_matches('/');
        let rel_path = Path::new(rel);
        if rel.is_empty()
            || rel_path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad file name"));
        }
        Ok(self.root.join(rel_path))
    }

    /// List files under a directory, one `name size` pair per line.
    pub fn list(&self, path: &str) -> io::Result<String> {
        let dir = if path.trim_start_matches('/').is_empty() {
            self.root.clone()
        } else {
            self.resolve(path)?
        };
        let mut names: Vec<(String, u64)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                names.push((entry.file_name().to_string_lossy().to_string(), meta.len()));
            }
        }
        names.sort();
        let mut out = String::new();
        for (name, size) in names {
            out.push_str(&format!("{} {}\n", name, size));
        }
        Ok(out)
    }

    pub fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(name)?)
    }

    pub fn create(&self, name: &str) -> io::Result<()> {
        File::create(self.resolve(name)?)?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(name)?)
    }

    pub fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.resolve(from)?, self.resolve(to)?)
    }

    /// Append to a file, creating it if missing.
    pub fn append(&self, name: &str, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.resolve(name)?)?;
        file.write_all(data)
    }

    /// Remove every file in the root.
    pub fn format(&mut self) -> io::Result<()> {
        self.stream = None;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.metadata()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Open a file for the script streamer.
    pub fn open(&self, name: &str) -> io::Result<File> {
        File::open(self.resolve(name)?)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn size(&self) -> u64 {
        FLASH_CAPACITY
    }

    pub fn used_bytes(&self) -> u64 {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(meta) = entry.metadata() {
                    if meta.is_file() {
                        total += meta.len();
                    }
                }
            }
        }
        total
    }

    pub fn free_bytes(&self) -> u64 {
        self.size().saturating_sub(self.used_bytes())
    }

    // ===== Stream mode =====

    pub fn streaming(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream_open(&mut self, name: &str) -> io::Result<()> {
        let path = self.resolve(name)?;
        let write = OpenOptions::new().create(true).append(true).open(&path)?;
        self.stream = Some(StreamState {
            path,
            write,
            read_pos: 0,
        });
        Ok(())
    }

    pub fn stream_close(&mut self) {
        self.stream = None;
    }

    pub fn stream_write(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.stream {
            Some(state) => state.write.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no open stream")),
        }
    }

    pub fn stream_available(&self) -> bool {
        match &self.stream {
            Some(state) => match fs::metadata(&state.path) {
                Ok(meta) => state.read_pos < meta.len(),
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Read the next chunk from the streamed file.
    pub fn stream_read(&mut self) -> io::Result<Vec<u8>> {
        let state = match &mut self.stream {
            Some(s) => s,
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "no open stream")),
        };
        state.write.flush()?;
        let mut file = File::open(&state.path)?;
        file.seek(SeekFrom::Start(state.read_pos))?;
        let mut buf = vec![0u8; STREAM_READ_CHUNK];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        state.read_pos += n as u64;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_create_write_read_remove() {
        let (_dir, storage) = make_storage();
        storage.create("a.txt").unwrap();
        storage.append("a.txt", b"one ").unwrap();
        storage.append("a.txt", b"two").unwrap();
        assert_eq!(storage.read("a.txt").unwrap(), b"one two");
        storage.remove("a.txt").unwrap();
        assert!(!storage.exists("a.txt"));
    }

    #[test]
    fn test_list_and_usage() {
        let (_dir, storage) = make_storage();
        storage.append("b.txt", b"xyz").unwrap();
        storage.append("a.txt", b"12345").unwrap();
        let listing = storage.list("/").unwrap();
        assert_eq!(listing, "a.txt 5\nb.txt 3\n");
        assert_eq!(storage.used_bytes(), 8);
        assert_eq!(storage.free_bytes(), FLASH_CAPACITY - 8);
    }

    #[test]
    fn test_rename() {
        let (_dir, storage) = make_storage();
        storage.append("old.txt", b"data").unwrap();
        storage.rename("old.txt", "new.txt").unwrap();
        assert!(!storage.exists("old.txt"));
        assert_eq!(storage.read("new.txt").unwrap(), b"data");
    }

    #[test]
    fn test_format_clears_files() {
        let (_dir, mut storage) = make_storage();
        storage.append("a.txt", b"1").unwrap();
        storage.append("b.txt", b"2").unwrap();
        storage.format().unwrap();
        assert_eq!(storage.used_bytes(), 0);
    }

    #[test]
    fn test_traversal_rejected() {
        let (_dir, storage) = make_storage();
        assert!(storage.read("../outside").is_err());
        assert!(storage.create("").is_err());
    }

    #[test]
    fn test_stream_mode() {
        let (_dir, mut storage) = make_storage();
        assert!(!storage.streaming());
        storage.stream_open("s.txt").unwrap();
        assert!(storage.streaming());
        storage.stream_write(b"line one\n").unwrap();
        storage.stream_write(b"line two\n").unwrap();
        assert!(storage.stream_available());
        let chunk = storage.stream_read().unwrap();
        assert_eq!(chunk, b"line one\nline two\n");
        assert!(!storage.stream_available());
        storage.stream_close();
        assert!(!storage.streaming());
        assert_eq!(storage.read("s.txt").unwrap(), b"line one\nline two\n");
    }
}
