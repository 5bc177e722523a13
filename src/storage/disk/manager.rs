use crate::storage::page::{PageId, PAGE_SIZE};
use anyhow::{bail, Context, Result};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Raw page-sized I/O against a single database file.
///
/// Page ids map directly to file offsets (`page_id * PAGE_SIZE`). Allocation
/// of new page ids is the buffer pool's concern; the disk manager only moves
/// bytes.
pub struct DiskManager {
    file: File,
}

impl DiskManager {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create file: {:?}", path))?;

        Ok(Self { file })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open file: {:?}", path))?;

        Ok(Self { file })
    }

    /// Reads one page into `buf`. A read past the end of the file yields a
    /// zeroed buffer: the page was allocated but never written back.
    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let offset = Self::page_offset(page_id)?;
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            debug!("read of unwritten page {}, returning zeroes", page_id);
            buf.fill(0);
            return Ok(());
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.read_exact(buf).context("Failed to read page")?;

        Ok(())
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let offset = Self::page_offset(page_id)?;
        let file_size = self.file.metadata()?.len();

        // Extend file if necessary
        if offset >= file_size {
            let new_size = offset + PAGE_SIZE as u64;
            self.file
                .set_len(new_size)
                .context("Failed to extend file")?;
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.write_all(data).context("Failed to write page")?;
        self.file.sync_all().context("Failed to sync")?;

        Ok(())
    }

    /// The page's storage can be reused once the buffer pool drops it. The
    /// file is not shrunk; a dropped page simply stops being referenced.
    pub fn deallocate_page(&mut self, page_id: PageId) {
        debug!("deallocate page {}", page_id);
    }

    pub fn num_pages(&self) -> Result<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as u32)
    }

    fn page_offset(page_id: PageId) -> Result<u64> {
        if !page_id.is_valid() {
            bail!("invalid page id {}", page_id);
        }
        Ok(page_id.0 as u64 * PAGE_SIZE as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let dm = DiskManager::create(&file_path)?;
            assert_eq!(dm.num_pages()?, 0);
        }

        {
            let dm = DiskManager::open(&file_path)?;
            assert_eq!(dm.num_pages()?, 0);
        }

        Ok(())
    }

    #[test]
    fn test_write_and_read_page() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut dm = DiskManager::create(&file_path)?;

        let mut write_buf = [0u8; PAGE_SIZE];
        write_buf[0] = 42;
        write_buf[PAGE_SIZE - 1] = 24;
        dm.write_page(PageId(0), &write_buf)?;

        let mut read_buf = [0u8; PAGE_SIZE];
        dm.read_page(PageId(0), &mut read_buf)?;

        assert_eq!(read_buf[0], 42);
        assert_eq!(read_buf[PAGE_SIZE - 1], 24);

        Ok(())
    }

    #[test]
    fn test_read_unwritten_page_is_zeroed() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut dm = DiskManager::create(&file_path)?;

        let mut buf = [7u8; PAGE_SIZE];
        dm.read_page(PageId(10), &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0));

        Ok(())
    }

    #[test]
    fn test_invalid_page_id() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut dm = DiskManager::create(&file_path)?;

        let mut buf = [0u8; PAGE_SIZE];
        assert!(dm.read_page(crate::storage::INVALID_PAGE_ID, &mut buf).is_err());
        assert!(dm.write_page(crate::storage::INVALID_PAGE_ID, &buf).is_err());

        Ok(())
    }

    #[test]
    fn test_page_boundary() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut dm = DiskManager::create(&file_path)?;

        let buf1 = [1u8; PAGE_SIZE];
        let buf2 = [2u8; PAGE_SIZE];
        dm.write_page(PageId(0), &buf1)?;
        dm.write_page(PageId(1), &buf2)?;

        let mut read_buf = [0u8; PAGE_SIZE];
        dm.read_page(PageId(0), &mut read_buf)?;
        assert!(read_buf.iter().all(|&b| b == 1));

        dm.read_page(PageId(1), &mut read_buf)?;
        assert!(read_buf.iter().all(|&b| b == 2));

        Ok(())
    }

    #[test]
    fn test_persistence() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let mut dm = DiskManager::create(&file_path)?;
            let buf = [99u8; PAGE_SIZE];
            dm.write_page(PageId(0), &buf)?;
        }

        {
            let mut dm = DiskManager::open(&file_path)?;
            let mut buf = [0u8; PAGE_SIZE];
            dm.read_page(PageId(0), &mut buf)?;
            assert_eq!(buf[0], 99);
        }

        Ok(())
    }

    #[test]
    fn test_file_growth() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let mut dm = DiskManager::create(&file_path)?;

        assert_eq!(dm.num_pages()?, 0);

        let buf = [5u8; PAGE_SIZE];
        dm.write_page(PageId(5), &buf)?;

        assert_eq!(dm.num_pages()?, 6);

        Ok(())
    }
}
