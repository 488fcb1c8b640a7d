use crate::types::{OutOfMemory, Size, PAGE_SIZE_BYTES};
use std::cmp::min;
use std::mem::size_of;

/// A linear, page-granular memory the allocator lives in. Growth never moves bytes that are
/// already there.
pub trait MemContext {
    fn size_pages(&self) -> u64;
    /// Returns the size in pages before the growth.
    fn grow(&mut self, new_pages: u64) -> Result<u64, OutOfMemory>;
    fn read(&self, offset: u64, buf: &mut [u8]);
    fn write(&mut self, offset: u64, buf: &[u8]);

    fn size_bytes(&self) -> u64 {
        self.size_pages() * PAGE_SIZE_BYTES as u64
    }

    fn read_word(&self, offset: u64) -> Size {
        let mut buf = [0u8; size_of::<Size>()];
        self.read(offset, &mut buf);

        Size::from_le_bytes(buf)
    }

    fn write_word(&mut self, offset: u64, word: Size) {
        self.write(offset, &word.to_le_bytes());
    }

    fn read_u64(&self, offset: u64) -> u64 {
        let mut buf = [0u8; size_of::<u64>()];
        self.read(offset, &mut buf);

        u64::from_le_bytes(buf)
    }

    fn write_u64(&mut self, offset: u64, value: u64) {
        self.write(offset, &value.to_le_bytes());
    }
}

#[cfg(target_family = "wasm")]
#[derive(Default, Clone)]
pub struct StableMemContext;

#[cfg(target_family = "wasm")]
impl MemContext for StableMemContext {
    fn size_pages(&self) -> u64 {
        ic_cdk::api::stable::stable64_size()
    }

    fn grow(&mut self, new_pages: u64) -> Result<u64, OutOfMemory> {
        ic_cdk::api::stable::stable64_grow(new_pages).map_err(|_| OutOfMemory)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) {
        ic_cdk::api::stable::stable64_read(offset, buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) {
        ic_cdk::api::stable::stable64_write(offset, buf)
    }
}

/// Heap memory in the current process. `max_pages` caps the growth, so exhaustion can be
/// reproduced.
#[derive(Default, Clone)]
pub struct VecMemContext {
    pub pages: Vec<[u8; PAGE_SIZE_BYTES]>,
    pub max_pages: Option<u64>,
}

impl VecMemContext {
    pub fn with_max_pages(max_pages: u64) -> Self {
        Self {
            pages: Vec::new(),
            max_pages: Some(max_pages),
        }
    }
}

impl MemContext for VecMemContext {
    fn size_pages(&self) -> u64 {
        self.pages.len() as u64
    }

    fn grow(&mut self, new_pages: u64) -> Result<u64, OutOfMemory> {
        let prev_pages = self.size_pages();

        if let Some(max_pages) = self.max_pages {
            if prev_pages + new_pages > max_pages {
                return Err(OutOfMemory);
            }
        }

        for _ in 0..new_pages {
            self.pages.push([0u8; PAGE_SIZE_BYTES]);
        }

        Ok(prev_pages)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) {
        let mut done = 0usize;

        while done < buf.len() {
            let cur = offset + done as u64;
            let page_idx = (cur / PAGE_SIZE_BYTES as u64) as usize;
            let inner_idx = (cur % PAGE_SIZE_BYTES as u64) as usize;
            let len = min(PAGE_SIZE_BYTES - inner_idx, buf.len() - done);

            buf[done..(done + len)]
                .copy_from_slice(&self.pages[page_idx][inner_idx..(inner_idx + len)]);

            done += len;
        }
    }

    fn write(&mut self, offset: u64, buf: &[u8]) {
        let mut done = 0usize;

        while done < buf.len() {
            let cur = offset + done as u64;
            let page_idx = (cur / PAGE_SIZE_BYTES as u64) as usize;
            let inner_idx = (cur % PAGE_SIZE_BYTES as u64) as usize;
            let len = min(PAGE_SIZE_BYTES - inner_idx, buf.len() - done);

            self.pages[page_idx][inner_idx..(inner_idx + len)]
                .copy_from_slice(&buf[done..(done + len)]);

            done += len;
        }
    }
}

#[cfg(target_family = "wasm")]
pub type DefaultMemContext = StableMemContext;

#[cfg(not(target_family = "wasm"))]
pub type DefaultMemContext = VecMemContext;
