//! File-backed shared-memory buffer with a movable mapped window.

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use once_cell::sync::Lazy;

/// Default size of a request buffer and of the window the dispatcher reads
/// requests through.
pub const REQUEST_CHUNK: usize = 64 * 1024;
/// Default size of a response buffer and of the window responses are
/// written through.
pub const RESPONSE_CHUNK: usize = 128 * 1024;

/// Prefix of every shared-memory object name created by this process.
pub const NAME_PREFIX: &str = "/pruv-shm-";

static PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize });

fn page_mask() -> u64 {
    *PAGE_SIZE as u64 - 1
}

fn round_to_page(n: u64) -> u64 {
    (n + page_mask()) & !page_mask()
}

/// A POSIX shared-memory object with one mapped window.
///
/// Invariants: the window offset is page-aligned, the cursor stays inside
/// the window, and `window_offset + window_len <= file_size` once the file
/// has been sized.
pub struct ShmBuffer {
    fd: OwnedFd,
    name: String,
    /// This process generated the name and must `shm_unlink` it on close.
    owns_name: bool,
    writable: bool,
    file_size: u64,
    map_begin: *mut u8,
    map_len: usize,
    map_offset: u64,
    cursor: usize,
    data_size: u64,
}

// SAFETY: the mapping is owned by this value and never aliased by another
// ShmBuffer in the same process; it moves between tasks as a whole.
unsafe impl Send for ShmBuffer {}

impl ShmBuffer {
    /// Open a shared-memory object.
    ///
    /// With `name == None` a 128-bit random name is generated and the
    /// object is created exclusively with mode 0600; the new buffer owns
    /// the name and will unlink it on close. With `Some(name)` the
    /// existing object is opened and never unlinked.
    pub fn open(name: Option<&str>, writable: bool) -> io::Result<ShmBuffer> {
        let mut oflag = if writable { libc::O_RDWR } else { libc::O_RDONLY };
        let mut mode: libc::mode_t = 0;
        let owns_name = name.is_none();
        let name = match name {
            Some(n) => n.to_owned(),
            None => {
                oflag |= libc::O_CREAT | libc::O_EXCL;
                mode = libc::S_IRUSR | libc::S_IWUSR;
                format!("{}{:032x}", NAME_PREFIX, rand::random::<u128>())
            }
        };

        let cname = CString::new(name.as_str())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in shm name"))?;
        // SAFETY: cname is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(cname.as_ptr(), oflag, mode) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by shm_open and is owned by no one else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        if owns_name {
            tracing::info!(name = %name, fd = fd.as_raw_fd(), "created shared memory object");
        } else {
            tracing::debug!(name = %name, fd = fd.as_raw_fd(), "opened shared memory object");
        }

        Ok(ShmBuffer {
            fd,
            name,
            owns_name,
            writable,
            file_size: 0,
            map_begin: std::ptr::null_mut(),
            map_len: 0,
            map_offset: 0,
            cursor: 0,
            data_size: 0,
        })
    }

    /// Name of the underlying object, usable by another process.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current size of the backing file.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Logical number of meaningful bytes in the buffer.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn set_data_size(&mut self, n: u64) {
        self.data_size = n;
    }

    /// Grow or shrink the backing file to `new_size` rounded up to a page.
    pub fn resize(&mut self, new_size: u64) -> io::Result<()> {
        let new_size = round_to_page(new_size);
        loop {
            // SAFETY: fd is a valid open descriptor.
            let r = unsafe { libc::ftruncate(self.fd.as_raw_fd(), new_size as libc::off_t) };
            if r == 0 {
                self.file_size = new_size;
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Record a size change performed by another process (the worker
    /// reports its resizes over the control pipe).
    pub fn update_file_size(&mut self, new_file_size: u64) {
        #[cfg(debug_assertions)]
        {
            let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
            // SAFETY: fd is valid, st is sized for fstat's output.
            let r = unsafe { libc::fstat(self.fd.as_raw_fd(), st.as_mut_ptr()) };
            debug_assert_eq!(r, 0);
            // SAFETY: fstat succeeded and initialized st.
            let st = unsafe { st.assume_init() };
            debug_assert_eq!(st.st_size as u64, new_file_size);
        }
        self.file_size = new_file_size;
    }

    pub fn is_mapped(&self) -> bool {
        !self.map_begin.is_null()
    }

    /// Drop the current window, if any.
    pub fn unmap(&mut self) -> io::Result<()> {
        if self.map_begin.is_null() {
            return Ok(());
        }
        // SAFETY: map_begin/map_len describe a live mapping created below.
        let r = unsafe { libc::munmap(self.map_begin as *mut libc::c_void, self.map_len) };
        if r != 0 {
            return Err(io::Error::last_os_error());
        }
        self.map_begin = std::ptr::null_mut();
        self.map_len = 0;
        self.map_offset = 0;
        self.cursor = 0;
        Ok(())
    }

    /// Map the window `[offset, offset + size)`, rounding `size` up to a
    /// page. `offset` must be page-aligned. Remapping an identical window
    /// only rewinds the cursor. On failure the buffer is left unmapped.
    pub fn map(&mut self, offset: u64, size: usize) -> io::Result<()> {
        assert_eq!(offset & page_mask(), 0, "window offset must be page-aligned");
        let size = round_to_page(size as u64) as usize;
        if self.is_mapped() && self.map_offset == offset && self.map_len == size {
            self.cursor = 0;
            return Ok(());
        }
        self.unmap()?;

        let mut prot = libc::PROT_READ;
        if self.writable {
            prot |= libc::PROT_WRITE;
        }
        // SAFETY: fd is valid; size and offset are validated above; the
        // kernel picks the address.
        let p = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                prot,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        self.map_begin = p as *mut u8;
        self.map_len = size;
        self.map_offset = offset;
        self.cursor = 0;
        Ok(())
    }

    /// Ensure `pos` lies strictly inside the mapped window, remapping a
    /// window of at least `segment` bytes (page-rounded) when it does not,
    /// growing the file when the window would extend past its end. Leaves
    /// the cursor at `pos`.
    pub fn seek(&mut self, pos: u64, segment: usize) -> io::Result<()> {
        if self.is_mapped()
            && self.map_offset <= pos
            && pos < self.map_offset + self.map_len as u64
        {
            self.cursor = (pos - self.map_offset) as usize;
            return Ok(());
        }
        let base = pos & !page_mask();
        let mut len = round_to_page(segment as u64);
        if base + len <= pos {
            len += *PAGE_SIZE as u64;
        }
        if base + len > self.file_size {
            self.resize(base + len)?;
        }
        self.map(base, len as usize)?;
        self.cursor = (pos - base) as usize;
        Ok(())
    }

    /// Make `[pos, pos + len)` contiguously addressable, reusing the
    /// current window when it already covers the span. Leaves the cursor
    /// at `pos`. The file is not grown: the span must already exist.
    pub fn ensure_span(&mut self, pos: u64, len: u64) -> io::Result<()> {
        let base = pos & !page_mask();
        let end = pos + len;
        let covered = self.is_mapped()
            && self.map_offset <= base
            && end <= self.map_offset + self.map_len as u64;
        if !covered {
            self.map(base, (end - base) as usize)?;
        }
        self.cursor = (pos - self.map_offset) as usize;
        Ok(())
    }

    /// Append `data` after the current logical content, window by window,
    /// growing the file as needed and advancing `data_size`.
    pub fn append(&mut self, data: &[u8], window_size: usize) -> io::Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            self.seek(self.data_size, window_size)?;
            let window = self.remaining_mut();
            let n = std::cmp::min(window.len(), rest.len());
            window[..n].copy_from_slice(&rest[..n]);
            self.advance(n);
            self.data_size += n as u64;
            rest = &rest[n..];
        }
        Ok(())
    }

    /// `resize(size)` + `map(0, size)`. Used when a buffer returns to its
    /// pool.
    pub fn reset_defaults(&mut self, size: usize) -> io::Result<()> {
        if self.file_size != round_to_page(size as u64) {
            self.resize(size as u64)?;
        }
        self.map(0, size)
    }

    /// Absolute position of the cursor within the object.
    pub fn cur_pos(&self) -> u64 {
        self.map_offset + self.cursor as u64
    }

    /// Offset of the mapped window.
    pub fn window_offset(&self) -> u64 {
        self.map_offset
    }

    /// Length of the mapped window.
    pub fn window_len(&self) -> usize {
        self.map_len
    }

    /// Bytes from the cursor to the end of the window.
    pub fn remaining(&self) -> &[u8] {
        if self.map_begin.is_null() {
            return &[];
        }
        // SAFETY: cursor <= map_len and the mapping is live.
        unsafe {
            std::slice::from_raw_parts(self.map_begin.add(self.cursor), self.map_len - self.cursor)
        }
    }

    /// Mutable bytes from the cursor to the end of the window.
    pub fn remaining_mut(&mut self) -> &mut [u8] {
        if self.map_begin.is_null() {
            return &mut [];
        }
        // SAFETY: cursor <= map_len, the mapping is live and writable
        // mappings are only handed out through &mut self.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.map_begin.add(self.cursor),
                self.map_len - self.cursor,
            )
        }
    }

    /// Move the cursor forward by `n` bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.cursor + n <= self.map_len);
        self.cursor += n;
    }

    /// Unmap, unlink the name if this process owns it, close the
    /// descriptor.
    pub fn close(mut self) -> io::Result<()> {
        self.unmap()?;
        self.unlink_if_owner()?;
        // OwnedFd closes on drop.
        Ok(())
    }

    fn unlink_if_owner(&mut self) -> io::Result<()> {
        if !self.owns_name {
            return Ok(());
        }
        self.owns_name = false;
        let cname = CString::new(self.name.as_str())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in shm name"))?;
        // SAFETY: cname is a valid NUL-terminated string.
        let r = unsafe { libc::shm_unlink(cname.as_ptr()) };
        if r != 0 {
            return Err(io::Error::last_os_error());
        }
        tracing::info!(name = %self.name, "unlinked shared memory object");
        Ok(())
    }
}

impl Drop for ShmBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            tracing::error!(name = %self.name, error = %e, "munmap failed on drop");
        }
        if let Err(e) = self.unlink_if_owner() {
            tracing::error!(name = %self.name, error = %e, "shm_unlink failed on drop");
        }
    }
}

impl std::fmt::Debug for ShmBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmBuffer")
            .field("name", &self.name)
            .field("file_size", &self.file_size)
            .field("window_offset", &self.map_offset)
            .field("window_len", &self.map_len)
            .field("cursor", &self.cursor)
            .field("data_size", &self.data_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_names_and_sizes() {
        let mut buf = ShmBuffer::open(None, true).unwrap();
        assert!(buf.name().starts_with(NAME_PREFIX));
        assert_eq!(buf.name().len(), NAME_PREFIX.len() + 32);
        assert_eq!(buf.file_size(), 0);

        buf.resize(1).unwrap();
        assert_eq!(buf.file_size() % *PAGE_SIZE as u64, 0);
        assert!(buf.file_size() >= 1);
        buf.close().unwrap();
    }

    #[test]
    fn shared_across_opens() {
        let mut owner = ShmBuffer::open(None, true).unwrap();
        owner.reset_defaults(REQUEST_CHUNK).unwrap();
        owner.remaining_mut()[..4].copy_from_slice(b"ping");

        let mut other = ShmBuffer::open(Some(owner.name()), true).unwrap();
        other.update_file_size(owner.file_size());
        other.map(0, REQUEST_CHUNK).unwrap();
        assert_eq!(&other.remaining()[..4], b"ping");

        other.remaining_mut()[4..8].copy_from_slice(b"pong");
        assert_eq!(&owner.remaining()[..8], b"pingpong");

        other.close().unwrap();
        owner.close().unwrap();
    }

    #[test]
    fn open_missing_fails() {
        let err = ShmBuffer::open(Some("/pruv-shm-does-not-exist"), true).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn map_same_window_rewinds_cursor() {
        let mut buf = ShmBuffer::open(None, true).unwrap();
        buf.reset_defaults(REQUEST_CHUNK).unwrap();
        buf.advance(100);
        assert_eq!(buf.cur_pos(), 100);
        buf.map(0, REQUEST_CHUNK).unwrap();
        assert_eq!(buf.cur_pos(), 0);
        buf.close().unwrap();
    }

    #[test]
    fn seek_within_and_beyond_window() {
        let mut buf = ShmBuffer::open(None, true).unwrap();
        buf.reset_defaults(REQUEST_CHUNK).unwrap();

        buf.seek(10, REQUEST_CHUNK).unwrap();
        assert_eq!(buf.cur_pos(), 10);
        assert_eq!(buf.window_offset(), 0);

        // Past the window and the file: remaps and grows.
        let far = 3 * REQUEST_CHUNK as u64 + 17;
        buf.seek(far, REQUEST_CHUNK).unwrap();
        assert_eq!(buf.cur_pos(), far);
        assert_eq!(buf.window_offset() & (*PAGE_SIZE as u64 - 1), 0);
        assert!(buf.file_size() >= far);
        buf.close().unwrap();
    }

    #[test]
    fn seek_spanning_write_is_visible_from_offset_zero() {
        let mut buf = ShmBuffer::open(None, true).unwrap();
        buf.reset_defaults(REQUEST_CHUNK).unwrap();

        let pos = REQUEST_CHUNK as u64 - 1;
        buf.seek(pos, REQUEST_CHUNK).unwrap();
        buf.remaining_mut()[0] = 0xAB;

        let mut view = ShmBuffer::open(Some(buf.name()), false).unwrap();
        view.update_file_size(buf.file_size());
        view.seek(pos, REQUEST_CHUNK).unwrap();
        assert_eq!(view.remaining()[0], 0xAB);
        view.close().unwrap();
        buf.close().unwrap();
    }

    #[test]
    fn reset_defaults_clears_window_position() {
        let mut buf = ShmBuffer::open(None, true).unwrap();
        buf.reset_defaults(RESPONSE_CHUNK).unwrap();
        buf.seek(5 * RESPONSE_CHUNK as u64, RESPONSE_CHUNK).unwrap();
        buf.set_data_size(123);

        buf.reset_defaults(RESPONSE_CHUNK).unwrap();
        assert_eq!(buf.cur_pos(), 0);
        assert_eq!(buf.window_offset(), 0);
        assert_eq!(buf.file_size(), RESPONSE_CHUNK as u64);
    }

    #[test]
    fn ensure_span_maps_request_contiguously() {
        let mut buf = ShmBuffer::open(None, true).unwrap();
        buf.reset_defaults(REQUEST_CHUNK).unwrap();

        // Write a marker far past the default window, as a dispatcher
        // appending pipelined requests would.
        let pos = 2 * REQUEST_CHUNK as u64 + 100;
        buf.seek(pos, REQUEST_CHUNK).unwrap();
        buf.remaining_mut()[..5].copy_from_slice(b"hello");

        let mut reader = ShmBuffer::open(Some(buf.name()), false).unwrap();
        reader.update_file_size(buf.file_size());
        reader.ensure_span(pos, 5).unwrap();
        assert_eq!(&reader.remaining()[..5], b"hello");
        assert_eq!(reader.cur_pos(), pos);

        // A second span inside the same window keeps the mapping.
        let offset_before = reader.window_offset();
        reader.ensure_span(pos + 1, 3).unwrap();
        assert_eq!(reader.window_offset(), offset_before);
        reader.close().unwrap();
        buf.close().unwrap();
    }

    #[test]
    fn append_crosses_windows_and_grows_the_file() {
        let mut buf = ShmBuffer::open(None, true).unwrap();
        buf.reset_defaults(REQUEST_CHUNK).unwrap();

        let data: Vec<u8> = (0..3 * REQUEST_CHUNK).map(|i| i as u8).collect();
        buf.append(&data, REQUEST_CHUNK).unwrap();
        assert_eq!(buf.data_size(), data.len() as u64);
        assert!(buf.file_size() >= data.len() as u64);

        // Read it all back through fresh windows.
        let mut pos = 0u64;
        while pos < buf.data_size() {
            buf.seek(pos, REQUEST_CHUNK).unwrap();
            let avail =
                std::cmp::min(buf.remaining().len() as u64, buf.data_size() - pos) as usize;
            let got = &buf.remaining()[..avail];
            assert_eq!(got, &data[pos as usize..pos as usize + avail]);
            pos += avail as u64;
        }
        buf.close().unwrap();
    }

    #[test]
    fn close_unlinks_owned_name() {
        let buf = ShmBuffer::open(None, true).unwrap();
        let name = buf.name().to_owned();
        buf.close().unwrap();
        let err = ShmBuffer::open(Some(&name), true).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
