//! Worker-side cache of shared-memory buffers, keyed by object name.
//!
//! Opening and mapping a shared-memory object is paid once per name; the
//! buffer then stays mapped across requests. Cached buffers are opened by
//! name and therefore never unlink the underlying object.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;

use crate::ShmBuffer;

#[derive(Default)]
pub struct ShmCache {
    buffers: HashMap<String, ShmBuffer>,
}

impl ShmCache {
    pub fn new() -> ShmCache {
        ShmCache::default()
    }

    /// Fetch the buffer for `name`, opening it on first use. The logical
    /// data size is reset; the mapping is kept from the previous request.
    pub fn get(&mut self, name: &str) -> io::Result<&mut ShmBuffer> {
        let buf = match self.buffers.entry(name.to_owned()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => v.insert(ShmBuffer::open(Some(name), true)?),
        };
        buf.set_data_size(0);
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::REQUEST_CHUNK;

    #[test]
    fn get_opens_once_and_resets_data_size() {
        let mut owner = ShmBuffer::open(None, true).unwrap();
        owner.reset_defaults(REQUEST_CHUNK).unwrap();
        let name = owner.name().to_owned();

        let mut cache = ShmCache::new();
        {
            let buf = cache.get(&name).unwrap();
            buf.update_file_size(REQUEST_CHUNK as u64);
            buf.map(0, REQUEST_CHUNK).unwrap();
            buf.set_data_size(77);
        }
        assert_eq!(cache.len(), 1);

        let again = cache.get(&name).unwrap();
        assert_eq!(again.data_size(), 0);
        // Mapping survives between requests.
        assert!(again.is_mapped());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn get_unknown_name_fails() {
        let mut cache = ShmCache::new();
        assert!(cache.get("/pruv-shm-missing").is_err());
    }

    #[test]
    fn cached_buffer_does_not_unlink() {
        let owner = ShmBuffer::open(None, true).unwrap();
        let name = owner.name().to_owned();
        {
            let mut cache = ShmCache::new();
            cache.get(&name).unwrap();
            // cache dropped here
        }
        // Object still exists: only the owner unlinks it.
        let reopen = ShmBuffer::open(Some(&name), true).unwrap();
        drop(reopen);
        owner.close().unwrap();
    }
}
