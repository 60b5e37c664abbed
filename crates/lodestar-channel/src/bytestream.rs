//! Byte streams and the retry cache that tees them.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::Result;

/// A pull-based stream of byte slices with a known total length.
pub trait ByteStream: Send {
    /// Total payload length in bytes.
    fn length(&self) -> usize;

    /// Pulls the next slice, or `None` at end of stream.
    fn pull(&mut self) -> Result<Option<Bytes>>;

    /// Rewinds to the first slice, where supported.
    fn reset(&mut self);
}

/// A byte stream over an in-memory slice list.
#[derive(Debug, Clone, Default)]
pub struct SliceBuffer {
    slices: Vec<Bytes>,
    cursor: usize,
}

impl SliceBuffer {
    /// Creates a stream over `slices`.
    pub fn new(slices: Vec<Bytes>) -> SliceBuffer {
        SliceBuffer { slices, cursor: 0 }
    }

    /// Creates a single-slice stream.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> SliceBuffer {
        SliceBuffer::new(vec![bytes.into()])
    }
}

impl ByteStream for SliceBuffer {
    fn length(&self) -> usize {
        self.slices.iter().map(Bytes::len).sum()
    }

    fn pull(&mut self) -> Result<Option<Bytes>> {
        match self.slices.get(self.cursor) {
            Some(slice) => {
                self.cursor += 1;
                Ok(Some(slice.clone()))
            }
            None => Ok(None),
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

struct CacheShared {
    source: Option<Box<dyn ByteStream>>,
    slices: Vec<Bytes>,
}

/// Owns a source byte stream and the slices pulled from it so far.
///
/// Any number of [`CachingByteStream`] readers may be opened over one cache;
/// each re-reads the cached prefix and the first reader past the prefix pulls
/// from the source, teeing the slice into the cache for later readers. This is
/// how a sent message is replayed on a retry attempt.
#[derive(Clone)]
pub struct ByteStreamCache {
    length: usize,
    shared: Arc<Mutex<CacheShared>>,
}

impl ByteStreamCache {
    /// Creates a cache that tees `source`.
    pub fn new(source: Box<dyn ByteStream>) -> ByteStreamCache {
        ByteStreamCache {
            length: source.length(),
            shared: Arc::new(Mutex::new(CacheShared {
                source: Some(source),
                slices: Vec::new(),
            })),
        }
    }

    /// Total length of the underlying stream.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Opens a reader positioned at the start.
    pub fn reader(&self) -> CachingByteStream {
        CachingByteStream {
            cache: self.clone(),
            cursor: 0,
        }
    }
}

impl std::fmt::Debug for ByteStreamCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock().unwrap();
        f.debug_struct("ByteStreamCache")
            .field("length", &self.length)
            .field("cached_slices", &shared.slices.len())
            .field("source_drained", &shared.source.is_none())
            .finish()
    }
}

/// A re-readable cursor over a [`ByteStreamCache`].
pub struct CachingByteStream {
    cache: ByteStreamCache,
    cursor: usize,
}

impl ByteStream for CachingByteStream {
    fn length(&self) -> usize {
        self.cache.length()
    }

    fn pull(&mut self) -> Result<Option<Bytes>> {
        let mut shared = self.cache.shared.lock().unwrap();
        if let Some(slice) = shared.slices.get(self.cursor) {
            self.cursor += 1;
            return Ok(Some(slice.clone()));
        }
        let Some(source) = shared.source.as_mut() else {
            return Ok(None);
        };
        match source.pull()? {
            Some(slice) => {
                shared.slices.push(slice.clone());
                self.cursor += 1;
                Ok(Some(slice))
            }
            None => {
                shared.source = None;
                Ok(None)
            }
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}
