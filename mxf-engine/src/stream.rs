//! Seekable byte-stream helpers.
//!
//! The engine reads from any `Read + Seek` and writes to any `Write + Seek`.
//! This trait adds the `tell`/`size` queries the partition and index code
//! relies on.

use std::io::{Seek, SeekFrom};

use crate::error::Result;

/// Position and size queries for seekable streams.
pub trait StreamExt: Seek {
    /// Current byte position.
    fn tell(&mut self) -> Result<u64> {
        Ok(self.stream_position()?)
    }

    /// Total stream size. The current position is preserved.
    fn size(&mut self) -> Result<u64> {
        let pos = self.stream_position()?;
        let end = self.seek(SeekFrom::End(0))?;
        if pos != end {
            self.seek(SeekFrom::Start(pos))?;
        }
        Ok(end)
    }

    /// Seek to an absolute position.
    fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Skip `len` bytes forward.
    fn skip(&mut self, len: u64) -> Result<()> {
        let len = i64::try_from(len)
            .map_err(|_| crate::error::MxfError::Other(format!("skip length {} too large", len)))?;
        self.seek(SeekFrom::Current(len))?;
        Ok(())
    }
}

impl<S: Seek + ?Sized> StreamExt for S {}
