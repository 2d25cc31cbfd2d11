use bytes::Bytes;
use lazy_static::lazy_static;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::content::{ContentDescriptor, Md5Supplier};
use crate::database::ContentUpdater;
use crate::provider::{FileKind, ProviderPathKey, WriteRequestFlags};
use crate::Error;

pub const HELLOWORLD_CONTENTS: &[u8] = b"Hello World!";
pub const EMPTY_CONTENTS: &[u8] = b"";

lazy_static! {
    pub static ref CONTENTS_A: Bytes = vec![0x00, 0x01].into();
    pub static ref CONTENTS_B: Bytes = (0..255).collect::<Vec<u8>>().repeat(16).into();

    pub static ref HASH_A: ContentDescriptor = Md5Supplier::describe(&CONTENTS_A);
    pub static ref HASH_B: ContentDescriptor = Md5Supplier::describe(&CONTENTS_B);
    pub static ref HELLOWORLD_HASH: ContentDescriptor = Md5Supplier::describe(HELLOWORLD_CONTENTS);
}

/// Writes fixed bytes to a location, counting its invocations.
pub struct BytesUpdater {
    pub key: ProviderPathKey,
    pub data: Bytes,
    pub calls: AtomicUsize,
    /// Copy the bytes into the stream passed to `update_with_stream`.
    pub streaming: bool,
}

impl BytesUpdater {
    pub fn new(key: &ProviderPathKey, data: impl Into<Bytes>) -> Self {
        Self {
            key: key.clone(),
            data: data.into(),
            calls: AtomicUsize::new(0),
            streaming: false,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ContentUpdater for BytesUpdater {
    fn update(&self) -> Result<(), Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let provider = self.key.provider();
        provider.ensure_write_request(
            self.key.path(),
            FileKind::File,
            WriteRequestFlags::DELETE_INTERMEDIATE,
        )?;
        provider.set_file_bytes(self.key.path(), &self.data)?;
        Ok(())
    }

    fn update_with_stream(&self, sink: &mut dyn Write) -> Result<bool, Error> {
        self.update()?;
        if !self.streaming {
            return Ok(false);
        }
        sink.write_all(&self.data).map_err(Error::SecondaryStream)?;
        Ok(true)
    }
}
