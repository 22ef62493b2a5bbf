//! Request framing.
//!
//! Every request is a fixed 24-byte little-endian frame whose first four
//! bytes select the decoder. A write frame is followed by `count` payload
//! bytes. Responses are not framed: an alloc reply is an encoded vSSD, a
//! read reply is raw data, and write/erase produce no reply.

use std::fmt;

use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use vssd::AllocRequest;

pub mod defs {
    /// Fixed size of every request frame.
    pub const REQUEST_SIZE: usize = 24;

    pub const ALLOC_MAGIC: u32 = 0x6501;
    pub const READ_MAGIC: u32 = 0x6401;
    pub const WRITE_MAGIC: u32 = 0x6402;
    pub const ERASE_MAGIC: u32 = 0x6403;
}

/// vSSD allocation frame.
#[repr(C)]
#[derive(Copy, Clone, FromBytes, AsBytes, Unaligned)]
pub struct AllocFrame {
    magic: U32<LittleEndian>,
    num_channels: U32<LittleEndian>,
    num_blocks: U32<LittleEndian>,
    shared: U32<LittleEndian>,
    numa_id: U32<LittleEndian>,
    remote: U32<LittleEndian>,
}

impl AllocFrame {
    pub fn new(request: &AllocRequest) -> Self {
        Self {
            magic: U32::new(defs::ALLOC_MAGIC),
            num_channels: U32::new(request.num_channels),
            num_blocks: U32::new(request.num_blocks),
            shared: U32::new(request.shared as u32),
            numa_id: U32::new(request.numa_id),
            remote: U32::new(request.remote as u32),
        }
    }
}

/// Block I/O frame, shared by read/write/erase. Erase ignores `count` and
/// `offset`; write ignores `offset` (writes append).
#[repr(C)]
#[derive(Copy, Clone, FromBytes, AsBytes, Unaligned)]
pub struct IoFrame {
    magic: U32<LittleEndian>,
    block_index: U32<LittleEndian>,
    count: U64<LittleEndian>,
    offset: U64<LittleEndian>,
}

impl IoFrame {
    pub fn read(block_index: u32, count: u64, offset: u64) -> Self {
        Self::with_magic(defs::READ_MAGIC, block_index, count, offset)
    }

    pub fn write(block_index: u32, count: u64) -> Self {
        Self::with_magic(defs::WRITE_MAGIC, block_index, count, 0)
    }

    pub fn erase(block_index: u32) -> Self {
        Self::with_magic(defs::ERASE_MAGIC, block_index, 0, 0)
    }

    fn with_magic(magic: u32, block_index: u32, count: u64, offset: u64) -> Self {
        Self {
            magic: U32::new(magic),
            block_index: U32::new(block_index),
            count: U64::new(count),
            offset: U64::new(offset),
        }
    }
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Alloc(AllocRequest),
    Read {
        block_index: u32,
        count: u64,
        offset: u64,
    },
    Write {
        block_index: u32,
        count: u64,
    },
    Erase {
        block_index: u32,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// The first four bytes of a fresh frame match no known request.
    UnknownMagic(u32),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::UnknownMagic(magic) => write!(f, "unknown request magic {magic:#x}"),
        }
    }
}

/// Decode one frame. The magic selects the layout; anything else is a
/// protocol error and the connection must be dropped.
pub fn parse(frame: &[u8; defs::REQUEST_SIZE]) -> Result<Request, FrameError> {
    let magic = u32::from_le_bytes(frame[..4].try_into().unwrap());
    match magic {
        defs::ALLOC_MAGIC => {
            let f = AllocFrame::read_from(&frame[..]).unwrap();
            Ok(Request::Alloc(AllocRequest {
                num_channels: f.num_channels.get(),
                num_blocks: f.num_blocks.get(),
                shared: f.shared.get() == 1,
                numa_id: f.numa_id.get(),
                remote: f.remote.get() == 1,
            }))
        }
        defs::READ_MAGIC | defs::WRITE_MAGIC | defs::ERASE_MAGIC => {
            let f = IoFrame::read_from(&frame[..]).unwrap();
            let block_index = f.block_index.get();
            Ok(match magic {
                defs::READ_MAGIC => Request::Read {
                    block_index,
                    count: f.count.get(),
                    offset: f.offset.get(),
                },
                defs::WRITE_MAGIC => Request::Write {
                    block_index,
                    count: f.count.get(),
                },
                _ => Request::Erase { block_index },
            })
        }
        other => Err(FrameError::UnknownMagic(other)),
    }
}
