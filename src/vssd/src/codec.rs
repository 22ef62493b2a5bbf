//! Exact little-endian serialization of the vSSD tree.

use thiserror::Error;

use ocnvm::Geometry;

use super::{VChannel, VLun, VUnit, Vssd, SERIALIZE_MAGIC};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer does not start with the vSSD magic.
    #[error("bad serialize magic {0:#x}")]
    BadMagic(u32),
    /// The buffer ended inside a field.
    #[error("unexpected end of buffer at offset {0}")]
    UnexpectedEnd(usize),
    /// A device name was not NUL-terminated within its declared length.
    #[error("malformed device name")]
    BadName,
}

fn pad4(len: usize) -> usize {
    (len + 3) / 4 * 4
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < n {
            return Err(CodecError::UnexpectedEnd(self.pos));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn get_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn get_u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }
}

pub(crate) fn encoded_len(vssd: &Vssd) -> usize {
    // magic + id + unit count
    let mut len = 12;
    for unit in &vssd.units {
        // name length field + NUL-terminated name padded to 4
        len += 4 + pad4(unit.dev_name.len() + 1);
        // nine u64 geometry fields + channel count
        len += 72 + 4;
        for ch in &unit.channels {
            len += 16;
            if ch.shared {
                len += 12 * ch.luns.len();
            }
        }
    }
    len
}

pub(crate) fn encode(vssd: &Vssd) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(vssd));

    put_u32(&mut out, SERIALIZE_MAGIC);
    put_u32(&mut out, vssd.id);
    put_u32(&mut out, vssd.units.len() as u32);
    for unit in &vssd.units {
        encode_unit(&mut out, unit);
    }

    out
}

fn encode_unit(out: &mut Vec<u8>, unit: &VUnit) {
    let name_len = unit.dev_name.len() + 1;
    put_u32(out, name_len as u32);
    out.extend_from_slice(unit.dev_name.as_bytes());
    out.resize(out.len() + pad4(name_len) - unit.dev_name.len(), 0);

    encode_geometry(out, &unit.geometry);

    put_u32(out, unit.channels.len() as u32);
    for ch in &unit.channels {
        encode_channel(out, ch);
    }
}

fn encode_geometry(out: &mut Vec<u8>, geo: &Geometry) {
    put_u64(out, geo.nchannels);
    put_u64(out, geo.nluns);
    put_u64(out, geo.nplanes);
    put_u64(out, geo.nblocks);
    put_u64(out, geo.npages);
    put_u64(out, geo.nsectors);
    put_u64(out, geo.page_nbytes);
    put_u64(out, geo.sector_nbytes);
    put_u64(out, geo.meta_nbytes);
}

fn encode_channel(out: &mut Vec<u8>, ch: &VChannel) {
    put_u32(out, ch.channel_id);
    put_u32(out, ch.shared as u32);
    put_u32(out, ch.total_blocks);
    put_u32(out, ch.num_luns);
    if ch.shared {
        for lun in &ch.luns {
            put_u32(out, lun.lun_id);
            put_u32(out, lun.block_start);
            put_u32(out, lun.num_blocks);
        }
    }
}

pub(crate) fn decode(buf: &[u8]) -> Result<(Vssd, usize), CodecError> {
    let mut cur = Cursor::new(buf);

    let magic = cur.get_u32()?;
    if magic != SERIALIZE_MAGIC {
        return Err(CodecError::BadMagic(magic));
    }

    let id = cur.get_u32()?;
    let num_units = cur.get_u32()?;
    let mut units = Vec::with_capacity(num_units as usize);
    for _ in 0..num_units {
        units.push(decode_unit(&mut cur)?);
    }

    Ok((Vssd { id, units }, cur.pos))
}

fn decode_unit(cur: &mut Cursor) -> Result<VUnit, CodecError> {
    let name_len = cur.get_u32()? as usize;
    let name_field = cur.take(pad4(name_len))?;
    // The declared length includes the NUL terminator.
    let name_bytes = name_field
        .get(..name_len.saturating_sub(1))
        .ok_or(CodecError::BadName)?;
    let dev_name = std::str::from_utf8(name_bytes)
        .map_err(|_| CodecError::BadName)?
        .to_string();

    let geometry = decode_geometry(cur)?;

    let num_channels = cur.get_u32()?;
    let mut channels = Vec::with_capacity(num_channels as usize);
    for _ in 0..num_channels {
        channels.push(decode_channel(cur)?);
    }

    Ok(VUnit {
        dev_name,
        geometry,
        channels,
    })
}

fn decode_geometry(cur: &mut Cursor) -> Result<Geometry, CodecError> {
    Ok(Geometry {
        nchannels: cur.get_u64()?,
        nluns: cur.get_u64()?,
        nplanes: cur.get_u64()?,
        nblocks: cur.get_u64()?,
        npages: cur.get_u64()?,
        nsectors: cur.get_u64()?,
        page_nbytes: cur.get_u64()?,
        sector_nbytes: cur.get_u64()?,
        meta_nbytes: cur.get_u64()?,
    })
}

fn decode_channel(cur: &mut Cursor) -> Result<VChannel, CodecError> {
    let channel_id = cur.get_u32()?;
    let shared = cur.get_u32()? == 1;
    let total_blocks = cur.get_u32()?;
    let num_luns = cur.get_u32()?;

    let mut luns = Vec::new();
    if shared {
        luns.reserve(num_luns as usize);
        for _ in 0..num_luns {
            luns.push(VLun {
                lun_id: cur.get_u32()?,
                block_start: cur.get_u32()?,
                num_blocks: cur.get_u32()?,
            });
        }
    }

    Ok(VChannel {
        channel_id,
        shared,
        total_blocks,
        num_luns,
        luns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            nchannels: 16,
            nluns: 8,
            nplanes: 2,
            nblocks: 1020,
            npages: 512,
            nsectors: 4,
            page_nbytes: 16384,
            sector_nbytes: 4096,
            meta_nbytes: 16,
        }
    }

    fn mixed_vssd() -> Vssd {
        let mut unit0 = VUnit::new("/dev/nvme0n1", geometry());
        unit0.channels.push(VChannel::shared(
            0,
            vec![
                VLun {
                    lun_id: 0,
                    block_start: 0,
                    num_blocks: 4,
                },
                VLun {
                    lun_id: 3,
                    block_start: 10,
                    num_blocks: 6,
                },
            ],
        ));
        unit0.channels.push(VChannel::exclusive(4, 8160, 8));

        let mut unit1 = VUnit::new("/dev/nvme1n1", geometry());
        unit1.channels.push(VChannel::shared(
            1,
            vec![VLun {
                lun_id: 2,
                block_start: 512,
                num_blocks: 16,
            }],
        ));

        Vssd {
            id: 42,
            units: vec![unit0, unit1],
        }
    }

    #[test]
    fn round_trip_identity() {
        let vssd = mixed_vssd();
        let bytes = vssd.encode();
        let (decoded, consumed) = Vssd::decode(&bytes).unwrap();
        assert_eq!(decoded, vssd);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn encoded_len_matches_encoding() {
        let vssd = mixed_vssd();
        assert_eq!(vssd.encoded_len(), vssd.encode().len());

        let empty = Vssd { id: 0, units: vec![] };
        assert_eq!(empty.encoded_len(), 12);
        assert_eq!(empty.encode().len(), 12);
    }

    #[test]
    fn empty_vssd_round_trips() {
        let vssd = Vssd { id: 9, units: vec![] };
        let bytes = vssd.encode();
        let (decoded, consumed) = Vssd::decode(&bytes).unwrap();
        assert_eq!(decoded, vssd);
        assert_eq!(consumed, 12);
    }

    #[test]
    fn header_layout_is_exact() {
        let vssd = Vssd { id: 3, units: vec![] };
        let bytes = vssd.encode();
        assert_eq!(&bytes[0..4], &0x6502u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0u32.to_le_bytes());
    }

    #[test]
    fn name_is_nul_terminated_and_padded() {
        // "/dev/nvme0n1" is 12 bytes; with NUL that is 13, padded to 16.
        let unit = VUnit::new("/dev/nvme0n1", geometry());
        let vssd = Vssd {
            id: 0,
            units: vec![unit],
        };
        let bytes = vssd.encode();
        assert_eq!(&bytes[12..16], &13u32.to_le_bytes());
        assert_eq!(&bytes[16..28], b"/dev/nvme0n1");
        assert_eq!(&bytes[28..32], &[0, 0, 0, 0]);

        // A name of length 3 pads the same way as one of length 0 mod 4.
        for name in ["abc", "abcd", "abcde"] {
            let vssd = Vssd {
                id: 0,
                units: vec![VUnit::new(name, geometry())],
            };
            let (decoded, _) = Vssd::decode(&vssd.encode()).unwrap();
            assert_eq!(decoded.units[0].dev_name, name);
        }
    }

    #[test]
    fn exclusive_channel_skips_lun_list_on_wire() {
        let mut with_luns = VUnit::new("d", geometry());
        with_luns.channels.push(VChannel::exclusive(2, 8160, 8));
        let vssd = Vssd {
            id: 0,
            units: vec![with_luns],
        };
        // unit header: 4 + pad4(2) + 72 + 4 = 84; channel: 16; total 12 + 100.
        assert_eq!(vssd.encode().len(), 12 + 84 + 16);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let vssd = mixed_vssd();
        let mut bytes = vssd.encode();
        bytes[0..4].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        assert_eq!(
            Vssd::decode(&bytes),
            Err(CodecError::BadMagic(0xdead_beef))
        );
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let bytes = mixed_vssd().encode();
        for cut in [0, 3, 11, 20, bytes.len() - 1] {
            assert!(matches!(
                Vssd::decode(&bytes[..cut]),
                Err(CodecError::BadMagic(_) | CodecError::UnexpectedEnd(_))
            ));
        }
    }

    #[test]
    fn decode_leaves_trailing_bytes() {
        let vssd = mixed_vssd();
        let mut bytes = vssd.encode();
        let len = bytes.len();
        bytes.extend_from_slice(&[0xaa; 7]);
        let (decoded, consumed) = Vssd::decode(&bytes).unwrap();
        assert_eq!(decoded, vssd);
        assert_eq!(consumed, len);
    }
}
