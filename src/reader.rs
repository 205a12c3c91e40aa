//! Cursor-style reads over a bounded byte slice: little-endian fixed-width
//! integers, NUL-terminated strings, LEB128, and DWARF exception-handling
//! encoded pointers.
//!
//! Every read is bounds-checked; running off the end of the slice yields
//! [`ReadError`] instead of panicking, so truncated input surfaces as a
//! parse error for the enclosing record.

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    #[error("read past the end of the byte slice")]
    UnexpectedEof,

    #[error("unsupported pointer value format {0:#04x}")]
    UnsupportedPointerFormat(u8),

    #[error("unsupported pointer application {0:#04x}")]
    UnsupportedPointerApplication(u8),
}

type Result<T> = core::result::Result<T, ReadError>;

pub const DW_EH_PE_absptr: u8 = 0x00;
pub const DW_EH_PE_uleb128: u8 = 0x01;
pub const DW_EH_PE_udata2: u8 = 0x02;
pub const DW_EH_PE_udata4: u8 = 0x03;
pub const DW_EH_PE_udata8: u8 = 0x04;
pub const DW_EH_PE_sleb128: u8 = 0x09;
pub const DW_EH_PE_sdata2: u8 = 0x0a;
pub const DW_EH_PE_sdata4: u8 = 0x0b;
pub const DW_EH_PE_sdata8: u8 = 0x0c;

pub const DW_EH_PE_pcrel: u8 = 0x10;
pub const DW_EH_PE_textrel: u8 = 0x20;
pub const DW_EH_PE_datarel: u8 = 0x30;
pub const DW_EH_PE_funcrel: u8 = 0x40;
pub const DW_EH_PE_aligned: u8 = 0x50;
pub const DW_EH_PE_indirect: u8 = 0x80;

pub const DW_EH_PE_omit: u8 = 0xff;

/// Relocation bases for the application nibble of an encoded pointer.
///
/// `pc` is the virtual address corresponding to position 0 of the reader's
/// slice; the pc-relative base for a given field is `pc` plus the field's
/// position, which the reader tracks itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct EncodingBases {
    pub pc: u64,
    pub text: u64,
    pub data: u64,
    pub func: u64,
}

/// A cursor over a byte slice. Reads advance the position.
#[derive(Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// A reader over the same slice, positioned at `pos`.
    pub fn new_at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(ReadError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(ReadError::UnexpectedEof);
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    /// Reads a NUL-terminated string and returns its bytes without the NUL.
    pub fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ReadError::UnexpectedEof)?;
        let s = &rest[..nul];
        self.pos += nul + 1;
        Ok(s)
    }

    pub fn read_uleb128(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= u64::from(byte & 0x7f) << shift;
            }
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    pub fn read_sleb128(&mut self) -> Result<i64> {
        let mut result: i64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= i64::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Reads a DWARF exception-handling encoded pointer.
    ///
    /// The low nibble of `encoding` selects the stored value's format, the
    /// high bits select how it is applied (relocated). `addr_size` is the
    /// module's address size in bytes, used for `DW_EH_PE_absptr`.
    pub fn read_encoded(
        &mut self,
        encoding: u8,
        bases: &EncodingBases,
        addr_size: u8,
    ) -> Result<u64> {
        if encoding & DW_EH_PE_indirect != 0 {
            // Indirect pointers require dereferencing live memory.
            return Err(ReadError::UnsupportedPointerApplication(DW_EH_PE_indirect));
        }
        let field_pos = self.pos as u64;
        let value = self.read_encoded_value(encoding, addr_size)?;
        match encoding & 0x70 {
            DW_EH_PE_absptr => Ok(value),
            DW_EH_PE_pcrel => Ok(bases.pc.wrapping_add(field_pos).wrapping_add(value)),
            DW_EH_PE_textrel => Ok(bases.text.wrapping_add(value)),
            DW_EH_PE_datarel => Ok(bases.data.wrapping_add(value)),
            DW_EH_PE_funcrel => Ok(bases.func.wrapping_add(value)),
            // aligned and indirect would require knowledge of the load
            // address and live memory access.
            app => Err(ReadError::UnsupportedPointerApplication(app)),
        }
    }

    fn read_encoded_value(&mut self, encoding: u8, addr_size: u8) -> Result<u64> {
        match encoding & 0x0f {
            DW_EH_PE_absptr => match addr_size {
                4 => Ok(u64::from(self.read_u32()?)),
                _ => self.read_u64(),
            },
            DW_EH_PE_uleb128 => self.read_uleb128(),
            DW_EH_PE_udata2 => Ok(u64::from(self.read_u16()?)),
            DW_EH_PE_udata4 => Ok(u64::from(self.read_u32()?)),
            DW_EH_PE_udata8 => self.read_u64(),
            DW_EH_PE_sleb128 => Ok(self.read_sleb128()? as u64),
            DW_EH_PE_sdata2 => Ok(self.read_u16()? as i16 as i64 as u64),
            DW_EH_PE_sdata4 => Ok(self.read_u32()? as i32 as i64 as u64),
            DW_EH_PE_sdata8 => self.read_u64(),
            fmt => Err(ReadError::UnsupportedPointerFormat(fmt)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inverse of `read_encoded`, for round-trip checks. Produces the bytes
    /// that decode to `target` when read at position `field_pos`.
    fn encode(target: u64, encoding: u8, bases: &EncodingBases, field_pos: u64) -> Vec<u8> {
        let value = match encoding & 0x70 {
            DW_EH_PE_absptr => target,
            DW_EH_PE_pcrel => target.wrapping_sub(bases.pc.wrapping_add(field_pos)),
            DW_EH_PE_textrel => target.wrapping_sub(bases.text),
            DW_EH_PE_datarel => target.wrapping_sub(bases.data),
            DW_EH_PE_funcrel => target.wrapping_sub(bases.func),
            app => panic!("cannot encode application {app:#x}"),
        };
        match encoding & 0x0f {
            DW_EH_PE_absptr | DW_EH_PE_udata8 | DW_EH_PE_sdata8 => value.to_le_bytes().to_vec(),
            DW_EH_PE_udata2 | DW_EH_PE_sdata2 => (value as u16).to_le_bytes().to_vec(),
            DW_EH_PE_udata4 | DW_EH_PE_sdata4 => (value as u32).to_le_bytes().to_vec(),
            fmt => panic!("cannot encode format {fmt:#x}"),
        }
    }

    #[test]
    fn fixed_width_little_endian() {
        let mut r = Reader::new(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(r.read_u16().unwrap(), 0x0201);
        assert_eq!(r.read_u32().unwrap(), 0x06050403);
        assert_eq!(r.read_u16().unwrap(), 0x0807);
        assert_eq!(r.read_u8(), Err(ReadError::UnexpectedEof));
    }

    #[test]
    fn cstr() {
        let mut r = Reader::new(b"zR\0rest");
        assert_eq!(r.read_cstr().unwrap(), b"zR");
        assert_eq!(r.pos(), 3);
        let mut r = Reader::new(b"no terminator");
        assert_eq!(r.read_cstr(), Err(ReadError::UnexpectedEof));
    }

    #[test]
    fn uleb128() {
        let cases: &[(&[u8], u64)] = &[
            (&[0x00], 0),
            (&[0x7f], 127),
            (&[0x80, 0x01], 128),
            (&[0xe5, 0x8e, 0x26], 624485),
        ];
        for (bytes, expected) in cases {
            assert_eq!(Reader::new(bytes).read_uleb128().unwrap(), *expected);
        }
        assert_eq!(
            Reader::new(&[0x80, 0x80]).read_uleb128(),
            Err(ReadError::UnexpectedEof)
        );
    }

    #[test]
    fn sleb128() {
        let cases: &[(&[u8], i64)] = &[
            (&[0x00], 0),
            (&[0x02], 2),
            (&[0x7e], -2),
            (&[0x78], -8),
            (&[0xff, 0x00], 127),
            (&[0x81, 0x7f], -127),
            (&[0x80, 0x01], 128),
            (&[0x80, 0x7f], -128),
        ];
        for (bytes, expected) in cases {
            assert_eq!(Reader::new(bytes).read_sleb128().unwrap(), *expected);
        }
    }

    #[test]
    fn encoded_pointer_roundtrip() {
        let bases = EncodingBases {
            pc: 0x4000,
            text: 0x1000,
            data: 0x8000,
            func: 0x2000,
        };
        let encodings = [
            DW_EH_PE_absptr,
            DW_EH_PE_udata4,
            DW_EH_PE_udata8,
            DW_EH_PE_sdata4 | DW_EH_PE_pcrel,
            DW_EH_PE_sdata8 | DW_EH_PE_pcrel,
            DW_EH_PE_udata4 | DW_EH_PE_textrel,
            DW_EH_PE_sdata4 | DW_EH_PE_datarel,
            DW_EH_PE_sdata4 | DW_EH_PE_funcrel,
        ];
        for &enc in &encodings {
            for &target in &[0x1080u64, 0x4fff, 0x9000] {
                let bytes = encode(target, enc, &bases, 0);
                let mut r = Reader::new(&bytes);
                assert_eq!(
                    r.read_encoded(enc, &bases, 8).unwrap(),
                    target,
                    "encoding {enc:#04x} target {target:#x}"
                );
            }
        }
    }

    #[test]
    fn encoded_pointer_pcrel_uses_field_position() {
        // A pc-relative field at position 8 of a section loaded at 0x4000
        // is relative to 0x4008.
        let bases = EncodingBases {
            pc: 0x4000,
            ..Default::default()
        };
        let mut data = vec![0u8; 8];
        data.extend_from_slice(&encode(0x5000, DW_EH_PE_sdata4 | DW_EH_PE_pcrel, &bases, 8));
        let mut r = Reader::new_at(&data, 8);
        assert_eq!(
            r.read_encoded(DW_EH_PE_sdata4 | DW_EH_PE_pcrel, &bases, 8)
                .unwrap(),
            0x5000
        );
    }

    #[test]
    fn encoded_pointer_rejects_unknown_forms() {
        let bases = EncodingBases::default();
        let mut r = Reader::new(&[0; 8]);
        assert_eq!(
            r.read_encoded(0x0d, &bases, 8),
            Err(ReadError::UnsupportedPointerFormat(0x0d))
        );
        let mut r = Reader::new(&[0; 8]);
        assert_eq!(
            r.read_encoded(DW_EH_PE_aligned | DW_EH_PE_udata4, &bases, 8),
            Err(ReadError::UnsupportedPointerApplication(DW_EH_PE_aligned))
        );
    }

    #[test]
    fn absptr_respects_address_size() {
        let bases = EncodingBases::default();
        let bytes = 0x12345678u32.to_le_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_encoded(DW_EH_PE_absptr, &bases, 4).unwrap(), 0x12345678);
    }
}
