//! Parsing of a `.eh_frame` section into an indexed table of CIE and FDE
//! records.
//!
//! The section is a sequence of self-delimiting records: a 4-byte length
//! (or the 64-bit escape `0xffffffff` followed by an 8-byte length), then a
//! CIE-id field of the same width. An id of zero marks a CIE; any other
//! value is an FDE whose id is the backward byte distance from the id field
//! to the owning CIE's record start. A zero length terminates the section.
//!
//! Only record framing and field extraction happen here; the instruction
//! streams are stored verbatim and interpreted later by [`crate::cfi`].

use std::collections::BTreeMap;
use std::ops::Range;

use fallible_iterator::FallibleIterator;
use tracing::trace;

use crate::error::CfiError;
use crate::reader::{EncodingBases, Reader, DW_EH_PE_absptr, DW_EH_PE_omit};

const CIE_ID: u64 = 0;
const LENGTH64_ESCAPE: u32 = 0xffff_ffff;

/// Common Information Entry: unwind metadata shared by one or more FDEs.
/// Identified by its byte offset within `.eh_frame`.
#[derive(Clone, Debug)]
pub struct CieRecord {
    pub offset: u64,
    pub version: u8,
    pub augmentation: Box<[u8]>,
    pub address_size: u8,
    pub code_alignment_factor: u64,
    pub data_alignment_factor: i64,
    pub return_address_register: u16,
    /// Pointer encoding for FDE-referenced addresses (`'R'` augmentation);
    /// `DW_EH_PE_absptr` when the CIE carries none.
    pub fde_pointer_encoding: u8,
    /// Encoding of the FDE's LSDA pointer (`'L'` augmentation), if present.
    pub lsda_encoding: Option<u8>,
    /// Byte range of the initial instruction stream within the section.
    pub initial_instructions: Range<usize>,
}

/// Frame Description Entry: per-function address range and instruction
/// stream. References its owning CIE by section offset; the CIE's lifetime
/// is the table's.
#[derive(Clone, Debug)]
pub struct FdeRecord {
    pub cie_offset: u64,
    /// Function start, absolute after pc-relative resolution against the
    /// section's virtual address.
    pub start: u64,
    pub end: u64,
    /// Byte range of the instruction stream within the section.
    pub instructions: Range<usize>,
}

/// Per-module CFI lookup table. Immutable once built.
pub struct CfiTable {
    data: Vec<u8>,
    section_vaddr: u64,
    cies: BTreeMap<u64, CieRecord>,
    /// Sorted by `start` for range lookup by program counter.
    fdes: Vec<FdeRecord>,
}

impl CfiTable {
    /// Walks the whole section once and indexes every record.
    ///
    /// `address_size` is the module's pointer width in bytes, used for
    /// absolute-pointer fields in CIEs that don't carry their own
    /// address-size byte (versions below 4).
    ///
    /// Malformed input yields a typed error; nothing in here aborts the
    /// process.
    pub fn parse(data: Vec<u8>, section_vaddr: u64, address_size: u8) -> Result<Self, CfiError> {
        let mut cies: BTreeMap<u64, CieRecord> = BTreeMap::new();
        let mut fdes: Vec<FdeRecord> = Vec::new();

        let mut records = RawRecords::new(&data);
        while let Some(record) = records.next()? {
            if record.cie_id == CIE_ID {
                let cie = parse_cie(&data, &record, address_size)?;
                trace!(offset = cie.offset, aug = ?cie.augmentation, "CIE");
                cies.insert(cie.offset, cie);
            } else {
                // The id encodes the backward distance from the id field to
                // the CIE's record start.
                let id_field_start = record.body_start as u64 - record.id_size as u64;
                let cie_offset = id_field_start
                    .checked_sub(record.cie_id)
                    .ok_or(CfiError::DanglingFde {
                        fde_offset: record.offset as u64,
                        cie_offset: record.cie_id,
                    })?;
                let cie = cies.get(&cie_offset).ok_or(CfiError::DanglingFde {
                    fde_offset: record.offset as u64,
                    cie_offset,
                })?;
                let fde = parse_fde(&data, &record, cie, cie_offset, section_vaddr)?;
                trace!(start = fde.start, end = fde.end, cie_offset, "FDE");
                fdes.push(fde);
            }
        }

        fdes.sort_by_key(|fde| fde.start);
        Ok(Self {
            data,
            section_vaddr,
            cies,
            fdes,
        })
    }

    pub fn section_vaddr(&self) -> u64 {
        self.section_vaddr
    }

    pub fn cie(&self, offset: u64) -> Option<&CieRecord> {
        self.cies.get(&offset)
    }

    pub fn cie_for(&self, fde: &FdeRecord) -> Option<&CieRecord> {
        self.cies.get(&fde.cie_offset)
    }

    /// Finds the FDE whose `[start, end)` range covers `pc`.
    pub fn fde_covering(&self, pc: u64) -> Option<&FdeRecord> {
        let i = match self.fdes.binary_search_by_key(&pc, |fde| fde.start) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let fde = &self.fdes[i];
        if pc < fde.end {
            Some(fde)
        } else {
            None
        }
    }

    pub fn fdes(&self) -> &[FdeRecord] {
        &self.fdes
    }

    pub(crate) fn instruction_bytes(&self, range: &Range<usize>) -> &[u8] {
        &self.data[range.clone()]
    }
}

impl std::fmt::Debug for CfiTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CfiTable")
            .field("cies", &self.cies.len())
            .field("fdes", &self.fdes.len())
            .finish()
    }
}

/// One record with its framing resolved but its body not yet interpreted.
struct RawRecord {
    /// Section offset of the record's length field.
    offset: usize,
    cie_id: u64,
    /// Width of the length and id fields (4, or 8 for the 64-bit variant).
    id_size: usize,
    /// Section offset of the first byte after the id field.
    body_start: usize,
    /// Section offset one past the record's last byte.
    end: usize,
}

/// Fallible iterator over the section's records, stopping at a zero-length
/// terminator or the end of the slice.
struct RawRecords<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RawRecords<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl FallibleIterator for RawRecords<'_> {
    type Item = RawRecord;
    type Error = CfiError;

    fn next(&mut self) -> Result<Option<RawRecord>, CfiError> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let offset = self.pos;
        let mut r = Reader::new_at(self.data, self.pos);
        let first = r.read_u32()?;
        let (length, id_size) = if first == LENGTH64_ESCAPE {
            (r.read_u64()?, 8)
        } else {
            (u64::from(first), 4)
        };
        if length == 0 {
            // Zero-length terminator.
            return Ok(None);
        }
        let end = (r.pos() as u64)
            .checked_add(length)
            .filter(|&end| end <= self.data.len() as u64)
            .ok_or(CfiError::RecordOverrun {
                offset: offset as u64,
                length,
            })? as usize;
        let cie_id = if id_size == 8 {
            r.read_u64()?
        } else {
            u64::from(r.read_u32()?)
        };
        self.pos = end;
        Ok(Some(RawRecord {
            offset,
            cie_id,
            id_size,
            body_start: r.pos(),
            end,
        }))
    }
}

fn parse_cie(
    data: &[u8],
    record: &RawRecord,
    default_address_size: u8,
) -> Result<CieRecord, CfiError> {
    let mut r = Reader::new_at(&data[..record.end], record.body_start);
    let version = r.read_u8()?;
    let augmentation: Box<[u8]> = r.read_cstr()?.into();
    match augmentation.first() {
        None | Some(b'z') => {}
        Some(&other) => return Err(CfiError::MalformedAugmentation(other)),
    }
    let mut address_size = default_address_size;
    if version >= 4 {
        address_size = r.read_u8()?;
        let _segment_size = r.read_u8()?;
    }
    let code_alignment_factor = r.read_uleb128()?;
    let data_alignment_factor = r.read_sleb128()?;
    let return_address_register = if version == 1 {
        u16::from(r.read_u8()?)
    } else {
        r.read_uleb128()? as u16
    };

    let mut fde_pointer_encoding = DW_EH_PE_absptr;
    let mut lsda_encoding = None;
    if augmentation.first() == Some(&b'z') {
        let aug_len = r.read_uleb128()?;
        let aug_end = augmentation_end(&r, record, aug_len)?;
        for &c in &augmentation[1..] {
            match c {
                b'R' => fde_pointer_encoding = r.read_u8()?,
                b'P' => {
                    // Personality routine pointer: decoded only to keep the
                    // cursor in step, value discarded. The relocation nibble
                    // is ignored since the value is never applied.
                    let encoding = r.read_u8()?;
                    let bases = EncodingBases::default();
                    let _personality = r.read_encoded(encoding & 0x0f, &bases, address_size)?;
                }
                b'L' => lsda_encoding = Some(r.read_u8()?),
                other => return Err(CfiError::UnsupportedAugmentation(other as char)),
            }
        }
        // Tolerate padding the augmentation length accounts for.
        if r.pos() < aug_end {
            r.skip(aug_end - r.pos())?;
        }
    }

    Ok(CieRecord {
        offset: record.offset as u64,
        version,
        augmentation,
        address_size,
        code_alignment_factor,
        data_alignment_factor,
        return_address_register,
        fde_pointer_encoding,
        lsda_encoding,
        initial_instructions: r.pos()..record.end,
    })
}

/// Bounds-checks an augmentation-data length against the record's end.
/// The length is attacker-controlled; unchecked arithmetic on it would
/// wrap.
fn augmentation_end(r: &Reader<'_>, record: &RawRecord, aug_len: u64) -> Result<usize, CfiError> {
    (r.pos() as u64)
        .checked_add(aug_len)
        .filter(|&end| end <= record.end as u64)
        .map(|end| end as usize)
        .ok_or(CfiError::AugmentationOverrun {
            offset: record.offset as u64,
            length: aug_len,
        })
}

fn parse_fde(
    data: &[u8],
    record: &RawRecord,
    cie: &CieRecord,
    cie_offset: u64,
    section_vaddr: u64,
) -> Result<FdeRecord, CfiError> {
    let mut r = Reader::new_at(&data[..record.end], record.body_start);
    // The reader's position equals the field's section offset, so setting
    // the pc base to the section address makes pc-relative initial
    // locations resolve to absolute function starts.
    let bases = EncodingBases {
        pc: section_vaddr,
        ..Default::default()
    };
    let start = r.read_encoded(cie.fde_pointer_encoding, &bases, cie.address_size)?;
    // The range is a plain length: only the value format applies, never the
    // relocation nibble.
    let range = {
        let format = cie.fde_pointer_encoding & 0x0f;
        r.read_encoded(format, &bases, cie.address_size)?
    };

    if cie.augmentation.first() == Some(&b'z') {
        let aug_len = r.read_uleb128()?;
        let aug_end = augmentation_end(&r, record, aug_len)?;
        if let Some(lsda_encoding) = cie.lsda_encoding {
            if lsda_encoding != DW_EH_PE_omit {
                // Skipped, not used: only the value format matters here.
                let _lsda = r.read_encoded(lsda_encoding & 0x0f, &bases, cie.address_size)?;
            }
        }
        if r.pos() < aug_end {
            r.skip(aug_end - r.pos())?;
        }
    }

    Ok(FdeRecord {
        cie_offset,
        start,
        end: start.wrapping_add(range),
        instructions: r.pos()..record.end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{DW_EH_PE_pcrel, DW_EH_PE_sdata4, DW_EH_PE_udata8};

    /// Appends one record (length + id + body) to `section`.
    fn push_record(section: &mut Vec<u8>, cie_id: u32, body: &[u8]) -> usize {
        let offset = section.len();
        section.extend_from_slice(&(body.len() as u32 + 4).to_le_bytes());
        section.extend_from_slice(&cie_id.to_le_bytes());
        section.extend_from_slice(body);
        offset
    }

    fn cie_body(aug: &[u8], aug_data: &[u8], initial_instructions: &[u8]) -> Vec<u8> {
        let mut body = vec![1]; // version
        body.extend_from_slice(aug);
        body.push(0);
        body.push(1); // code alignment factor
        body.push(0x78); // data alignment factor -8
        body.push(16); // return address register
        if aug.first() == Some(&b'z') {
            body.push(aug_data.len() as u8);
            body.extend_from_slice(aug_data);
        }
        body.extend_from_slice(initial_instructions);
        body
    }

    /// An FDE body with `zR` augmentation and absptr/udata8 addressing.
    fn fde_body_abs(start: u64, len: u64, instructions: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&start.to_le_bytes());
        body.extend_from_slice(&len.to_le_bytes());
        body.push(0); // augmentation data length
        body.extend_from_slice(instructions);
        body
    }

    #[test]
    fn cie_and_fde_round_trip() {
        let mut section = Vec::new();
        let cie_offset = push_record(&mut section, 0, &cie_body(b"zR", &[DW_EH_PE_udata8], &[]));
        assert_eq!(cie_offset, 0);
        // id = distance from the id field back to the CIE record start
        let id = (section.len() + 4) as u32;
        let fde_offset = push_record(&mut section, id, &fde_body_abs(0x1000, 0x10, &[]));
        section.extend_from_slice(&[0; 4]); // terminator

        let table = CfiTable::parse(section, 0, 8).unwrap();
        assert_eq!(table.fdes().len(), 1);
        let fde = &table.fdes()[0];
        assert_eq!(fde.cie_offset, cie_offset as u64);
        assert!(table.cie_for(fde).is_some());
        assert_eq!(fde.start, 0x1000);
        assert_eq!(fde.end, 0x1010);
        assert!(fde_offset > 0);
    }

    #[test]
    fn lookup_by_program_counter() {
        let mut section = Vec::new();
        push_record(&mut section, 0, &cie_body(b"zR", &[DW_EH_PE_udata8], &[]));
        let id = (section.len() + 4) as u32;
        push_record(&mut section, id, &fde_body_abs(0x1000, 0x10, &[]));
        section.extend_from_slice(&[0; 4]);

        let table = CfiTable::parse(section, 0, 8).unwrap();
        assert_eq!(table.fde_covering(0x1005).unwrap().start, 0x1000);
        assert_eq!(table.fde_covering(0x1000).unwrap().start, 0x1000);
        assert!(table.fde_covering(0x0fff).is_none());
        assert!(table.fde_covering(0x1010).is_none());
        assert!(table.fde_covering(0x2000).is_none());
    }

    #[test]
    fn pcrel_initial_location() {
        // One CIE with a 4-byte pc-relative FDE encoding, section loaded at
        // 0x2000. The FDE's initial-location field sits at section offset
        // (fde_record + 8), and its stored value is relative to
        // section_vaddr + that offset.
        let section_vaddr = 0x2000u64;
        let enc = DW_EH_PE_pcrel | DW_EH_PE_sdata4;
        let mut section = Vec::new();
        push_record(&mut section, 0, &cie_body(b"zR", &[enc], &[]));
        let fde_record = section.len();
        let field_vaddr = section_vaddr + fde_record as u64 + 8;
        let target = 0x3000u64;
        let delta = (target.wrapping_sub(field_vaddr)) as u32;
        let mut body = Vec::new();
        body.extend_from_slice(&delta.to_le_bytes());
        body.extend_from_slice(&0x10u32.to_le_bytes()); // address range
        body.push(0);
        push_record(&mut section, (fde_record + 4) as u32, &body);
        section.extend_from_slice(&[0; 4]);

        let table = CfiTable::parse(section, section_vaddr, 8).unwrap();
        let fde = table.fde_covering(0x3008).unwrap();
        assert_eq!(fde.start, 0x3000);
        assert_eq!(fde.end, 0x3010);
    }

    #[test]
    fn malformed_augmentation_is_an_error() {
        let mut section = Vec::new();
        push_record(&mut section, 0, &cie_body(b"qR", &[], &[]));
        assert_eq!(
            CfiTable::parse(section, 0, 8).unwrap_err(),
            CfiError::MalformedAugmentation(b'q')
        );
    }

    #[test]
    fn unknown_augmentation_character_is_an_error() {
        let mut section = Vec::new();
        push_record(&mut section, 0, &cie_body(b"zX", &[0], &[]));
        assert_eq!(
            CfiTable::parse(section, 0, 8).unwrap_err(),
            CfiError::UnsupportedAugmentation('X')
        );
    }

    #[test]
    fn huge_cie_augmentation_length_is_an_error() {
        // ULEB128 for u64::MAX; adding it to the cursor unchecked would wrap.
        let mut body = vec![1]; // version
        body.extend_from_slice(b"z\0");
        body.extend_from_slice(&[1, 0x78, 16]);
        body.extend_from_slice(&[0xff; 9]);
        body.push(0x01);
        let mut section = Vec::new();
        push_record(&mut section, 0, &body);
        assert!(matches!(
            CfiTable::parse(section, 0, 8).unwrap_err(),
            CfiError::AugmentationOverrun {
                length: u64::MAX,
                ..
            }
        ));
    }

    #[test]
    fn huge_fde_augmentation_length_is_an_error() {
        let mut section = Vec::new();
        push_record(&mut section, 0, &cie_body(b"zR", &[DW_EH_PE_udata8], &[]));
        let id = (section.len() + 4) as u32;
        let mut body = Vec::new();
        body.extend_from_slice(&0x1000u64.to_le_bytes());
        body.extend_from_slice(&0x10u64.to_le_bytes());
        body.extend_from_slice(&[0xff; 9]); // augmentation data length
        body.push(0x01);
        push_record(&mut section, id, &body);
        assert!(matches!(
            CfiTable::parse(section, 0, 8).unwrap_err(),
            CfiError::AugmentationOverrun { .. }
        ));
    }

    #[test]
    fn augmentation_data_overrunning_the_record_is_an_error() {
        // Length fits in a usize but reaches past the record's end.
        let mut body = vec![1];
        body.extend_from_slice(b"z\0");
        body.extend_from_slice(&[1, 0x78, 16]);
        body.push(0x40); // far larger than the record
        let mut section = Vec::new();
        push_record(&mut section, 0, &body);
        assert!(matches!(
            CfiTable::parse(section, 0, 8).unwrap_err(),
            CfiError::AugmentationOverrun { length: 0x40, .. }
        ));
    }

    #[test]
    fn four_byte_absptr_fde_pointers() {
        // A version-1 CIE carries no address-size byte; the module's class
        // decides how wide absptr fields are.
        let mut section = Vec::new();
        push_record(&mut section, 0, &cie_body(b"zR", &[DW_EH_PE_absptr], &[]));
        let id = (section.len() + 4) as u32;
        let mut body = Vec::new();
        body.extend_from_slice(&0x1000u32.to_le_bytes());
        body.extend_from_slice(&0x10u32.to_le_bytes());
        body.push(0); // augmentation data length
        push_record(&mut section, id, &body);
        section.extend_from_slice(&[0; 4]);

        let table = CfiTable::parse(section, 0, 4).unwrap();
        let fde = table.fde_covering(0x1005).unwrap();
        assert_eq!(fde.start, 0x1000);
        assert_eq!(fde.end, 0x1010);
    }

    #[test]
    fn dangling_fde_reference_is_an_error() {
        let mut section = Vec::new();
        push_record(&mut section, 0, &cie_body(b"zR", &[DW_EH_PE_udata8], &[]));
        // Bogus backward distance pointing before the section start.
        push_record(&mut section, 0x4000_0000, &fde_body_abs(0x1000, 0x10, &[]));
        assert!(matches!(
            CfiTable::parse(section, 0, 8).unwrap_err(),
            CfiError::DanglingFde { .. }
        ));
    }

    #[test]
    fn record_overrunning_section_is_an_error() {
        let mut section = Vec::new();
        section.extend_from_slice(&100u32.to_le_bytes());
        section.extend_from_slice(&[0; 8]);
        assert!(matches!(
            CfiTable::parse(section, 0, 8).unwrap_err(),
            CfiError::RecordOverrun { .. }
        ));
    }

    #[test]
    fn zero_length_terminates_the_walk() {
        let mut section = Vec::new();
        push_record(&mut section, 0, &cie_body(b"zR", &[DW_EH_PE_udata8], &[]));
        section.extend_from_slice(&[0; 4]);
        // Garbage after the terminator must never be reached.
        section.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let table = CfiTable::parse(section, 0, 8).unwrap();
        assert_eq!(table.fdes().len(), 0);
    }

    #[test]
    fn sixty_four_bit_length_framing() {
        let mut section = Vec::new();
        let body = cie_body(b"zR", &[DW_EH_PE_udata8], &[]);
        section.extend_from_slice(&LENGTH64_ESCAPE.to_le_bytes());
        section.extend_from_slice(&(body.len() as u64 + 8).to_le_bytes());
        section.extend_from_slice(&0u64.to_le_bytes()); // CIE id, 8 bytes wide
        section.extend_from_slice(&body);
        section.extend_from_slice(&[0; 4]);
        let table = CfiTable::parse(section, 0, 8).unwrap();
        assert!(table.cie(0).is_some());
    }
}
