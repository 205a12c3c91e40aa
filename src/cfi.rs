//! Interpretation of DWARF call frame instruction streams.
//!
//! The CFI conceptually describes a huge table: one row per code location,
//! one column per register, plus the CFA column. [`compute_unwind_row`]
//! materializes just the row covering one target program counter by running
//! the CIE's initial instructions followed by the FDE's instructions,
//! stopping as soon as the location counter would pass the target.

#![allow(non_upper_case_globals)]

use arrayvec::ArrayVec;
use tracing::trace;

use crate::eh_frame::{CfiTable, CieRecord, FdeRecord};
use crate::error::CfiError;
use crate::reader::{EncodingBases, Reader};

pub const DW_CFA_advance_loc: u8 = 0x40;
pub const DW_CFA_offset: u8 = 0x80;
pub const DW_CFA_restore: u8 = 0xc0;

pub const DW_CFA_nop: u8 = 0x00;
pub const DW_CFA_set_loc: u8 = 0x01;
pub const DW_CFA_advance_loc1: u8 = 0x02;
pub const DW_CFA_advance_loc2: u8 = 0x03;
pub const DW_CFA_advance_loc4: u8 = 0x04;
pub const DW_CFA_offset_extended: u8 = 0x05;
pub const DW_CFA_restore_extended: u8 = 0x06;
pub const DW_CFA_undefined: u8 = 0x07;
pub const DW_CFA_same_value: u8 = 0x08;
pub const DW_CFA_register: u8 = 0x09;
pub const DW_CFA_remember_state: u8 = 0x0a;
pub const DW_CFA_restore_state: u8 = 0x0b;
pub const DW_CFA_def_cfa: u8 = 0x0c;
pub const DW_CFA_def_cfa_register: u8 = 0x0d;
pub const DW_CFA_def_cfa_offset: u8 = 0x0e;
pub const DW_CFA_def_cfa_expression: u8 = 0x0f;
pub const DW_CFA_expression: u8 = 0x10;
pub const DW_CFA_offset_extended_sf: u8 = 0x11;
pub const DW_CFA_def_cfa_sf: u8 = 0x12;
pub const DW_CFA_def_cfa_offset_sf: u8 = 0x13;
pub const DW_CFA_val_offset: u8 = 0x14;
pub const DW_CFA_val_offset_sf: u8 = 0x15;
pub const DW_CFA_val_expression: u8 = 0x16;
pub const DW_CFA_GNU_args_size: u8 = 0x2e;
pub const DW_CFA_GNU_negative_offset_extended: u8 = 0x2f;

/// Maximum nesting depth for `DW_CFA_remember_state`.
const REMEMBER_STACK_DEPTH: usize = 8;

/// How to compute the Canonical Frame Address for a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfaRule {
    /// No CFA rule has been established (malformed or incomplete CFI).
    Unset,
    RegisterAndOffset { register: u16, offset: i64 },
}

/// How to recover one register's caller-frame value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterRule {
    /// The register's value is not recoverable.
    Undefined,
    /// The register was not modified; the callee's value stands.
    SameValue,
    /// Stored at CFA + offset.
    Offset(i64),
    /// The value *is* CFA + offset (not a load).
    ValOffset(i64),
    /// Aliases another register's recovered value.
    Register(u16),
    /// Stored at an explicit address. Reserved for expression-evaluated
    /// rules; no interpreted opcode currently produces it.
    AtAddress(u64),
}

/// One materialized row of the conceptual CFI table: the CFA formula plus a
/// sparse register-to-rule mapping.
#[derive(Clone, Debug)]
pub struct UnwindRow {
    pub cfa: CfaRule,
    pub return_address_register: u16,
    rules: Vec<(u16, RegisterRule)>,
}

impl UnwindRow {
    fn new(return_address_register: u16) -> Self {
        Self {
            cfa: CfaRule::Unset,
            return_address_register,
            rules: Vec::new(),
        }
    }

    /// The rule for `register`, or `None` if no instruction mentioned it
    /// (the register is unchanged across the frame).
    pub fn rule_for(&self, register: u16) -> Option<RegisterRule> {
        self.rules
            .iter()
            .find(|(r, _)| *r == register)
            .map(|(_, rule)| *rule)
    }

    pub fn rules(&self) -> &[(u16, RegisterRule)] {
        &self.rules
    }

    fn set_rule(&mut self, register: u16, rule: RegisterRule) {
        if let Some(entry) = self.rules.iter_mut().find(|(r, _)| *r == register) {
            entry.1 = rule;
        } else {
            self.rules.push((register, rule));
        }
    }

    fn clear_rule(&mut self, register: u16) {
        self.rules.retain(|(r, _)| *r != register);
    }
}

/// Computes the register-recovery row in effect at `pc`, which must lie
/// within the FDE's address range.
pub fn compute_unwind_row(
    table: &CfiTable,
    cie: &CieRecord,
    fde: &FdeRecord,
    pc: u64,
) -> Result<UnwindRow, CfiError> {
    let mut machine = Machine {
        row: UnwindRow::new(cie.return_address_register),
        initial_rules: Vec::new(),
        remembered: ArrayVec::new(),
        loc: fde.start,
        target: pc,
        cie,
        table,
    };
    machine.run(table.instruction_bytes(&cie.initial_instructions))?;
    machine.initial_rules = machine.row.rules.clone();
    machine.run(table.instruction_bytes(&fde.instructions))?;
    trace!(pc, cfa = ?machine.row.cfa, rules = machine.row.rules.len(), "computed unwind row");
    Ok(machine.row)
}

struct Machine<'a> {
    row: UnwindRow,
    /// Row state after the CIE's initial instructions, for `DW_CFA_restore`.
    initial_rules: Vec<(u16, RegisterRule)>,
    remembered: ArrayVec<(CfaRule, Vec<(u16, RegisterRule)>), REMEMBER_STACK_DEPTH>,
    loc: u64,
    target: u64,
    cie: &'a CieRecord,
    table: &'a CfiTable,
}

impl Machine<'_> {
    /// Executes one instruction stream, stopping early once the location
    /// counter passes the target.
    fn run(&mut self, instructions: &[u8]) -> Result<(), CfiError> {
        let mut r = Reader::new(instructions);
        while !r.is_exhausted() {
            if !self.step(&mut r)? {
                break;
            }
        }
        Ok(())
    }

    /// Returns `false` once rows past the target location begin.
    fn step(&mut self, r: &mut Reader<'_>) -> Result<bool, CfiError> {
        let opcode = r.read_u8()?;
        match opcode & 0xc0 {
            DW_CFA_advance_loc => {
                let delta = u64::from(opcode & 0x3f);
                return self.advance_factored(delta);
            }
            DW_CFA_offset => {
                let register = u16::from(opcode & 0x3f);
                let offset = self.factored(r.read_uleb128()?)?;
                self.row.set_rule(register, RegisterRule::Offset(offset));
                return Ok(true);
            }
            DW_CFA_restore => {
                self.restore(u16::from(opcode & 0x3f));
                return Ok(true);
            }
            _ => {}
        }
        match opcode {
            DW_CFA_nop => {}
            DW_CFA_set_loc => {
                let bases = EncodingBases {
                    pc: self.table.section_vaddr(),
                    ..Default::default()
                };
                let loc =
                    r.read_encoded(self.cie.fde_pointer_encoding, &bases, self.cie.address_size)?;
                if loc > self.target {
                    return Ok(false);
                }
                self.loc = loc;
            }
            DW_CFA_advance_loc1 => {
                let delta = u64::from(r.read_u8()?);
                return self.advance_factored(delta);
            }
            DW_CFA_advance_loc2 => {
                let delta = u64::from(r.read_u16()?);
                return self.advance_factored(delta);
            }
            DW_CFA_advance_loc4 => {
                let delta = u64::from(r.read_u32()?);
                return self.advance_factored(delta);
            }
            DW_CFA_offset_extended => {
                let register = r.read_uleb128()? as u16;
                let offset = self.factored(r.read_uleb128()?)?;
                self.row.set_rule(register, RegisterRule::Offset(offset));
            }
            DW_CFA_offset_extended_sf => {
                let register = r.read_uleb128()? as u16;
                let offset = self.factored_signed(r.read_sleb128()?)?;
                self.row.set_rule(register, RegisterRule::Offset(offset));
            }
            DW_CFA_GNU_negative_offset_extended => {
                let register = r.read_uleb128()? as u16;
                let offset = self
                    .factored(r.read_uleb128()?)?
                    .checked_neg()
                    .ok_or(CfiError::OperandOverflow)?;
                self.row.set_rule(register, RegisterRule::Offset(offset));
            }
            DW_CFA_restore_extended => {
                let register = r.read_uleb128()? as u16;
                self.restore(register);
            }
            DW_CFA_undefined => {
                let register = r.read_uleb128()? as u16;
                self.row.set_rule(register, RegisterRule::Undefined);
            }
            DW_CFA_same_value => {
                let register = r.read_uleb128()? as u16;
                self.row.set_rule(register, RegisterRule::SameValue);
            }
            DW_CFA_register => {
                let target = r.read_uleb128()? as u16;
                let source = r.read_uleb128()? as u16;
                self.row.set_rule(target, RegisterRule::Register(source));
            }
            DW_CFA_val_offset => {
                let register = r.read_uleb128()? as u16;
                let offset = self.factored(r.read_uleb128()?)?;
                self.row.set_rule(register, RegisterRule::ValOffset(offset));
            }
            DW_CFA_val_offset_sf => {
                let register = r.read_uleb128()? as u16;
                let offset = self.factored_signed(r.read_sleb128()?)?;
                self.row.set_rule(register, RegisterRule::ValOffset(offset));
            }
            DW_CFA_remember_state => {
                let saved = (self.row.cfa, self.row.rules.clone());
                self.remembered
                    .try_push(saved)
                    .map_err(|_| CfiError::RememberStackOverflow)?;
            }
            DW_CFA_restore_state => {
                let (cfa, rules) = self
                    .remembered
                    .pop()
                    .ok_or(CfiError::RestoreWithoutRemember)?;
                self.row.cfa = cfa;
                self.row.rules = rules;
            }
            DW_CFA_def_cfa => {
                let register = r.read_uleb128()? as u16;
                let offset =
                    i64::try_from(r.read_uleb128()?).map_err(|_| CfiError::OperandOverflow)?;
                self.row.cfa = CfaRule::RegisterAndOffset { register, offset };
            }
            DW_CFA_def_cfa_sf => {
                let register = r.read_uleb128()? as u16;
                let offset = self.factored_signed(r.read_sleb128()?)?;
                self.row.cfa = CfaRule::RegisterAndOffset { register, offset };
            }
            DW_CFA_def_cfa_register => {
                let register = r.read_uleb128()? as u16;
                match self.row.cfa {
                    CfaRule::RegisterAndOffset { offset, .. } => {
                        self.row.cfa = CfaRule::RegisterAndOffset { register, offset };
                    }
                    CfaRule::Unset => return Err(CfiError::IncompleteCfaRule),
                }
            }
            DW_CFA_def_cfa_offset => {
                let offset =
                    i64::try_from(r.read_uleb128()?).map_err(|_| CfiError::OperandOverflow)?;
                match self.row.cfa {
                    CfaRule::RegisterAndOffset { register, .. } => {
                        self.row.cfa = CfaRule::RegisterAndOffset { register, offset };
                    }
                    CfaRule::Unset => return Err(CfiError::IncompleteCfaRule),
                }
            }
            DW_CFA_def_cfa_offset_sf => {
                let offset = self.factored_signed(r.read_sleb128()?)?;
                match self.row.cfa {
                    CfaRule::RegisterAndOffset { register, .. } => {
                        self.row.cfa = CfaRule::RegisterAndOffset { register, offset };
                    }
                    CfaRule::Unset => return Err(CfiError::IncompleteCfaRule),
                }
            }
            DW_CFA_GNU_args_size => {
                // Call-site argument size; irrelevant for register recovery.
                let _size = r.read_uleb128()?;
            }
            // DWARF expressions would need an expression evaluator and live
            // memory access; the walk ends at such a frame.
            DW_CFA_def_cfa_expression | DW_CFA_expression | DW_CFA_val_expression => {
                return Err(CfiError::UnsupportedOpcode(opcode));
            }
            other => return Err(CfiError::UnsupportedOpcode(other)),
        }
        Ok(true)
    }

    /// Advances by an unfactored code delta. A delta that overflows the
    /// location counter lies past every reachable pc, so the current row
    /// stands and execution stops.
    fn advance_factored(&mut self, delta: u64) -> Result<bool, CfiError> {
        match delta.checked_mul(self.cie.code_alignment_factor) {
            Some(delta) => self.advance(delta),
            None => Ok(false),
        }
    }

    fn advance(&mut self, delta: u64) -> Result<bool, CfiError> {
        let next = match self.loc.checked_add(delta) {
            Some(next) => next,
            None => return Ok(false),
        };
        if next > self.target {
            // The current row covers the target; later rows don't apply.
            return Ok(false);
        }
        self.loc = next;
        Ok(true)
    }

    /// An unsigned factored offset times the data alignment factor, with
    /// operand values outside the representable range rejected rather than
    /// wrapped.
    fn factored(&self, value: u64) -> Result<i64, CfiError> {
        i64::try_from(value)
            .ok()
            .and_then(|v| v.checked_mul(self.cie.data_alignment_factor))
            .ok_or(CfiError::OperandOverflow)
    }

    fn factored_signed(&self, value: i64) -> Result<i64, CfiError> {
        value
            .checked_mul(self.cie.data_alignment_factor)
            .ok_or(CfiError::OperandOverflow)
    }

    fn restore(&mut self, register: u16) {
        let initial = self
            .initial_rules
            .iter()
            .find(|(r, _)| *r == register)
            .map(|(_, rule)| *rule);
        match initial {
            Some(rule) => self.row.set_rule(register, rule),
            None => self.row.clear_rule(register),
        }
    }
}
