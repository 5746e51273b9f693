//! Disassembler: renders a code buffer as one line per instruction,
//! resolving string-pool indices against a module. Shared by the `dis` CLI
//! sub-command, the VM's `OP` trace category, and the assembler's
//! round-trip tests.
//!
//! Two renderings share the same per-instruction walk: [`disassemble`]
//! produces the annotated, human-facing form (`<offset>: MNEMONIC operands
//! ; "pool string"`); [`disassemble_source`] produces the assembler's own
//! textual grammar (no offset, no comment, string-pool operands quoted
//! rather than numeric) so that it is a genuine left-inverse of
//! [`crate::assembler::assemble`] — spec §4.4's round-trip law.

use std::fmt::Write as _;

use crate::error::LoadError;
use crate::module::Module;
use crate::opcode::{Op, OperandKind};

/// Which textual form [`render_instruction`] produces for one instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Style {
    /// `<offset>: MNEMONIC operands  ; "pool string"`.
    Annotated,
    /// `MNEMONIC operands`, string-pool operands quoted — reparseable by
    /// [`crate::assembler::assemble`].
    Source,
}

/// Disassemble an entire module's code buffer, one annotated line per
/// instruction.
pub fn disassemble(module: &Module) -> Result<String, LoadError> {
    render_all(module, Style::Annotated)
}

/// Disassemble a module back into VitteLight assembly source: one
/// instruction per line, no offsets or comments, string-pool operands
/// rendered as quoted string literals. `assemble(&disassemble_source(m)?)`
/// always succeeds and yields code bytes identical to `m`'s.
pub fn disassemble_source(module: &Module) -> Result<String, LoadError> {
    render_all(module, Style::Source)
}

fn render_all(module: &Module, style: Style) -> Result<String, LoadError> {
    let mut out = String::new();
    let mut ip = 0usize;
    let code = module.code();
    while ip < code.len() {
        let (line, size) = render_instruction(module, ip, style)?;
        out.push_str(&line);
        out.push('\n');
        ip += size;
    }
    Ok(out)
}

/// Disassemble the single instruction at `ip` in the annotated form,
/// returning its rendered line and encoded size. Used standalone by the
/// VM's per-step `OP` trace category so it doesn't have to re-render the
/// whole module every step.
pub fn disassemble_one(module: &Module, ip: usize) -> Result<(String, usize), LoadError> {
    render_instruction(module, ip, Style::Annotated)
}

fn render_instruction(module: &Module, ip: usize, style: Style) -> Result<(String, usize), LoadError> {
    let code = module.code();
    let byte = *code.get(ip).ok_or_else(|| LoadError::MalformedInstruction {
        offset: ip,
        reason: "ip past end of code".to_string(),
    })?;
    let op = Op::from_byte(byte).ok_or_else(|| LoadError::MalformedInstruction {
        offset: ip,
        reason: format!("unknown opcode byte 0x{byte:02X}"),
    })?;

    let size = op.size();
    if ip + size > code.len() {
        return Err(LoadError::MalformedInstruction {
            offset: ip,
            reason: format!("{} operand bytes truncated", op.mnemonic()),
        });
    }

    let mut line = match style {
        Style::Annotated => format!("{ip:08X}: {}", op.mnemonic()),
        Style::Source => op.mnemonic().to_string(),
    };
    let mut operand_offset = ip + 1;
    let mut string_index = None;

    for (idx, kind) in op.operands().iter().enumerate() {
        let is_string = is_string_operand(op, idx);
        match kind {
            OperandKind::None => {}
            OperandKind::U8 => {
                let v = code[operand_offset];
                write!(line, " {v}").unwrap();
            }
            OperandKind::U32 => {
                let b = &code[operand_offset..operand_offset + 4];
                let v = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                if is_string {
                    match style {
                        Style::Annotated => {
                            write!(line, " {v}").unwrap();
                            string_index = Some(v);
                        }
                        Style::Source => {
                            let s = module.string(v).ok_or(LoadError::StringIndexOutOfRange {
                                index: v,
                                count: module.string_count(),
                            })?;
                            write!(line, " {}", quote_string(&s.to_display())).unwrap();
                        }
                    }
                } else {
                    write!(line, " {v}").unwrap();
                }
            }
            OperandKind::U64 => {
                let b = &code[operand_offset..operand_offset + 8];
                let v = i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
                write!(line, " {v}").unwrap();
            }
            OperandKind::F64 => {
                let b = &code[operand_offset..operand_offset + 8];
                let v = f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
                // `{v}` uses Rust's shortest round-trip `Display`, which the
                // assembler's decimal float lexer reparses back to the same
                // bit pattern — unlike the spec's `%.17g` print contract,
                // which is lossy by design and only used for `PRINT` output.
                write!(line, " {v}").unwrap();
            }
        }
        operand_offset += kind.size();
    }

    if style == Style::Annotated {
        if let Some(idx) = string_index {
            if let Some(s) = module.string(idx) {
                write!(line, "  ; \"{}\"", s.to_display()).unwrap();
            }
        }
    }

    Ok((line, size))
}

fn is_string_operand(op: Op, operand_index: usize) -> bool {
    matches!(op, Op::Pushs | Op::Storeg | Op::Loadg) || (op == Op::Calln && operand_index == 0)
}

/// Render `s` as a VitteLight string literal, escaping exactly the set the
/// assembler's lexer unescapes (`\n \r \t \" \\`); every other character,
/// including non-ASCII, passes through verbatim.
fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}
