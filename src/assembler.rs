//! Textual assembler: tokenizes VitteLight assembly source, interns string
//! operands into a constant pool, and emits a VLBC byte image.
//!
//! One instruction per line. `// # ;` start a line comment; `\n` or `\r\n`
//! ends a statement.

use crate::error::AssembleError;
use crate::module::{fnv1a32, Module, PoolString};
use crate::opcode::{Op, OperandKind};

/// A fully assembled program: the module it produced plus the byte image
/// that was written out. Kept together so callers that just assembled a
/// module don't need to re-serialize it to get the bytes back.
pub struct Assembled {
    pub module: Module,
    pub bytes: Vec<u8>,
}

/// Assemble textual source into a validated module and its canonical byte
/// image. This is the only public entry point; everything else in this
/// module is an implementation detail of the single-pass assembler.
pub fn assemble(source: &str) -> Result<Assembled, AssembleError> {
    let mut asm = Assembler::new();
    asm.run(source)?;
    let module = Module::from_parts(asm.pool, asm.code)
        .expect("assembler only emits structurally valid code");
    let bytes = module.to_bytes();
    Ok(Assembled { module, bytes })
}

struct Assembler {
    pool: Vec<PoolString>,
    code: Vec<u8>,
}

impl Assembler {
    fn new() -> Self {
        Assembler { pool: Vec::new(), code: Vec::new() }
    }

    /// Intern a byte string, returning its pool index. Duplicate content
    /// returns the existing index (first-insert-wins), matching the
    /// FNV-1a-32 hash lookup the spec mandates.
    fn intern(&mut self, bytes: &[u8]) -> u32 {
        let hash = fnv1a32(bytes);
        if let Some(pos) = self
            .pool
            .iter()
            .position(|s| s.hash() == hash && s.as_bytes() == bytes)
        {
            return pos as u32;
        }
        let idx = self.pool.len() as u32;
        self.pool.push(PoolString::new(bytes.to_vec()));
        idx
    }

    fn run(&mut self, source: &str) -> Result<(), AssembleError> {
        for (i, raw_line) in source.lines().enumerate() {
            let line_no = i + 1;
            let mut lexer = LineLexer::new(raw_line);
            lexer.skip_ws_and_comment();
            if lexer.at_end() {
                continue;
            }

            let mnemonic = lexer.read_ident().ok_or(AssembleError::UnknownMnemonic {
                line: line_no,
                mnemonic: String::new(),
            })?;
            let op = Op::from_mnemonic(&mnemonic).ok_or_else(|| AssembleError::UnknownMnemonic {
                line: line_no,
                mnemonic: mnemonic.clone(),
            })?;

            self.code.push(op as u8);
            for (idx, kind) in op.operands().iter().enumerate() {
                lexer.skip_ws_and_comment();
                self.emit_operand(&mut lexer, op, *kind, idx, line_no)?;
            }

            lexer.skip_ws_and_comment();
            if !lexer.at_end() {
                return Err(AssembleError::TrailingGarbage { line: line_no });
            }
        }
        Ok(())
    }

    fn emit_operand(
        &mut self,
        lexer: &mut LineLexer,
        op: Op,
        kind: OperandKind,
        operand_index: usize,
        line: usize,
    ) -> Result<(), AssembleError> {
        // CALLN's first operand is a native name (string-pool index);
        // PUSHS/STOREG/LOADG's sole u32 operand is also a pool index.
        // Everything else is a plain literal.
        let is_string_operand = matches!(kind, OperandKind::U32)
            && (op != Op::Calln || operand_index == 0);

        match kind {
            OperandKind::None => Ok(()),
            OperandKind::U32 if is_string_operand => {
                let index = self.read_string_operand(lexer, line)?;
                self.code.extend_from_slice(&index.to_le_bytes());
                Ok(())
            }
            OperandKind::U8 => {
                let value = lexer
                    .read_int()
                    .ok_or(AssembleError::ExpectedLiteral { line, kind: "integer" })?;
                if !(0..=255).contains(&value) {
                    return Err(AssembleError::LiteralOutOfRange { line });
                }
                self.code.push(value as u8);
                Ok(())
            }
            OperandKind::U32 => {
                let value = lexer
                    .read_int()
                    .ok_or(AssembleError::ExpectedLiteral { line, kind: "integer" })?;
                if !(0..=u32::MAX as i64).contains(&value) {
                    return Err(AssembleError::LiteralOutOfRange { line });
                }
                self.code.extend_from_slice(&(value as u32).to_le_bytes());
                Ok(())
            }
            OperandKind::U64 => {
                let value = lexer
                    .read_int()
                    .ok_or(AssembleError::ExpectedLiteral { line, kind: "integer" })?;
                self.code.extend_from_slice(&(value as u64).to_le_bytes());
                Ok(())
            }
            OperandKind::F64 => {
                let value = lexer
                    .read_float()
                    .ok_or(AssembleError::ExpectedLiteral { line, kind: "float" })?;
                self.code.extend_from_slice(&value.to_le_bytes());
                Ok(())
            }
        }
    }

    /// A string-pool operand may be written as a quoted string literal or a
    /// bare identifier (for global/native names); both intern into the pool.
    fn read_string_operand(&mut self, lexer: &mut LineLexer, line: usize) -> Result<u32, AssembleError> {
        if lexer.peek() == Some('"') {
            let bytes = lexer.read_quoted_string(line)?;
            Ok(self.intern(&bytes))
        } else if let Some(ident) = lexer.read_ident() {
            Ok(self.intern(ident.as_bytes()))
        } else {
            Err(AssembleError::ExpectedLiteral { line, kind: "string or identifier" })
        }
    }
}

/// Per-line lexer: mnemonics, identifiers, integer/float literals, and
/// quoted strings with `\n \r \t \" \\` escapes.
struct LineLexer {
    chars: Vec<char>,
    pos: usize,
}

impl LineLexer {
    fn new(source: &str) -> Self {
        LineLexer { chars: source.chars().collect(), pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn skip_ws_and_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance();
            } else if c == '/' && self.peek_at(1) == Some('/') || c == '#' || c == ';' {
                self.pos = self.chars.len();
            } else {
                break;
            }
        }
    }

    fn read_ident(&mut self) -> Option<String> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_alphabetic() || c == '_' || c == '.' => {}
            _ => return None,
        }
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.advance();
            } else {
                break;
            }
        }
        Some(self.chars[start..self.pos].iter().collect())
    }

    fn read_int(&mut self) -> Option<i64> {
        let start = self.pos;
        if matches!(self.peek(), Some('+') | Some('-')) {
            self.advance();
        }
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            self.advance();
            self.advance();
            let hex_start = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.advance();
            }
            if self.pos == hex_start {
                self.pos = start;
                return None;
            }
            let digits: String = self.chars[hex_start..self.pos].iter().collect();
            let magnitude = i64::from_str_radix(&digits, 16).ok()?;
            let negative = self.chars.get(start) == Some(&'-');
            return Some(if negative { -magnitude } else { magnitude });
        }

        let digits_start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
        if self.pos == digits_start {
            self.pos = start;
            return None;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<i64>().ok()
    }

    fn read_float(&mut self) -> Option<f64> {
        let start = self.pos;
        if matches!(self.peek(), Some('+') | Some('-')) {
            self.advance();
        }
        let mut saw_digit = false;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
            saw_digit = true;
        }
        if self.peek() == Some('.') {
            self.advance();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.advance();
                saw_digit = true;
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let exp_start = self.pos;
            self.advance();
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.advance();
            }
            let mantissa_start = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
            if self.pos == mantissa_start {
                self.pos = exp_start;
            }
        }
        if !saw_digit {
            self.pos = start;
            return None;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>().ok()
    }

    fn read_quoted_string(&mut self, line: usize) -> Result<Vec<u8>, AssembleError> {
        debug_assert_eq!(self.peek(), Some('"'));
        self.advance();
        let mut bytes = Vec::new();
        loop {
            match self.advance() {
                None => return Err(AssembleError::UnterminatedString { line }),
                Some('"') => break,
                Some('\\') => match self.advance() {
                    Some('n') => bytes.push(b'\n'),
                    Some('r') => bytes.push(b'\r'),
                    Some('t') => bytes.push(b'\t'),
                    Some('"') => bytes.push(b'"'),
                    Some('\\') => bytes.push(b'\\'),
                    Some(other) => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                    }
                    None => return Err(AssembleError::UnterminatedString { line }),
                },
                Some(c) => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_arithmetic_and_print() {
        let asm = assemble("PUSHI 2\nPUSHI 40\nADD\nPRINT\nHALT\n").unwrap();
        assert_eq!(asm.module.code_size(), 1 + 9 + 9 + 1 + 1 + 1);
    }

    #[test]
    fn interns_duplicate_strings_once() {
        let asm = assemble("PUSHS \"hi\"\nPUSHS \"hi\"\nHALT\n").unwrap();
        assert_eq!(asm.module.string_count(), 1);
    }

    #[test]
    fn rejects_unknown_mnemonic() {
        let err = assemble("FROB\n").unwrap_err();
        assert_eq!(err.line(), 1);
        assert!(matches!(err, AssembleError::UnknownMnemonic { .. }));
    }

    #[test]
    fn rejects_argc_out_of_range() {
        let err = assemble("CALLN print 256\n").unwrap_err();
        assert!(matches!(err, AssembleError::LiteralOutOfRange { line: 1 }));
    }

    #[test]
    fn rejects_trailing_garbage() {
        let err = assemble("HALT garbage\n").unwrap_err();
        assert!(matches!(err, AssembleError::TrailingGarbage { line: 1 }));
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = assemble("PUSHS \"oops\n").unwrap_err();
        assert!(matches!(err, AssembleError::UnterminatedString { line: 1 }));
    }

    #[test]
    fn accepts_hex_literal() {
        let asm = assemble("PUSHI 0xFF\nHALT\n").unwrap();
        assert_eq!(asm.module.code_size(), 9 + 1);
    }
}
