// This is where the dirty grunt work of turning source text into the binary
// encoding happens. Two passes over the same lines: the first collects
// labels, data items and the origin while costing every instruction in
// words, the second resolves operands and emits code. All state lives in the
// Assembler value so nothing leaks between inputs.

use crate::isa::{self, Mode, Opcode, Register};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

/// A diagnostic tied to a source line. Diagnostics accumulate across both
/// passes and any of them suppresses the output image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct AsmError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DataType {
    Db,
    Dw,
    Dd,
}

impl DataType {
    fn from_name(name: &str) -> Option<DataType> {
        match name.to_ascii_lowercase().as_str() {
            "db" => Some(DataType::Db),
            "dw" => Some(DataType::Dw),
            "dd" => Some(DataType::Dd),
            _ => None,
        }
    }

    fn width(self) -> u16 {
        match self {
            DataType::Db => 1,
            DataType::Dw => 2,
            DataType::Dd => 4,
        }
    }

    fn name(self) -> &'static str {
        match self {
            DataType::Db => "db",
            DataType::Dw => "dw",
            DataType::Dd => "dd",
        }
    }

    fn fits(self, value: u32) -> bool {
        match self {
            DataType::Db => value <= 0xFF,
            DataType::Dw => value <= 0xFFFF,
            DataType::Dd => true,
        }
    }
}

/// An allocated data item: scalar width, start address and raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    pub name: String,
    pub width: u16,
    pub addr: u16,
    pub bytes: Vec<u8>,
}

/// Operand classified by shape alone; names resolve in pass 2.
#[derive(Debug, Clone)]
enum Shape {
    Reg(Register),
    Num(u32),
    Name(String),
    /// Bracketed operand, `[name]` or `[number]`.
    Mem(String),
}

/// The assembled output: code words at the origin plus the data items at
/// their recorded byte addresses.
#[derive(Debug)]
pub struct Image {
    pub org: u16,
    pub code: Vec<u16>,
    pub data: Vec<DataItem>,
    pub data_end: u16,
}

impl Image {
    /// Lays the image out at absolute byte addresses, zero padded, exactly
    /// as the loader expects to read it back.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut end = self.org as usize + self.code.len() * 2;
        for item in &self.data {
            end = end.max(item.addr as usize + item.bytes.len());
        }
        let mut out = vec![0u8; end];
        for (index, word) in self.code.iter().enumerate() {
            let at = self.org as usize + index * 2;
            out[at..at + 2].copy_from_slice(&word.to_le_bytes());
        }
        for item in &self.data {
            let at = item.addr as usize;
            out[at..at + item.bytes.len()].copy_from_slice(&item.bytes);
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        fs::write(path, self.to_bytes())
    }
}

pub fn assemble(source: &str) -> Result<Image, Vec<AsmError>> {
    let mut asm = Assembler::new();
    asm.first_pass(source);
    asm.second_pass(source);
    asm.finish()
}

struct Assembler {
    labels: Vec<(String, u32)>,
    data: Vec<DataItem>,
    errors: Vec<AsmError>,
    code: Vec<u16>,
    org: u32,
    data_base: u16,
    pass1_words: usize,
}

impl Assembler {
    fn new() -> Assembler {
        Assembler {
            labels: Vec::new(),
            data: Vec::new(),
            errors: Vec::new(),
            code: Vec::new(),
            org: 0,
            data_base: isa::DATA_BASE,
            pass1_words: 0,
        }
    }

    fn finish(self) -> Result<Image, Vec<AsmError>> {
        if self.errors.is_empty() {
            Ok(Image {
                org: self.org as u16,
                code: self.code,
                data: self.data,
                data_end: self.data_base,
            })
        } else {
            Err(self.errors)
        }
    }

    fn error(&mut self, line: usize, message: impl Into<String>) {
        self.errors.push(AsmError { line, message: message.into() });
    }

    fn cur_ip(&self) -> u32 {
        self.org + self.pass1_words as u32 * 2
    }

    // ---- pass 1: origin, labels, data, instruction costing ----

    fn first_pass(&mut self, source: &str) {
        for (index, raw) in source.lines().enumerate() {
            let line = index + 1;
            let text = strip_comment(raw).trim();
            if text.is_empty() {
                continue;
            }
            let lower = text.to_ascii_lowercase();
            if lower.starts_with(".org") {
                let rest = text[4..].trim();
                if rest.is_empty() {
                    self.error(line, ".org needs a value");
                } else {
                    self.handle_org(line, rest);
                }
                continue;
            }
            if lower.starts_with(".data") {
                let rest = text[5..].trim();
                self.data_directive(line, rest);
                continue;
            }
            if let Some((name, rest)) = split_label(text) {
                if name.is_empty() {
                    self.error(line, "empty label");
                    continue;
                }
                let rest = rest.trim();
                if rest.is_empty() {
                    self.define_label(line, name);
                    continue;
                }
                if let Some((ty, values)) = split_data_decl(rest) {
                    if values.is_empty() {
                        self.error(line, format!("data '{name}' has no values"));
                    } else {
                        self.add_data(line, name, ty, values);
                    }
                    continue;
                }
                self.define_label(line, name);
                self.cost_instruction(rest);
                continue;
            }
            self.cost_instruction(text);
        }
    }

    fn handle_org(&mut self, line: usize, rest: &str) {
        let Some(value) = parse_number(rest) else {
            self.error(line, format!(".org: bad number '{rest}'"));
            return;
        };
        if value > 0xFFFF {
            self.error(line, format!(".org {value:#x} does not fit in 16 bits"));
            return;
        }
        if (isa::RESERVED_LO as u32..=isa::RESERVED_HI as u32).contains(&value) {
            self.error(line, format!(".org {value:#06x} forbidden (firmware/MMIO)"));
            return;
        }
        self.org = value;
    }

    fn data_directive(&mut self, line: usize, rest: &str) {
        let name_len = rest.chars().take_while(|c| is_ident_char(*c)).count();
        let name = &rest[..name_len];
        let after = rest[name_len..].trim_start();
        let Some(after) = after.strip_prefix(':') else {
            self.error(line, "data syntax: .data name: type values or name: type values");
            return;
        };
        let after = after.trim_start();
        let Some((ty, values)) = split_data_decl(after) else {
            let word: String = after.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
            self.error(line, format!("unknown data type '{word}'"));
            return;
        };
        if values.is_empty() {
            self.error(line, format!("data '{name}' has no values"));
            return;
        }
        self.add_data(line, name, ty, values);
    }

    fn define_label(&mut self, line: usize, name: &str) {
        if self.symbol_exists(name) {
            self.error(line, format!("duplicate label '{name}'"));
            return;
        }
        self.labels.push((name.to_string(), self.cur_ip()));
    }

    fn add_data(&mut self, line: usize, name: &str, ty: DataType, values: &str) {
        if !name.is_empty() && self.symbol_exists(name) {
            self.error(line, format!("duplicate data name '{name}'"));
            return;
        }
        // Alignment applies to the base before the allocation, never after.
        let align = ty.width().max(1);
        if align > 1 {
            self.data_base = (self.data_base + align - 1) & !(align - 1);
        }
        let Some(bytes) = self.data_values(line, ty, values) else {
            return;
        };
        let end = self.data_base as u32 + bytes.len() as u32;
        if end > isa::RESERVED_LO as u32 {
            self.error(line, format!("data '{name}' reaches the reserved region"));
            return;
        }
        self.data.push(DataItem {
            name: name.to_string(),
            width: ty.width(),
            addr: self.data_base,
            bytes,
        });
        self.data_base = end as u16;
    }

    fn data_values(&mut self, line: usize, ty: DataType, values: &str) -> Option<Vec<u8>> {
        let mut bytes = Vec::new();
        let mut any = false;
        for token in split_values(values) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            any = true;
            if let Some(literal) = token.strip_prefix('"') {
                if ty != DataType::Db {
                    self.error(line, "strings are only allowed with db");
                    return None;
                }
                let Some(end) = literal.find('"') else {
                    self.error(line, "unterminated string");
                    return None;
                };
                bytes.extend_from_slice(literal[..end].as_bytes());
                bytes.push(0);
                continue;
            }
            let Some(value) = parse_number(token) else {
                self.error(line, format!("invalid number in data: '{token}'"));
                return None;
            };
            if !ty.fits(value) {
                self.error(
                    line,
                    format!("value {value:#x} too large for {}", ty.name()),
                );
                return None;
            }
            match ty {
                DataType::Db => bytes.push(value as u8),
                DataType::Dw => bytes.extend_from_slice(&(value as u16).to_le_bytes()),
                DataType::Dd => bytes.extend_from_slice(&value.to_le_bytes()),
            }
        }
        if !any {
            self.error(line, "empty data list");
            return None;
        }
        Some(bytes)
    }

    fn cost_instruction(&mut self, text: &str) {
        let (mnemonic, rest) = split_mnemonic(text);
        let Some(op) = Opcode::from_mnemonic(mnemonic) else {
            // Reported by pass 2; an uncosted broken line cannot shift
            // labels because no output is written once it is reported.
            return;
        };
        let shapes: Vec<Shape> = split_args(rest).iter().map(|arg| operand_shape(arg)).collect();
        let words = select_mode(op, &shapes).map(Mode::words).unwrap_or(1);
        self.pass1_words += words;
    }

    // ---- pass 2: operand resolution and encoding ----

    fn second_pass(&mut self, source: &str) {
        for (index, raw) in source.lines().enumerate() {
            let line = index + 1;
            let text = strip_comment(raw).trim();
            if text.is_empty() {
                continue;
            }
            let lower = text.to_ascii_lowercase();
            if lower.starts_with(".org") || lower.starts_with(".data") {
                continue;
            }
            let text = match split_label(text) {
                Some((_, rest)) => {
                    let rest = rest.trim();
                    if rest.is_empty() || split_data_decl(rest).is_some() {
                        continue;
                    }
                    rest
                }
                None => text,
            };
            self.encode_instruction(line, text);
        }
    }

    fn encode_instruction(&mut self, line: usize, text: &str) {
        let (mnemonic, rest) = split_mnemonic(text);
        let Some(op) = Opcode::from_mnemonic(mnemonic) else {
            self.error(line, format!("unknown mnemonic '{mnemonic}'"));
            return;
        };
        let args = split_args(rest);
        match op.argc() {
            2 if args.len() != 2 || args.iter().any(|a| a.is_empty()) => {
                self.error(line, format!("{mnemonic} needs 2 args"));
                return;
            }
            1 if args.is_empty() => {
                self.error(line, format!("{mnemonic} needs 1 arg"));
                return;
            }
            1 if args.len() > 1 => {
                self.error(line, format!("{mnemonic} takes 1 arg (got more)"));
                return;
            }
            0 if !args.is_empty() => {
                self.error(line, format!("{mnemonic} takes no args"));
                return;
            }
            _ => {}
        }
        let shapes: Vec<Shape> = args.iter().map(|arg| operand_shape(arg)).collect();
        let Some(mode) = select_mode(op, &shapes) else {
            self.error(
                line,
                format!("unsupported operand combo '{mnemonic} {}'", args.join(",")),
            );
            return;
        };
        match mode {
            Mode::None => self.emit(isa::pack(op, 0, 0, Mode::None), None),
            Mode::Reg => {
                let Shape::Reg(reg) = shapes[0] else { unreachable!() };
                self.emit(isa::pack(op, reg as u8, 0, Mode::Reg), None);
            }
            Mode::RegReg => {
                let (Shape::Reg(r1), Shape::Reg(r2)) = (&shapes[0], &shapes[1]) else {
                    unreachable!()
                };
                self.emit(isa::pack(op, *r1 as u8, *r2 as u8, Mode::RegReg), None);
            }
            Mode::Imm => {
                let Some(value) = self.resolve(line, &shapes[0]) else { return };
                self.emit(isa::pack(op, 0, 0, Mode::Imm), Some(value));
            }
            Mode::RegImm | Mode::RegMem => {
                let Shape::Reg(reg) = shapes[0] else { unreachable!() };
                let Some(value) = self.resolve(line, &shapes[1]) else { return };
                self.emit(isa::pack(op, reg as u8, 0, mode), Some(value));
            }
            Mode::MemRead => {
                if op != Opcode::MOV {
                    self.error(
                        line,
                        format!("unsupported operand combo '{mnemonic} {}'", args.join(",")),
                    );
                    return;
                }
                let Shape::Reg(reg) = shapes[0] else { unreachable!() };
                let Shape::Mem(ref inner) = shapes[1] else { unreachable!() };
                let Some(addr) = self.resolve_name_or_number(line, inner) else { return };
                self.emit(isa::pack(Opcode::MOVRM, reg as u8, 0, Mode::MemRead), Some(addr));
            }
            Mode::MemWrite => {
                if op != Opcode::MOV {
                    self.error(
                        line,
                        format!("unsupported operand combo '{mnemonic} {}'", args.join(",")),
                    );
                    return;
                }
                let Shape::Mem(ref inner) = shapes[0] else { unreachable!() };
                let Shape::Reg(reg) = shapes[1] else { unreachable!() };
                let Some(addr) = self.resolve_name_or_number(line, inner) else { return };
                self.emit(isa::pack(Opcode::MOVMR, reg as u8, 0, Mode::MemWrite), Some(addr));
            }
        }
    }

    fn emit(&mut self, header: u16, operand: Option<u16>) {
        self.code.push(header);
        if let Some(word) = operand {
            self.code.push(word);
        }
    }

    /// Resolution precedence: register and number are decided by shape;
    /// names try code labels first, then data items.
    fn resolve(&mut self, line: usize, shape: &Shape) -> Option<u16> {
        match shape {
            Shape::Num(value) => Some(*value as u16),
            Shape::Name(name) => self.resolve_symbol(line, name),
            Shape::Reg(_) | Shape::Mem(_) => {
                self.error(line, "bad operand");
                None
            }
        }
    }

    fn resolve_name_or_number(&mut self, line: usize, inner: &str) -> Option<u16> {
        if let Some(value) = parse_number(inner) {
            return Some(value as u16);
        }
        self.resolve_symbol(line, inner)
    }

    fn resolve_symbol(&mut self, line: usize, name: &str) -> Option<u16> {
        if let Some(addr) = self.find_label(name) {
            return Some(addr as u16);
        }
        if let Some(addr) = self.find_data(name) {
            return Some(addr);
        }
        self.error(line, format!("unresolved name '{name}'"));
        None
    }

    fn find_label(&self, name: &str) -> Option<u32> {
        self.labels.iter().find(|(n, _)| n == name).map(|(_, addr)| *addr)
    }

    fn find_data(&self, name: &str) -> Option<u16> {
        self.data.iter().find(|item| item.name == name).map(|item| item.addr)
    }

    fn symbol_exists(&self, name: &str) -> bool {
        self.find_label(name).is_some() || self.find_data(name).is_some()
    }
}

/// The operand-shape table both passes agree on: modes 0..=2 cost one word,
/// everything else two. `None` means pass 2 will reject the line.
fn select_mode(op: Opcode, shapes: &[Shape]) -> Option<Mode> {
    match op.argc() {
        0 => Some(Mode::None),
        1 => match shapes {
            [Shape::Reg(_)] => Some(Mode::Reg),
            [Shape::Num(_)] | [Shape::Name(_)] => Some(Mode::Imm),
            _ => None,
        },
        _ => match shapes {
            [Shape::Reg(_), Shape::Reg(_)] => Some(Mode::RegReg),
            [Shape::Reg(_), Shape::Num(_)] => Some(Mode::RegImm),
            [Shape::Reg(_), Shape::Name(_)] => Some(Mode::RegMem),
            [Shape::Reg(_), Shape::Mem(_)] => Some(Mode::MemRead),
            [Shape::Mem(_), Shape::Reg(_)] => Some(Mode::MemWrite),
            _ => None,
        },
    }
}

fn operand_shape(arg: &str) -> Shape {
    if let Some(inner) = arg.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return Shape::Mem(inner.trim().to_string());
    }
    if let Some(reg) = Register::from_name(arg) {
        return Shape::Reg(reg);
    }
    if let Some(value) = parse_number(arg) {
        return Shape::Num(value);
    }
    Shape::Name(arg.to_string())
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Cuts the line at the first semicolon outside a string literal.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, c) in line.char_indices() {
        match c {
            '"' => in_string = !in_string,
            ';' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn split_label(text: &str) -> Option<(&str, &str)> {
    let colon = text.find(':')?;
    Some((text[..colon].trim(), &text[colon + 1..]))
}

/// `db`/`dw`/`dd` followed by its value list, if this is a data declaration.
fn split_data_decl(text: &str) -> Option<(DataType, &str)> {
    let len = text.chars().take_while(|c| c.is_ascii_alphabetic()).count();
    let ty = DataType::from_name(&text[..len])?;
    Some((ty, text[len..].trim()))
}

fn split_mnemonic(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(at) => (&text[..at], text[at..].trim()),
        None => (text, ""),
    }
}

fn split_args(rest: &str) -> Vec<&str> {
    if rest.trim().is_empty() {
        return Vec::new();
    }
    rest.split(',').map(str::trim).collect()
}

/// Comma splitting for data value lists, with commas inside string literals
/// left alone. Consecutive separators collapse.
fn split_values(values: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_string = false;
    for (index, c) in values.char_indices() {
        match c {
            '"' => in_string = !in_string,
            ',' if !in_string => {
                out.push(&values[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    out.push(&values[start..]);
    out
}

fn parse_number(text: &str) -> Option<u32> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        return u32::from_str_radix(bin, 2).ok();
    }
    text.parse().ok()
}
