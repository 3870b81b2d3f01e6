use crate::error::{Error, Result};
use crate::util::get_command_output;
use std::io::Write;

/// Absolute path of the external disassembler.
pub const OBJDUMP: &str = "/usr/bin/objdump";

/// One disassembled instruction: where it was when disassembled, its raw
/// bytes, and the decoded text. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operands: String,
}

impl Instruction {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse one line of `objdump -D` output.
///
/// The first hex token before a colon is the address; subsequent
/// two-character hex tokens are the opcode bytes, terminated by a
/// non-hex token which is the mnemonic; the rest of that token's field,
/// up to the next whitespace, is the operand text. Labels, headers and
/// blank lines all fail one of the checks and yield `None`.
fn parse_objdump_line(line: &str) -> Option<Instruction> {
    let line = line.trim_start();
    let colon = line.find(':')?;
    let addr_tok = line[..colon].trim();
    if !is_hex(addr_tok) {
        return None;
    }
    let address = u64::from_str_radix(addr_tok, 16).ok()?;

    let mut tokens = line[colon + 1..].split_whitespace();

    let mut bytes = Vec::new();
    let mnemonic = loop {
        let tok = tokens.next()?;
        if tok.len() == 2 && is_hex(tok) {
            bytes.push(u8::from_str_radix(tok, 16).ok()?);
        } else {
            break tok;
        }
    };
    if bytes.is_empty() {
        return None;
    }

    // Instructions like `ret` or `nop` carry no operand field.
    let operands = tokens.next().unwrap_or("");

    Some(Instruction {
        address,
        bytes,
        mnemonic: mnemonic.to_owned(),
        operands: operands.to_owned(),
    })
}

fn parse_disassembly(output: &[u8]) -> Vec<Instruction> {
    String::from_utf8_lossy(output)
        .lines()
        .filter_map(parse_objdump_line)
        .collect()
}

/// Disassemble `file` between `address` and `address + min_bytes`. The
/// result covers at least `min_bytes` (the final instruction may extend
/// past the stop address).
pub fn get_instructions(file: &str, address: u64, min_bytes: usize) -> Result<Vec<Instruction>> {
    let start = format!("--start-address={:#x}", address);
    let stop = format!("--stop-address={:#x}", address + min_bytes as u64);
    let out = get_command_output(OBJDUMP, &["-D", file, &start, &stop], None)?;

    let insns = parse_disassembly(&out);
    if insns.is_empty() {
        return Err(Error::ToolFailure(format!(
            "objdump produced no instructions for {} at {:#x}",
            file, address
        )));
    }
    Ok(insns)
}

/// Disassemble a raw buffer in x86-64 mode by spilling it to a temporary
/// file. Instruction addresses are offsets from the start of the buffer.
pub fn get_instructions_from_memory(buf: &[u8]) -> Result<Vec<Instruction>> {
    let mut tmp = tempfile::NamedTempFile::new()
        .map_err(|e| Error::ToolFailure(format!("temp file: {}", e)))?;
    tmp.write_all(buf)
        .map_err(|e| Error::ToolFailure(format!("temp file: {}", e)))?;

    let path = tmp.path().to_string_lossy().into_owned();
    let out = get_command_output(
        OBJDUMP,
        &["-b", "binary", "-m", "i386", "-M", "x86-64", "-D", &path],
        None,
    )?;

    let insns = parse_disassembly(&out);
    if insns.is_empty() {
        return Err(Error::ToolFailure(
            "objdump produced no instructions for buffer".to_owned(),
        ));
    }
    Ok(insns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn push_line_parses() {
        let i = parse_objdump_line("   0:\t55                   \tpush   %rbp").unwrap();
        assert_eq!(i.address, 0);
        assert_eq!(i.bytes, vec![0x55]);
        assert_eq!(i.mnemonic, "push");
        assert_eq!(i.operands, "%rbp");
    }

    #[test]
    fn multi_byte_line_parses() {
        let i =
            parse_objdump_line("  401126:\t48 89 e5             \tmov    %rsp,%rbp").unwrap();
        assert_eq!(i.address, 0x401126);
        assert_eq!(i.bytes, vec![0x48, 0x89, 0xe5]);
        assert_eq!(i.mnemonic, "mov");
        assert_eq!(i.operands, "%rsp,%rbp");
    }

    #[test]
    fn operand_less_line_parses() {
        let i = parse_objdump_line("  10:\tc3                   \tret").unwrap();
        assert_eq!(i.bytes, vec![0xc3]);
        assert_eq!(i.mnemonic, "ret");
        assert_eq!(i.operands, "");
    }

    #[test]
    fn trailing_comment_is_dropped() {
        let i = parse_objdump_line(
            "  11:\t48 8d 05 00 00 00 00 \tlea    0x0(%rip),%rax        # 0x18",
        )
        .unwrap();
        assert_eq!(i.mnemonic, "lea");
        assert_eq!(i.operands, "0x0(%rip),%rax");
    }

    #[test]
    fn labels_and_headers_are_rejected() {
        assert!(parse_objdump_line("0000000000001000 <main>:").is_none());
        assert!(parse_objdump_line("Disassembly of section .text:").is_none());
        assert!(parse_objdump_line("/tmp/spill: file format binary").is_none());
        assert!(parse_objdump_line("").is_none());
    }

    #[test]
    fn file_range_covers_requested_bytes() {
        if !Path::new(OBJDUMP).exists() {
            return;
        }
        let exe = std::fs::canonicalize("/proc/self/exe").unwrap();
        let bytes = std::fs::read(&exe).unwrap();
        let entry = goblin::elf::Elf::parse(&bytes).unwrap().header.e_entry;

        let insns = get_instructions(&exe.to_string_lossy(), entry, 16).unwrap();
        assert!(!insns.is_empty());
        assert_eq!(insns[0].address, entry);
        let covered: usize = insns.iter().map(|i| i.len()).sum();
        assert!(covered >= 16);
    }

    #[test]
    fn buffer_roundtrips_through_objdump() {
        if !Path::new(OBJDUMP).exists() {
            return;
        }
        // push %rbp; mov %rsp,%rbp; ret
        let code = [0x55, 0x48, 0x89, 0xe5, 0xc3];
        let insns = get_instructions_from_memory(&code).unwrap();
        assert_eq!(insns.len(), 3);
        assert_eq!(insns[0].mnemonic, "push");
        assert_eq!(insns[1].bytes, vec![0x48, 0x89, 0xe5]);
        assert_eq!(insns[2].mnemonic, "ret");
        let total: usize = insns.iter().map(|i| i.len()).sum();
        assert_eq!(total, code.len());
    }
}
