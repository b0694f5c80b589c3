//! 逆アセンブル機能
//!
//! capstoneで1命令ずつデコードします。

use crate::Result;
use capstone::prelude::*;

/// x86_64の命令の最大長
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// デコードされた1命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub length: u64,
    pub mnemonic: String,
    pub operands: String,
}

impl Instruction {
    /// `mnemonic operands` 形式のテキスト
    pub fn text(&self) -> String {
        if self.operands.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, self.operands)
        }
    }

    /// 次の命令のアドレス
    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.length)
    }

    pub fn is_call(&self) -> bool {
        self.mnemonic.starts_with("call")
    }

    pub fn is_ret(&self) -> bool {
        matches!(self.mnemonic.as_str(), "ret" | "retq" | "retn")
    }
}

/// x86_64用の逆アセンブラ
pub struct Decoder {
    cs: Capstone,
}

impl Decoder {
    /// Intel構文の64ビットデコーダを作成する
    pub fn x86_64() -> Result<Self> {
        let cs = Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .syntax(arch::x86::ArchSyntax::Intel)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create Capstone: {}", e))?;
        Ok(Self { cs })
    }

    /// 先頭の1命令をデコードする
    ///
    /// 不正なバイト列の場合は `None` を返します。
    pub fn decode(&self, code: &[u8], address: u64) -> Result<Option<Instruction>> {
        let insns = self
            .cs
            .disasm_count(code, address, 1)
            .map_err(|e| anyhow::anyhow!("Failed to disassemble at 0x{:x}: {}", address, e))?;
        Ok(insns.iter().next().map(|insn| Instruction {
            address: insn.address(),
            length: insn.bytes().len() as u64,
            mnemonic: insn.mnemonic().unwrap_or("").to_string(),
            operands: insn.op_str().unwrap_or("").to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_instruction() {
        let decoder = Decoder::x86_64().unwrap();
        // mov rax, 1; ret
        let code = [0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, 0xc3];
        let insn = decoder.decode(&code, 0x1000).unwrap().unwrap();
        assert_eq!(insn.mnemonic, "mov");
        assert_eq!(insn.operands, "rax, 1");
        assert_eq!(insn.length, 7);
        assert_eq!(insn.next_address(), 0x1007);

        let ret = decoder.decode(&code[7..], 0x1007).unwrap().unwrap();
        assert!(ret.is_ret());
        assert_eq!(ret.text(), "ret");
    }

    #[test]
    fn test_decode_indirect_call() {
        let decoder = Decoder::x86_64().unwrap();
        // call qword ptr [rax + 8]
        let insn = decoder.decode(&[0xff, 0x50, 0x08], 0x2000).unwrap().unwrap();
        assert!(insn.is_call());
        assert_eq!(insn.operands, "qword ptr [rax + 8]");
        assert_eq!(insn.length, 3);
    }
}
