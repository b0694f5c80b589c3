//! ブレークポイント機能

use crate::{Memory, Result};

/// INT3命令のオペコード
pub const INT3_OPCODE: u8 = 0xCC;

/// ソフトウェアブレークポイント（INT3命令）
#[derive(Debug)]
pub struct SoftwareBreakpoint {
    address: u64,
    original_byte: u8,
    enabled: bool,
}

impl SoftwareBreakpoint {
    /// ブレークポイントを作成する
    pub fn new(address: u64) -> Self {
        Self {
            address,
            original_byte: 0,
            enabled: false,
        }
    }

    /// ブレークポイントのアドレスを取得する
    pub fn address(&self) -> u64 {
        self.address
    }

    /// ブレークポイントが有効かどうか
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 指定されたアドレスの命令を0xCC（INT3）で置き換える
    pub fn enable(&mut self, memory: &Memory) -> Result<()> {
        if self.enabled {
            return Ok(());
        }
        self.original_byte = memory.read_u8(self.address)?;
        memory.write_u8(self.address, INT3_OPCODE)?;
        self.enabled = true;
        Ok(())
    }

    /// INT3命令を元のバイトに戻す
    pub fn disable(&mut self, memory: &Memory) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        memory.write_u8(self.address, self.original_byte)?;
        self.enabled = false;
        Ok(())
    }

    /// `base` から読んだバイト列の中のINT3を元のバイトに戻す
    ///
    /// 逆アセンブル前にブレークポイントを見えなくするために使います。
    pub fn unpatch(&self, bytes: &mut [u8], base: u64) {
        if !self.enabled || self.address < base {
            return;
        }
        if let Some(byte) = bytes.get_mut((self.address - base) as usize) {
            *byte = self.original_byte;
        }
    }
}
