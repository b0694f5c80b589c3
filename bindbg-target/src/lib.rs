//! bindbg ターゲットプロセス制御
//!
//! このクレートは、デバッグ対象のプロセスとバイナリを扱う低レベル機能を提供します。
//! ptrace、レジスタアクセス、メモリアクセス、ブレークポイント設定、逆アセンブル、
//! 実行ファイルのシンボル読み込みなどを行います。

pub mod disasm;
pub mod image;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod breakpoint;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod memory;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod process;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod registers;

pub use disasm::{Decoder, Instruction};
pub use image::{ModuleImage, Symbol};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use breakpoint::SoftwareBreakpoint;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use memory::{Memory, MemoryMapping};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use process::{Process, StopReason};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use registers::Registers;

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
