//! vtable参照の推定
//!
//! 現在の命令が仮想関数呼び出しやvtableの読み出しに見える場合、
//! その参照先（と、分かれば参照元オブジェクト）を求めます。
//! オブジェクトの型推定はヒューリスティックで、基底クラスを指すこともあります。

use crate::backend::DebuggerBackend;
use crate::listing::{AnnotatedValue, Expression, ListingLine, ListingParser, ObjectBase, Operand, TermKind};
use crate::Result;
use bindbg_core::InstrKind;
use tracing::{debug, trace};

/// 命令の分類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VtableReference {
    /// 呼び出し先を指す `call`
    Call(CallTarget),
    /// メモリから読み出す `mov`。読み出した値がvtableへのポインタ
    ///
    /// 注釈がシンボルなら、デバッガが参照先まで読み出し済みなのでそのまま参照先とします。
    IndirectLoad {
        source: Expression,
        /// デバッガが注釈で示した読み出し済みの値
        loaded: Option<AnnotatedValue>,
    },
    /// アドレスを計算する `lea`
    PointerMaterialize { source: Expression },
    NotAVtableReference,
}

/// `call` の呼び出し先
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// 即値、シンボル、またはデバッガが読み出し済みの値
    Address(u64),
    Register(String),
    /// メモリ上のポインタ経由
    Memory(Expression),
}

/// 送信するvtableイベント（プロセス絶対アドレス）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtableEvent {
    pub ip: u64,
    pub target: u64,
    pub object: Option<u64>,
    pub instr: InstrKind,
}

/// インポートのシンボル名か
fn is_import_name(name: &str) -> bool {
    name.contains("_imp_")
}

/// 解析済みの行を分類する
///
/// インポートへの呼び出しと分かるものはここで除外します。
pub fn classify(line: &ListingLine) -> VtableReference {
    match line.mnemonic.as_str() {
        "call" => classify_call(line),
        "mov" => match line.memory_operand(1) {
            Some(memory) => VtableReference::IndirectLoad {
                source: memory.expr.clone(),
                loaded: line.annotation.as_ref().map(|a| a.value.clone()),
            },
            None => VtableReference::NotAVtableReference,
        },
        "lea" => match line.memory_operand(1) {
            Some(memory) => VtableReference::PointerMaterialize {
                source: memory.expr.clone(),
            },
            None => VtableReference::NotAVtableReference,
        },
        _ => VtableReference::NotAVtableReference,
    }
}

fn classify_call(line: &ListingLine) -> VtableReference {
    let Some(operand) = line.operands.first() else {
        return VtableReference::NotAVtableReference;
    };

    if let Some(annotation) = &line.annotation {
        if let AnnotatedValue::Symbol { name, .. } = &annotation.value {
            if is_import_name(name) {
                return VtableReference::NotAVtableReference;
            }
            // インポートアドレステーブル経由: `[app!_imp_X (addr)] ds:addr={...}`
            if let Operand::Memory(memory) = operand {
                if memory.expr.resolved.is_some() && memory.expr.resolved == annotation.location {
                    return VtableReference::NotAVtableReference;
                }
            }
        }
    }

    let target = match operand {
        Operand::Symbol { name, .. } if is_import_name(name) => return VtableReference::NotAVtableReference,
        Operand::Memory(memory) if memory_names_import(&memory.expr) => {
            return VtableReference::NotAVtableReference
        }
        Operand::Memory(memory) => match &line.annotation {
            // デバッガが読み出し済みの値を注釈している
            Some(annotation) => CallTarget::Address(annotation.value.addr()),
            None => CallTarget::Memory(memory.expr.clone()),
        },
        Operand::Immediate(value) => CallTarget::Address(*value),
        Operand::Symbol { addr: Some(addr), .. } => CallTarget::Address(*addr),
        Operand::Symbol { addr: None, .. } => return VtableReference::NotAVtableReference,
        Operand::Register(name) => CallTarget::Register(name.clone()),
    };
    VtableReference::Call(target)
}

fn memory_names_import(expr: &Expression) -> bool {
    expr.terms.iter().any(|term| match &term.kind {
        TermKind::Symbol { name, .. } => is_import_name(name),
        _ => false,
    })
}

/// vtable参照の推定器
pub struct VtableResolver {
    parser: ListingParser,
}

impl VtableResolver {
    /// 推定器を作成する
    pub fn new() -> Result<Self> {
        Ok(Self {
            parser: ListingParser::new()?,
        })
    }

    /// `ip` の命令を調べ、vtable参照ならイベントを返す
    ///
    /// 参照先が読み取れない場合はイベントを出しません。
    /// オブジェクトが読み取れない場合はオブジェクトだけを落とします。
    pub fn resolve<B: DebuggerBackend + ?Sized>(&self, backend: &mut B, ip: u64) -> Result<Option<VtableEvent>> {
        let text = backend.disassemble(ip)?;
        let line = match self.parser.parse(&text) {
            Ok(line) => line,
            Err(e) => {
                debug!("cannot parse disassembly '{}': {}", text, e);
                return Ok(None);
            }
        };

        let reference = classify(&line);
        trace!(?reference, "classified {}", text);
        let mut cx = Context {
            backend,
            ip,
            length: line.length,
        };

        let (instr, target, object) = match reference {
            VtableReference::NotAVtableReference => return Ok(None),
            VtableReference::Call(call) => {
                let (target, slot) = match call {
                    CallTarget::Address(addr) => (addr, None),
                    CallTarget::Register(name) => match cx.register(&name)? {
                        Some(value) => (value, None),
                        None => return Ok(None),
                    },
                    CallTarget::Memory(expr) => {
                        let Some(slot) = cx.evaluate(&expr)? else {
                            return Ok(None);
                        };
                        match cx.deref(slot)? {
                            Some(value) => (value, Some(slot)),
                            None => return Ok(None),
                        }
                    }
                };
                if cx.is_import(target) || slot.map_or(false, |slot| cx.is_import(slot)) {
                    debug!("call at {:#x} goes to an import", ip);
                    return Ok(None);
                }
                (InstrKind::Call, target, None)
            }
            VtableReference::IndirectLoad { source, loaded } => {
                let target = match loaded {
                    Some(AnnotatedValue::Symbol { addr, .. }) => Some(addr),
                    Some(AnnotatedValue::Value(vtable)) => cx.deref(vtable)?,
                    None => match cx.evaluate(&source)? {
                        Some(ptr) => match cx.deref(ptr)? {
                            Some(vtable) => cx.deref(vtable)?,
                            None => None,
                        },
                        None => None,
                    },
                };
                let Some(target) = target else {
                    return Ok(None);
                };
                (InstrKind::Mov, target, cx.object(&source)?)
            }
            VtableReference::PointerMaterialize { source } => {
                // leaはメモリを読まないが、シンボルを得るため計算したアドレスを読む
                let Some(target) = cx.evaluate(&source)?.map(|ptr| cx.deref(ptr)).transpose()?.flatten() else {
                    return Ok(None);
                };
                (InstrKind::Lea, target, cx.object(&source)?)
            }
        };

        if !cx.backend.is_valid(target) {
            debug!("vtable target {:#x} at {:#x} is not readable", target, ip);
            return Ok(None);
        }

        Ok(Some(VtableEvent {
            ip,
            target,
            object,
            instr,
        }))
    }
}

/// 式の評価に使う状態
struct Context<'a, B: DebuggerBackend + ?Sized> {
    backend: &'a mut B,
    ip: u64,
    length: Option<u64>,
}

impl<B: DebuggerBackend + ?Sized> Context<'_, B> {
    /// レジスタ値。命令ポインタは次の命令のアドレスとして扱う
    fn register(&mut self, name: &str) -> Result<Option<u64>> {
        match name {
            "rip" | "eip" => Ok(self.length.map(|len| self.ip.wrapping_add(len))),
            _ => self.backend.register(name).map(Some),
        }
    }

    fn evaluate(&mut self, expr: &Expression) -> Result<Option<u64>> {
        if let Some(addr) = expr.resolved {
            return Ok(Some(addr));
        }
        let mut total = 0u64;
        for term in &expr.terms {
            let value = match &term.kind {
                TermKind::Register { name, scale } => self.register(name)?.map(|v| v.wrapping_mul(*scale)),
                TermKind::Literal(value) => Some(*value),
                TermKind::Symbol { addr, .. } => *addr,
            };
            let Some(value) = value else {
                return Ok(None);
            };
            total = if term.negative {
                total.wrapping_sub(value)
            } else {
                total.wrapping_add(value)
            };
        }
        Ok(Some(total))
    }

    /// 読み取れるアドレスならポインタを読む
    fn deref(&mut self, addr: u64) -> Result<Option<u64>> {
        if !self.backend.is_valid(addr) {
            return Ok(None);
        }
        self.backend.read_pointer(addr).map(Some)
    }

    fn is_import(&mut self, addr: u64) -> bool {
        self.backend.symbol_at(addr).map_or(false, |symbol| symbol.is_import)
    }

    /// 参照元オブジェクトのvtableポインタ
    fn object(&mut self, source: &Expression) -> Result<Option<u64>> {
        let base = match source.object_base() {
            Some(ObjectBase::Address(addr)) => Some(addr),
            Some(ObjectBase::Register(name)) => self.register(&name)?,
            None => None,
        };
        match base {
            Some(base) => self.deref(base),
            None => Ok(None),
        }
    }
}
