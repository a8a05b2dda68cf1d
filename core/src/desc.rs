//! CAAM 作业描述符
//!
//! 描述符是一串 32 位字：命令字与操作数指针、长度交错排列。
//! 这里用带类型的字段描述一个作业，在提交时才编码成硬件看到的字序列。

use crate::error::{JobError, JobResult};

/// 描述符字数
pub const DESC_WORDS: usize = 9;

/// Key modifier 字节数
pub const KEY_MODIFIER_LEN: usize = 16;

/// Blob 相对明文的固定开销：32 字节 blob key + 16 字节 MAC
pub const BLOB_OVERHEAD: usize = 32 + 16;

/// 描述符长度字段可表示的最大长度
pub const MAX_OPERAND_LEN: usize = 0xFFFF;

// ============ 命令字 ============

/// 作业头：ONE 位 + 描述符长度 8
pub const CMD_JOB_HEADER: u32 = 0xB080_0008;
/// LOAD 命令：class 2 key modifier，长度 16 字节
pub const CMD_KEY_MODIFIER: u32 = 0x1440_0000 | KEY_MODIFIER_LEN as u32;
/// SEQ IN PTR 命令
pub const CMD_SEQ_IN_PTR: u32 = 0xF000_0000;
/// SEQ OUT PTR 命令
pub const CMD_SEQ_OUT_PTR: u32 = 0xF800_0000;
/// OPERATION 命令：blob 解封装
pub const OP_BLOB_DECAP: u32 = 0x860D_0000;
/// OPERATION 命令：blob 封装
pub const OP_BLOB_ENCAP: u32 = 0x870D_0000;

/// 命令字中操作数长度所在的低 16 位
const LEN_MASK: u32 = 0x0000_FFFF;

/// RNG 实例化描述符 (静态，无需替换操作数)
pub const RNG_INST_DESC: [u32; DESC_WORDS] = [
    0xB080_0009, // 作业头，长度 9
    0x12A0_0008, // LOAD 8 字节到 class 2 上下文
    0x0102_0304,
    0x0506_0708,
    0x8250_0404, // RNG OPERATION：实例化 state handle 0
    0xA200_0001, // JUMP：等待完成
    0x1088_0004, // LOAD 立即数到 clear written 寄存器
    0x0000_0001,
    0x8250_1000, // RNG OPERATION：生成 secure key
];

/// 根据明文长度计算 blob 长度
///
/// 封装与解封装必须使用同一个函数，否则长度字段不一致。
#[inline]
pub const fn blob_size(data_size: usize) -> usize {
    data_size + BLOB_OVERHEAD
}

/// Blob 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobOp {
    /// 明文 -> blob
    Encap,
    /// blob -> 明文
    Decap,
}

impl BlobOp {
    fn opcode(self) -> u32 {
        match self {
            BlobOp::Encap => OP_BLOB_ENCAP,
            BlobOp::Decap => OP_BLOB_DECAP,
        }
    }

    fn from_opcode(word: u32) -> Option<Self> {
        match word {
            OP_BLOB_ENCAP => Some(BlobOp::Encap),
            OP_BLOB_DECAP => Some(BlobOp::Decap),
            _ => None,
        }
    }
}

/// 描述符中的一个数据操作数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    /// 总线地址
    pub addr: u32,
    /// 字节数
    pub len: u16,
}

impl Operand {
    /// 创建操作数，长度必须能放进 16 位长度字段
    pub fn new(addr: u32, len: usize) -> JobResult<Self> {
        let len = u16::try_from(len).map_err(|_| JobError::InvalidLength(len))?;
        Ok(Self { addr, len })
    }
}

/// Blob 封装/解封装描述符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobDescriptor {
    pub op: BlobOp,
    /// key modifier 的总线地址
    pub key_modifier: u32,
    pub input: Operand,
    pub output: Operand,
}

impl BlobDescriptor {
    /// 封装：读取 `data_size` 字节明文，写出 `blob_size(data_size)` 字节 blob
    pub fn encap(plaintext: u32, blob: u32, key_modifier: u32, data_size: usize) -> JobResult<Self> {
        Ok(Self {
            op: BlobOp::Encap,
            key_modifier,
            input: Operand::new(plaintext, data_size)?,
            output: Operand::new(blob, blob_size(data_size))?,
        })
    }

    /// 解封装：读取 `blob_size(data_size)` 字节 blob，写出 `data_size` 字节明文
    pub fn decap(plaintext: u32, blob: u32, key_modifier: u32, data_size: usize) -> JobResult<Self> {
        Ok(Self {
            op: BlobOp::Decap,
            key_modifier,
            input: Operand::new(blob, blob_size(data_size))?,
            output: Operand::new(plaintext, data_size)?,
        })
    }

    /// 将描述符编码为硬件字序列
    pub fn emit(&self, out: &mut [u32; DESC_WORDS]) {
        out[0] = CMD_JOB_HEADER;
        out[1] = CMD_KEY_MODIFIER;
        out[2] = self.key_modifier;
        out[3] = CMD_SEQ_IN_PTR | (self.input.len as u32 & LEN_MASK);
        out[4] = self.input.addr;
        out[5] = CMD_SEQ_OUT_PTR | (self.output.len as u32 & LEN_MASK);
        out[6] = self.output.addr;
        out[7] = self.op.opcode();
        out[8] = 0;
    }

    fn parse(words: &[u32; DESC_WORDS]) -> Option<Self> {
        if words[0] != CMD_JOB_HEADER
            || words[1] != CMD_KEY_MODIFIER
            || words[3] & !LEN_MASK != CMD_SEQ_IN_PTR
            || words[5] & !LEN_MASK != CMD_SEQ_OUT_PTR
        {
            return None;
        }
        Some(Self {
            op: BlobOp::from_opcode(words[7])?,
            key_modifier: words[2],
            input: Operand {
                addr: words[4],
                len: (words[3] & LEN_MASK) as u16,
            },
            output: Operand {
                addr: words[6],
                len: (words[5] & LEN_MASK) as u16,
            },
        })
    }
}

/// 可提交到作业环的描述符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    Blob(BlobDescriptor),
    /// 实例化硬件 RNG
    InstantiateRng,
}

impl Descriptor {
    /// 将描述符编码为硬件字序列
    pub fn emit(&self, out: &mut [u32; DESC_WORDS]) {
        match self {
            Descriptor::Blob(blob) => blob.emit(out),
            Descriptor::InstantiateRng => *out = RNG_INST_DESC,
        }
    }

    /// 从字序列还原描述符，无法识别时返回 `None`
    pub fn parse(words: &[u32; DESC_WORDS]) -> Option<Self> {
        if *words == RNG_INST_DESC {
            return Some(Descriptor::InstantiateRng);
        }
        BlobDescriptor::parse(words).map(Descriptor::Blob)
    }

    /// 用于日志的作业名
    pub fn name(&self) -> &'static str {
        match self {
            Descriptor::Blob(BlobDescriptor { op: BlobOp::Encap, .. }) => "blob encap",
            Descriptor::Blob(BlobDescriptor { op: BlobOp::Decap, .. }) => "blob decap",
            Descriptor::InstantiateRng => "RNG instantiation",
        }
    }
}
