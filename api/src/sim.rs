//! 测试用 CAAM 模拟器
//!
//! 同时实现 [`RegisterAccess`] 和 [`DmaOps`]：寄存器保存在内存中，
//! 总线地址映射到宿主机内存，写 IRJAR 时立即用软件模型执行作业。
//!
//! 模拟器同时检查缓存一致性：设备读取的区间必须在本作业之前被写回，
//! 设备写入的区间在 CPU 无效化之前一直记为过期。

use std::{cell::RefCell, collections::BTreeMap, rc::Rc, vec::Vec};

use caam_core::{
    cache::DmaOps,
    desc::{BLOB_OVERHEAD, BlobDescriptor, BlobOp, DESC_WORDS, Descriptor, KEY_MODIFIER_LEN},
    error::{JobError, JobResult},
    regs::*,
};
use memory_addr::{VirtAddr, VirtAddrRange};

/// blob 校验失败时的状态字
pub const BLOB_INTEGRITY_FAULT: u32 = 0x4000_0086;
/// 无法识别描述符时的状态字
pub const INVALID_DESCRIPTOR: u32 = 0x2000_0001;
/// RNG 实例化失败时的状态字
pub const RNG_FAULT: u32 = 0x2000_0030;

/// 模拟器观察到的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    Write { offset: usize, value: u32 },
    Flush { start: usize, end: usize },
    Invalidate { start: usize, end: usize },
}

struct SimState {
    regs: BTreeMap<usize, u32>,
    /// 总线地址 -> (宿主机地址, 长度)
    by_bus: BTreeMap<u32, (usize, usize)>,
    by_vaddr: BTreeMap<usize, u32>,
    next_bus: u32,
    events: Vec<SimEvent>,
    jobs: Vec<Descriptor>,

    echo_override: Option<u32>,
    status_override: Option<u32>,
    stall: bool,
    pending: Option<u32>,
    rng_fails: bool,
    secmem_stuck: bool,

    /// 本作业之前写回过的区间
    flushed: Vec<(usize, usize)>,
    /// 设备读取时没有被写回覆盖的区间
    unflushed: Vec<(usize, usize)>,
    /// 设备写入后尚未无效化的区间
    stale: Vec<(usize, usize)>,
    skip_flushes: bool,
}

/// 共享状态的模拟 CAAM，clone 得到同一设备的另一个句柄
#[derive(Clone)]
pub struct SimCaam(Rc<RefCell<SimState>>);

impl SimCaam {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(SimState {
            regs: BTreeMap::new(),
            by_bus: BTreeMap::new(),
            by_vaddr: BTreeMap::new(),
            next_bus: 0x1000_0000,
            events: Vec::new(),
            jobs: Vec::new(),
            echo_override: None,
            status_override: None,
            stall: false,
            pending: None,
            rng_fails: false,
            secmem_stuck: false,
            flushed: Vec::new(),
            unflushed: Vec::new(),
            stale: Vec::new(),
            skip_flushes: false,
        })))
    }

    /// 直接设置寄存器值 (不记录事件)
    pub fn set_reg(&self, offset: usize, value: u32) {
        self.0.borrow_mut().regs.insert(offset, value);
    }

    pub fn reg(&self, offset: usize) -> u32 {
        self.0.borrow().reg(offset)
    }

    /// 下一个作业回显指定地址
    pub fn echo_once(&self, addr: u32) {
        self.0.borrow_mut().echo_override = Some(addr);
    }

    /// 下一个作业报告指定状态字
    pub fn status_once(&self, status: u32) {
        self.0.borrow_mut().status_override = Some(status);
    }

    /// 作业提交后不完成
    pub fn set_stall(&self, stall: bool) {
        self.0.borrow_mut().stall = stall;
    }

    /// 完成被挂起的作业
    pub fn complete_pending(&self) {
        let mut state = self.0.borrow_mut();
        if let Some(desc_bus) = state.pending.take() {
            state.complete(desc_bus);
        }
    }

    /// RNG 实例化作业失败
    pub fn fail_rng(&self) {
        self.0.borrow_mut().rng_fails = true;
    }

    /// 安全内存命令永不结束
    pub fn stick_secmem(&self) {
        self.0.borrow_mut().secmem_stuck = true;
    }

    /// 忽略之后所有的写回操作
    pub fn skip_flushes(&self) {
        self.0.borrow_mut().skip_flushes = true;
    }

    /// 设备读到的未写回区间 (起始地址, 长度)
    pub fn unflushed(&self) -> Vec<(usize, usize)> {
        self.0.borrow().unflushed.clone()
    }

    /// 设备写入后 CPU 尚未无效化的区间 [start, end)
    pub fn stale(&self) -> Vec<(usize, usize)> {
        self.0.borrow().stale.clone()
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.0.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.0.borrow_mut().events.clear();
    }

    /// 已执行的作业
    pub fn jobs(&self) -> Vec<Descriptor> {
        self.0.borrow().jobs.clone()
    }

    /// 对某个寄存器的写入次数
    pub fn writes_to(&self, offset: usize) -> usize {
        self.0
            .borrow()
            .events
            .iter()
            .filter(|e| matches!(e, SimEvent::Write { offset: o, .. } if *o == offset))
            .count()
    }
}

impl SimState {
    fn reg(&self, offset: usize) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn host(&self, bus: u32, len: usize) -> usize {
        let (vaddr, mapped) = self
            .by_bus
            .get(&bus)
            .copied()
            .unwrap_or_else(|| panic!("unmapped bus address 0x{bus:08x}"));
        assert!(len <= mapped, "access of {len} bytes beyond mapping of {mapped}");
        vaddr
    }

    /// 设备读取 `[vaddr, vaddr + len)`
    fn device_read(&mut self, vaddr: usize, len: usize) {
        let covered = self
            .flushed
            .iter()
            .any(|&(start, end)| start <= vaddr && vaddr + len <= end);
        if len != 0 && !covered {
            self.unflushed.push((vaddr, len));
        }
    }

    /// 设备写入 `[vaddr, vaddr + len)`
    fn device_write(&mut self, vaddr: usize, len: usize) {
        if len != 0 {
            self.stale.push((vaddr, vaddr + len));
        }
    }

    fn read_bytes(&mut self, bus: u32, len: usize) -> Vec<u8> {
        let vaddr = self.host(bus, len);
        self.device_read(vaddr, len);
        unsafe { std::slice::from_raw_parts(vaddr as *const u8, len).to_vec() }
    }

    fn write_bytes(&mut self, bus: u32, data: &[u8]) {
        let vaddr = self.host(bus, data.len());
        self.device_write(vaddr, data.len());
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), vaddr as *mut u8, data.len()) };
    }

    fn read_word(&mut self, bus: u32, index: usize) -> u32 {
        let vaddr = self.host(bus, (index + 1) * 4) + index * 4;
        self.device_read(vaddr, 4);
        unsafe { std::ptr::read_volatile(vaddr as *const u32) }
    }

    fn write_word(&mut self, bus: u32, index: usize, value: u32) {
        let vaddr = self.host(bus, (index + 1) * 4) + index * 4;
        self.device_write(vaddr, 4);
        unsafe { std::ptr::write_volatile(vaddr as *mut u32, value) };
    }

    fn doorbell(&mut self) {
        let input = self.reg(CAAM_IRBAR0);
        let desc_bus = self.read_word(input, 0);
        if self.stall {
            self.pending = Some(desc_bus);
        } else {
            self.complete(desc_bus);
        }
    }

    fn complete(&mut self, desc_bus: u32) {
        let mut words = [0u32; DESC_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.read_word(desc_bus, i);
        }
        let status = match Descriptor::parse(&words) {
            Some(desc) => {
                self.jobs.push(desc);
                self.execute(&desc)
            }
            None => INVALID_DESCRIPTOR,
        };
        let status = self.status_override.take().unwrap_or(status);
        let echo = self.echo_override.take().unwrap_or(desc_bus);

        let output = self.reg(CAAM_ORBAR0);
        self.write_word(output, 0, echo);
        self.write_word(output, 1, status);
        self.regs.insert(CAAM_ORSFR0, JOB_RING_ENTRIES);
        self.flushed.clear();
    }

    fn execute(&mut self, desc: &Descriptor) -> u32 {
        match desc {
            Descriptor::InstantiateRng if self.rng_fails => RNG_FAULT,
            Descriptor::InstantiateRng => {
                self.regs
                    .insert(CAAM_RDSTA, (RdSta::IF0 | RdSta::SKVN).bits());
                0
            }
            Descriptor::Blob(blob) => self.execute_blob(blob),
        }
    }

    fn execute_blob(&mut self, desc: &BlobDescriptor) -> u32 {
        let key_mod: [u8; KEY_MODIFIER_LEN] = self
            .read_bytes(desc.key_modifier, KEY_MODIFIER_LEN)
            .try_into()
            .unwrap();
        let input = self.read_bytes(desc.input.addr, desc.input.len as usize);
        let out_len = desc.output.len as usize;

        let output = match desc.op {
            BlobOp::Encap if out_len == input.len() + BLOB_OVERHEAD => {
                Some(model::encap(&key_mod, &input))
            }
            BlobOp::Decap if out_len + BLOB_OVERHEAD == input.len() => {
                model::decap(&key_mod, &input)
            }
            _ => None,
        };
        match output {
            Some(data) => {
                self.write_bytes(desc.output.addr, &data);
                0
            }
            None => BLOB_INTEGRITY_FAULT,
        }
    }
}

impl RegisterAccess for SimCaam {
    fn read(&self, offset: usize) -> u32 {
        self.0.borrow().reg(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.0.borrow_mut();
        state.events.push(SimEvent::Write { offset, value });
        match offset {
            CAAM_IRJAR0 => state.doorbell(),
            CAAM_ORJRR0 => {
                let filled = state.reg(CAAM_ORSFR0).saturating_sub(value);
                state.regs.insert(CAAM_ORSFR0, filled);
            }
            // ERR 位写 1 清除
            CAAM_RTMCTL => {
                state
                    .regs
                    .insert(CAAM_RTMCTL, value & !RtmCtl::ERR.bits());
            }
            CAAM_SMCJR0 => {
                let busy = if state.secmem_stuck { SMCS_CMD_COMPLETE } else { 0 };
                state.regs.insert(CAAM_SMCJR0, value);
                state.regs.insert(CAAM_SMCSJR0, busy | (value & 0xF));
            }
            _ => {
                state.regs.insert(offset, value);
            }
        }
    }
}

impl DmaOps for SimCaam {
    fn bus_addr(&self, vaddr: VirtAddr, len: usize) -> JobResult<u32> {
        let mut state = self.0.borrow_mut();
        let vaddr = vaddr.as_usize();
        if let Some(&bus) = state.by_vaddr.get(&vaddr) {
            let entry = state.by_bus.get_mut(&bus).unwrap();
            entry.1 = entry.1.max(len);
            return Ok(bus);
        }
        let bus = state.next_bus;
        let span = u32::try_from(memory_addr::align_up(len.max(1), 0x1000) + 0x1000)
            .map_err(|_| JobError::AddressOutOfRange(vaddr))?;
        state.next_bus = bus
            .checked_add(span)
            .ok_or(JobError::AddressOutOfRange(vaddr))?;
        state.by_bus.insert(bus, (vaddr, len));
        state.by_vaddr.insert(vaddr, bus);
        Ok(bus)
    }

    fn flush(&self, range: VirtAddrRange) {
        let mut state = self.0.borrow_mut();
        if state.skip_flushes {
            return;
        }
        let (start, end) = (range.start.as_usize(), range.end.as_usize());
        state.events.push(SimEvent::Flush { start, end });
        state.flushed.push((start, end));
    }

    fn invalidate(&self, range: VirtAddrRange) {
        let mut state = self.0.borrow_mut();
        let (start, end) = (range.start.as_usize(), range.end.as_usize());
        state.events.push(SimEvent::Invalidate { start, end });
        state.stale.retain(|&(s, e)| !(start <= s && e <= end));
    }
}

/// blob 变换的软件模型
///
/// 布局：32 字节 blob key | 密文 | 16 字节 MAC。key 与 MAC 都由
/// key modifier 派生，因此用错 key modifier 会导致解封装失败。
mod model {
    use super::*;

    const KEY_LEN: usize = 32;
    const MAC_LEN: usize = BLOB_OVERHEAD - KEY_LEN;

    fn blob_key(key_mod: &[u8; KEY_MODIFIER_LEN]) -> [u8; KEY_LEN] {
        core::array::from_fn(|i| key_mod[i % KEY_MODIFIER_LEN] ^ (i as u8).wrapping_mul(0x3b) ^ 0xa5)
    }

    fn mac(key_mod: &[u8; KEY_MODIFIER_LEN], plain: &[u8]) -> [u8; MAC_LEN] {
        let mut mac: [u8; MAC_LEN] = core::array::from_fn(|i| key_mod[i]);
        for (i, b) in plain.iter().enumerate() {
            let m = &mut mac[i % MAC_LEN];
            *m = m.rotate_left(3) ^ b.wrapping_add(i as u8);
        }
        mac
    }

    pub fn encap(key_mod: &[u8; KEY_MODIFIER_LEN], plain: &[u8]) -> Vec<u8> {
        let key = blob_key(key_mod);
        let mut blob = key.to_vec();
        blob.extend(plain.iter().enumerate().map(|(i, b)| b ^ key[i % KEY_LEN]));
        blob.extend_from_slice(&mac(key_mod, plain));
        blob
    }

    pub fn decap(key_mod: &[u8; KEY_MODIFIER_LEN], blob: &[u8]) -> Option<Vec<u8>> {
        let key = blob_key(key_mod);
        let (header, rest) = blob.split_at(KEY_LEN);
        if header != key {
            return None;
        }
        let (cipher, tag) = rest.split_at(rest.len() - MAC_LEN);
        let plain: Vec<u8> = cipher
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % KEY_LEN])
            .collect();
        (tag == mac(key_mod, &plain)).then_some(plain)
    }
}
