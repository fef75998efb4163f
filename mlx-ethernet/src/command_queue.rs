//! The command queue used to pass commands from the driver to the NIC.
//!
//! A command is a 64-byte entry polled by the device, carrying up to 16 bytes
//! of inline input and 16 bytes of inline output. Anything larger spills into
//! chains of mailbox pages linked by physical pointers. Callers address
//! command data by *logical* offset; the translation between the inline
//! windows and the mailbox chains happens here and nowhere else.
//! (PRM Section 8.24.1: HCA Command Queue)

use std::time::Duration;

use log::{debug, trace};
use num_enum::TryFromPrimitive;

use crate::bits;
use crate::dma::{DmaRegion, SharedDma};
use crate::error::Error;
use crate::initialization_segment::InitializationSegment;

/// Size of a command queue entry in bytes.
pub const ENTRY_SIZE: usize = 64;
/// Size of a mailbox page, including control fields.
pub const MAILBOX_SIZE: usize = 0x240;
/// Number of bytes in a mailbox that carry command data.
pub const MAILBOX_DATA_SIZE: usize = 0x200;
/// Upper bound on either mailbox chain; sized for the largest command in use
/// (the capability query) with a wide margin.
pub const MAX_MAILBOXES: usize = 1000;
/// Bytes of command input (and output) carried inline in the entry.
const INLINE_SIZE: usize = 16;

// Entry layout.
const ENTRY_TYPE: usize = 0x00;
const ENTRY_INPUT_LENGTH: usize = 0x04;
const ENTRY_INPUT_MAILBOX: usize = 0x08;
const ENTRY_INPUT_INLINE: usize = 0x10;
const ENTRY_OUTPUT_INLINE: usize = 0x20;
const ENTRY_OUTPUT_MAILBOX: usize = 0x30;
const ENTRY_OUTPUT_LENGTH: usize = 0x38;
const ENTRY_CTRL: usize = 0x3C;

// Mailbox control fields.
const MAILBOX_NEXT_POINTER: usize = 0x230;
const MAILBOX_BLOCK_NUMBER: usize = 0x238;
const MAILBOX_TOKEN: usize = 0x23C;

/// Type of transport that carries the command.
const TRANSPORT_PCIE: u32 = 0x7;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Command opcode written in the first inline input dword.
/// (PRM Chapter 23: Command Reference)
#[derive(PartialEq, Eq, Debug, TryFromPrimitive, Copy, Clone)]
#[repr(u16)]
pub enum CommandOpcode {
    QueryHcaCap = 0x100,
    QueryAdapter = 0x101,
    InitHca = 0x102,
    TeardownHca = 0x103,
    EnableHca = 0x104,
    DisableHca = 0x105,
    QueryPages = 0x107,
    ManagePages = 0x108,
    QueryIssi = 0x10A,
    SetIssi = 0x10B,
    QuerySpecialContexts = 0x203,
    CreateEq = 0x301,
    DestroyEq = 0x302,
    CreateCq = 0x400,
    DestroyCq = 0x401,
    QueryVportState = 0x751,
    QueryNicVportContext = 0x754,
    AllocPd = 0x800,
    DeallocPd = 0x801,
    AllocUar = 0x802,
    DeallocUar = 0x803,
    AccessRegister = 0x805,
    AllocTransportDomain = 0x816,
    DeallocTransportDomain = 0x817,
    CreateTir = 0x900,
    DestroyTir = 0x902,
    CreateSq = 0x904,
    ModifySq = 0x905,
    DestroySq = 0x906,
    CreateRq = 0x908,
    ModifyRq = 0x909,
    DestroyRq = 0x90A,
    CreateTis = 0x912,
    DestroyTis = 0x914,
    SetFlowTableRoot = 0x92F,
    CreateFlowTable = 0x930,
    DestroyFlowTable = 0x931,
    CreateFlowGroup = 0x933,
    DestroyFlowGroup = 0x934,
    SetFlowTableEntry = 0x936,
}

/// Return codes written by HW in the delivery status field of the entry.
/// Delivery failures mean the command never reached the firmware intact.
#[derive(Debug, PartialEq, Eq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum CommandDeliveryStatus {
    Success = 0x00,
    SignatureErr = 0x01,
    TokenErr = 0x02,
    BadBlockNumber = 0x03,
    BadOutputPointer = 0x04,
    BadInputPointer = 0x05,
    InternalErr = 0x06,
    InputLenErr = 0x07,
    OutputLenErr = 0x08,
    ReservedNotZero = 0x09,
    BadCommandType = 0x10,
}

/// Command status written by HW in the first inline output dword.
#[derive(Debug, PartialEq, Eq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum CommandReturnStatus {
    Ok = 0x00,
    InternalError = 0x01,
    BadOp = 0x02,
    BadParam = 0x03,
    BadSysState = 0x04,
    BadResource = 0x05,
    ResourceBusy = 0x06,
    ExceedLim = 0x08,
    BadResState = 0x09,
    BadIndex = 0x0A,
    NoResources = 0x0F,
    BadResourceState = 0x10,
    BadPkt = 0x30,
    BadSize = 0x40,
    BadInputLen = 0x50,
    BadOutputLen = 0x51,
}

/// Sleep source for the ownership polling loop. Pluggable so tests can stand
/// in a software device that makes progress instead of wall-clock waiting.
pub trait Clock {
    fn sleep(&mut self, duration: Duration);
}

/// Wall-clock sleeping for real hardware.
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// The host side of the command interface: one 64-byte entry and two
/// independent mailbox chains, executed strictly one command at a time.
pub struct CommandQueue {
    /// 4 KiB page holding the single command entry at offset 0.
    entry: DmaRegion,
    /// Pages of the input mailbox chain, grown on demand.
    inboxes: Vec<DmaRegion>,
    /// Pages of the output mailbox chain, grown on demand.
    outboxes: Vec<DmaRegion>,
    /// Token for the next command: the same value goes in the entry and every
    /// mailbox page so the device can detect torn or stale DMA.
    token: u8,
    dma: SharedDma,
    clock: Box<dyn Clock>,
    /// Dump every command entry and mailbox page before posting.
    hexdump: bool,
}

impl CommandQueue {
    pub fn new(dma: SharedDma, clock: Box<dyn Clock>, hexdump: bool) -> Result<CommandQueue, Error> {
        let entry = dma.borrow_mut().alloc(4096, 4096)?;
        Ok(CommandQueue {
            entry,
            inboxes: Vec::new(),
            outboxes: Vec::new(),
            // Snabb seeds the rolling token at 0xAA
            token: 0xAA,
            dma,
            clock,
            hexdump,
        })
    }

    /// Physical address of the command queue, to be written to the
    /// initialization segment before the first command.
    pub fn phys_addr(&self) -> u64 {
        self.entry.phys()
    }

    pub fn set_hexdump(&mut self, enabled: bool) {
        self.hexdump = enabled;
    }

    /// Waits until the firmware clears the initializing bit.
    pub fn wait_ready(&mut self, init_seg: &InitializationSegment) {
        while !init_seg.ready() {
            trace!("device is initializing");
            self.clock.sleep(POLL_INTERVAL);
        }
    }

    /// Executes one command synchronously.
    ///
    /// `fill` writes the command arguments at logical input offsets (the
    /// opcode and opcode modifier are written here, so arguments start at
    /// 0x08); `read` extracts results at logical output offsets once the
    /// firmware reports success.
    pub fn execute<T>(
        &mut self,
        init_seg: &mut InitializationSegment,
        opcode: CommandOpcode,
        opmod: u16,
        in_len: usize,
        out_len: usize,
        fill: impl FnOnce(&mut CommandInput),
        read: impl FnOnce(&CommandOutput) -> T,
    ) -> Result<T, Error> {
        let n_in = chain_len(in_len).ok_or(Error::InputOverflow(in_len))?;
        let n_out = chain_len(out_len).ok_or(Error::OutputOverflow(out_len))?;

        let token = self.token;
        self.token = next_token(self.token);

        self.entry.zero_range(0, ENTRY_SIZE);
        self.entry.write_u32(ENTRY_TYPE, TRANSPORT_PCIE << 24);
        self.entry.write_u32(ENTRY_INPUT_LENGTH, in_len as u32);
        self.entry.write_u32(ENTRY_OUTPUT_LENGTH, out_len as u32);

        Self::prepare_chain(&self.dma, &mut self.inboxes, n_in, token)?;
        Self::prepare_chain(&self.dma, &mut self.outboxes, n_out, token)?;
        if n_in > 0 {
            self.entry.write_u64(ENTRY_INPUT_MAILBOX, self.inboxes[0].phys());
        }
        if n_out > 0 {
            self.entry.write_u64(ENTRY_OUTPUT_MAILBOX, self.outboxes[0].phys());
        }

        {
            let mut input = CommandInput {
                entry: &self.entry,
                boxes: &self.inboxes[..n_in],
            };
            input.set_u32(0x00, (opcode as u32) << 16);
            input.set_u32(0x04, opmod as u32);
            fill(&mut input);
        }

        // Token and ownership go last: once bit 0 is set the entry is HW's.
        self.entry.write_u32(ENTRY_CTRL, ((token as u32) << 24) | 0x1);

        if self.hexdump {
            self.dump(opcode, n_in);
        }

        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        init_seg.ring_doorbell(0);

        while self.owned_by_hw() {
            let health = init_seg.health_syndrome();
            if health != 0 {
                return Err(Error::HcaHealth(health));
            }
            self.clock.sleep(POLL_INTERVAL);
        }

        let delivery = bits::get_bits(self.entry.read_u32(ENTRY_CTRL), 7, 1) as u8;
        if delivery != 0 {
            return Err(match CommandDeliveryStatus::try_from(delivery) {
                Ok(status) => Error::Delivery { opcode, status },
                Err(_) => Error::UnknownDeliveryStatus { opcode, status: delivery },
            });
        }

        let output = CommandOutput {
            entry: &self.entry,
            boxes: &self.outboxes[..n_out],
        };
        let status = bits::get_bits(output.get_u32(0x00), 31, 24) as u8;
        let syndrome = output.get_u32(0x04);
        if status != 0 {
            return Err(match CommandReturnStatus::try_from(status) {
                Ok(status) => Error::Command { opcode, status, syndrome },
                Err(_) => Error::UnknownReturnStatus { opcode, status, syndrome },
            });
        }
        Ok(read(&output))
    }

    fn owned_by_hw(&self) -> bool {
        self.entry.read_u32(ENTRY_CTRL) & 0x1 == 0x1
    }

    /// Signature the device wrote back on the last completed command.
    pub fn signature(&self) -> u8 {
        bits::get_bits(self.entry.read_u32(ENTRY_CTRL), 23, 16) as u8
    }

    /// Zeroes the first `n` pages of a chain and links them: block number,
    /// token and a physical pointer to the next page.
    fn prepare_chain(
        dma: &SharedDma,
        boxes: &mut Vec<DmaRegion>,
        n: usize,
        token: u8,
    ) -> Result<(), Error> {
        while boxes.len() < n {
            boxes.push(dma.borrow_mut().alloc(4096, 4096)?);
        }
        for i in 0..n {
            let next = if i + 1 < n { boxes[i + 1].phys() } else { 0 };
            let mb = &boxes[i];
            mb.zero_range(0, MAILBOX_SIZE);
            mb.write_u64(MAILBOX_NEXT_POINTER, next);
            mb.write_u32(MAILBOX_BLOCK_NUMBER, i as u32);
            mb.write_u32(MAILBOX_TOKEN, (token as u32) << 16);
        }
        Ok(())
    }

    /// Dumps the entry and the input mailboxes, four dwords per line, so the
    /// bytes can be diffed against an mlx5_core trace of the same command.
    fn dump(&self, opcode: CommandOpcode, n_in: usize) {
        debug!("{opcode:?} command entry:");
        dump_words(&self.entry, 0, ENTRY_SIZE);
        for (i, mb) in self.inboxes[..n_in].iter().enumerate() {
            debug!("{opcode:?} input mailbox {i}:");
            dump_words(mb, 0, MAILBOX_SIZE);
        }
    }
}

fn dump_words(region: &DmaRegion, start: usize, len: usize) {
    for line in (start..start + len).step_by(16) {
        debug!(
            "{:#06x}: {:08x} {:08x} {:08x} {:08x}",
            line,
            region.read_u32(line),
            region.read_u32(line + 4),
            region.read_u32(line + 8),
            region.read_u32(line + 12),
        );
    }
}

/// Number of mailbox pages needed for a command side of `len` bytes, or
/// `None` when it exceeds the chain capacity.
fn chain_len(len: usize) -> Option<usize> {
    let n = if len <= INLINE_SIZE {
        0
    } else {
        (len - INLINE_SIZE).div_ceil(MAILBOX_DATA_SIZE)
    };
    (n <= MAX_MAILBOXES).then_some(n)
}

/// Tokens advance by one per command and never take the value 0.
fn next_token(token: u8) -> u8 {
    match token.wrapping_add(1) {
        0 => 1,
        t => t,
    }
}

/// Writer over a command's input: the inline window plus the input mailbox
/// chain, addressed by logical offset.
pub struct CommandInput<'a> {
    entry: &'a DmaRegion,
    boxes: &'a [DmaRegion],
}

impl CommandInput<'_> {
    fn locate(&self, offset: usize) -> (&DmaRegion, usize) {
        if offset < INLINE_SIZE {
            (self.entry, ENTRY_INPUT_INLINE + offset)
        } else {
            let off = offset - INLINE_SIZE;
            (&self.boxes[off / MAILBOX_DATA_SIZE], off % MAILBOX_DATA_SIZE)
        }
    }

    pub fn set_u32(&mut self, offset: usize, value: u32) {
        let (region, off) = self.locate(offset);
        region.write_u32(off, value);
    }

    /// Replaces bits `[hi:lo]` of the dword at `offset`, preserving the rest.
    pub fn set_bits(&mut self, offset: usize, hi: u32, lo: u32, value: u32) {
        let (region, off) = self.locate(offset);
        region.write_u32(off, bits::set_bits(region.read_u32(off), hi, lo, value));
    }

    /// Writes a 64-bit value, high dword first. The two dwords may land in
    /// different mailbox pages.
    pub fn set_u64(&mut self, offset: usize, value: u64) {
        self.set_u32(offset, bits::phys_hi(value));
        self.set_u32(offset + 4, bits::phys_lo(value));
    }

    /// Blits a dword-aligned context (e.g. a queue context built with
    /// zerocopy) at the given logical offset.
    pub fn set_bytes(&mut self, offset: usize, bytes: &[u8]) {
        assert!(offset % 4 == 0 && bytes.len() % 4 == 0);
        for (i, dword) in bytes.chunks_exact(4).enumerate() {
            self.set_u32(offset + i * 4, u32::from_be_bytes(dword.try_into().unwrap()));
        }
    }
}

/// Reader over a command's output: the inline window plus the output mailbox
/// chain, addressed by logical offset.
pub struct CommandOutput<'a> {
    entry: &'a DmaRegion,
    boxes: &'a [DmaRegion],
}

impl CommandOutput<'_> {
    fn locate(&self, offset: usize) -> (&DmaRegion, usize) {
        if offset < INLINE_SIZE {
            (self.entry, ENTRY_OUTPUT_INLINE + offset)
        } else {
            let off = offset - INLINE_SIZE;
            (&self.boxes[off / MAILBOX_DATA_SIZE], off % MAILBOX_DATA_SIZE)
        }
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        let (region, off) = self.locate(offset);
        region.read_u32(off)
    }

    pub fn get_bits(&self, offset: usize, hi: u32, lo: u32) -> u32 {
        bits::get_bits(self.get_u32(offset), hi, lo)
    }

    pub fn get_u64(&self, offset: usize) -> u64 {
        ((self.get_u32(offset) as u64) << 32) | self.get_u32(offset + 4) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_length_is_ceil_of_spilled_bytes() {
        assert_eq!(chain_len(0), Some(0));
        assert_eq!(chain_len(16), Some(0));
        assert_eq!(chain_len(17), Some(1));
        assert_eq!(chain_len(16 + 512), Some(1));
        assert_eq!(chain_len(16 + 512 + 1), Some(2));
        assert_eq!(chain_len(16 + 3 * 512 + 100), Some(4));
        assert_eq!(chain_len(16 + MAX_MAILBOXES * 512), Some(MAX_MAILBOXES));
        assert_eq!(chain_len(16 + MAX_MAILBOXES * 512 + 1), None);
    }

    #[test]
    fn tokens_advance_by_one_and_skip_zero() {
        assert_eq!(next_token(0xAA), 0xAB);
        assert_eq!(next_token(0xFE), 0xFF);
        assert_eq!(next_token(0xFF), 0x01);
        let mut t = 1u8;
        for _ in 0..1000 {
            let n = next_token(t);
            assert_ne!(n, 0);
            assert_eq!(n, if t == 0xFF { 1 } else { t + 1 });
            t = n;
        }
    }
}
