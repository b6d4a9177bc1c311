//! Instruction length oracle.

use iced_x86::{Decoder, DecoderOptions};

/// Longest legal x86 instruction, in bytes.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Sizes guest instructions.
pub trait InstructionDecoder: Send + Sync {
    /// Length of the instruction at the start of `bytes`, which was fetched
    /// from `ip`. `None` if the bytes do not hold a complete instruction.
    fn instruction_length(&self, bytes: &[u8], ip: u64) -> Option<usize>;
}

/// 64-bit decoder backed by `iced-x86`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IcedDecoder;

impl InstructionDecoder for IcedDecoder {
    fn instruction_length(&self, bytes: &[u8], ip: u64) -> Option<usize> {
        let mut decoder = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
        if !decoder.can_decode() {
            return None;
        }
        let insn = decoder.decode();
        (!insn.is_invalid()).then(|| insn.len())
    }
}
