//! # Command ISA
//!
//! Binary command-buffer format for compute and copy engines.
//!
//! Every command starts with a header dword `(opcode << 16) | length`, where
//! `length` counts dwords including the header. 64-bit operands are stored as
//! a low dword followed by a high dword. Each engine family has its own opcode
//! table, so a buffer encoded for one family is rejected by another.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{ZeError, ZeResult};
use crate::kmd::GpuFault;
use crate::kmd::hw_info::HwInfo;
use std::sync::Arc;

/// Engine families a command list can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineFamily {
    Compute,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TimestampKind {
    /// Device-wide monotonic clock.
    Global = 0,
    /// Clock that only advances while this hardware context runs.
    Context = 1,
}

/// A decoded engine command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Copy {
        src: u64,
        dst: u64,
        size: u64,
    },
    CopyRegion {
        src: u64,
        dst: u64,
        src_pitch: u32,
        src_slice_pitch: u32,
        dst_pitch: u32,
        dst_slice_pitch: u32,
        width: u32,
        height: u32,
        depth: u32,
    },
    Fill {
        dst: u64,
        size: u64,
        pattern: Vec<u8>,
    },
    /// Runs the launch at index `launch` of the batch's side table.
    Dispatch {
        launch: u32,
        group_count: [u32; 3],
    },
    /// Waits for all prior work of this context and flushes caches.
    Barrier,
    Timestamp {
        dst: u64,
        kind: TimestampKind,
    },
    /// Stalls until the qword at `addr` equals `value`.
    SemaphoreWait {
        addr: u64,
        value: u64,
    },
    StoreData {
        addr: u64,
        value: u64,
    },
    /// Cache or migration hint; has no architectural effect.
    Hint {
        addr: u64,
        size: u64,
        kind: u32,
    },
    BatchBufferEnd,
}

// =============================================================================
// ENCODER TRAIT
// =============================================================================

/// Translates commands to and from one engine family's binary format.
pub trait CommandEncoder: std::fmt::Debug + Send + Sync {
    /// Appends the encoding of `cmd` to `out`.
    ///
    /// # Errors
    /// `UnsupportedFeature` if the engine cannot execute `cmd`, `InvalidSize`
    /// for malformed operands.
    fn encode(&self, cmd: &Command, out: &mut Vec<u32>) -> ZeResult<()>;

    /// Decodes the command at the start of `dwords`, returning it and its length.
    fn decode(&self, dwords: &[u32]) -> Result<(Command, usize), GpuFault>;

    fn family(&self) -> EngineFamily;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
struct OpcodeTable {
    copy: u16,
    copy_region: u16,
    fill: u16,
    dispatch: Option<u16>,
    barrier: u16,
    timestamp: u16,
    semaphore_wait: u16,
    store_data: u16,
    hint: u16,
    end: u16,
}

const MI_BATCH_BUFFER_END: u16 = 0x100A;
const MI_SEMAPHORE_WAIT: u16 = 0x101C;
const MI_STORE_DATA_IMM: u16 = 0x1020;
const MI_FLUSH_DW: u16 = 0x1026;
const MI_STORE_TIMESTAMP: u16 = 0x1027;
const MI_MEM_HINT: u16 = 0x1040;
const PIPE_CONTROL: u16 = 0x7A00;
const PIPE_CONTROL_TIMESTAMP: u16 = 0x7A01;
const BUILTIN_COPY: u16 = 0x7C00;
const BUILTIN_COPY_REGION: u16 = 0x7C01;
const BUILTIN_FILL: u16 = 0x7C02;
const XY_FAST_COPY_BLT: u16 = 0x5142;
const XY_BLOCK_COPY_BLT: u16 = 0x5141;
const XY_COLOR_BLT: u16 = 0x5150;

fn header(op: u16, len: usize) -> u32 {
    (u32::from(op) << 16) | (len as u32 & 0xFFFF)
}

fn push_u64(out: &mut Vec<u32>, v: u64) {
    out.push(v as u32);
    out.push((v >> 32) as u32);
}

fn read_u64(d: &[u32], at: usize) -> u64 {
    u64::from(d[at]) | (u64::from(d[at + 1]) << 32)
}

fn encode_with(t: &OpcodeTable, cmd: &Command, out: &mut Vec<u32>) -> ZeResult<()> {
    let start = out.len();
    out.push(0);
    let op = match cmd {
        Command::Copy { src, dst, size } => {
            push_u64(out, *src);
            push_u64(out, *dst);
            push_u64(out, *size);
            t.copy
        }
        Command::CopyRegion {
            src,
            dst,
            src_pitch,
            src_slice_pitch,
            dst_pitch,
            dst_slice_pitch,
            width,
            height,
            depth,
        } => {
            push_u64(out, *src);
            push_u64(out, *dst);
            out.extend_from_slice(&[
                *src_pitch,
                *src_slice_pitch,
                *dst_pitch,
                *dst_slice_pitch,
                *width,
                *height,
                *depth,
            ]);
            t.copy_region
        }
        Command::Fill { dst, size, pattern } => {
            push_u64(out, *dst);
            push_u64(out, *size);
            out.push(pattern.len() as u32);
            for chunk in pattern.chunks(4) {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                out.push(u32::from_le_bytes(word));
            }
            t.fill
        }
        Command::Dispatch {
            launch,
            group_count,
        } => {
            let Some(op) = t.dispatch else {
                out.truncate(start);
                return Err(ZeError::UnsupportedFeature(
                    "kernel dispatch on a copy engine".into(),
                ));
            };
            out.push(*launch);
            out.extend_from_slice(group_count);
            op
        }
        Command::Barrier => t.barrier,
        Command::Timestamp { dst, kind } => {
            push_u64(out, *dst);
            out.push(*kind as u32);
            t.timestamp
        }
        Command::SemaphoreWait { addr, value } => {
            push_u64(out, *addr);
            push_u64(out, *value);
            t.semaphore_wait
        }
        Command::StoreData { addr, value } => {
            push_u64(out, *addr);
            push_u64(out, *value);
            t.store_data
        }
        Command::Hint { addr, size, kind } => {
            push_u64(out, *addr);
            push_u64(out, *size);
            out.push(*kind);
            t.hint
        }
        Command::BatchBufferEnd => t.end,
    };
    out[start] = header(op, out.len() - start);
    Ok(())
}

fn decode_with(t: &OpcodeTable, d: &[u32]) -> Result<(Command, usize), GpuFault> {
    let bad = |msg: String| GpuFault::BadCommand(msg);
    let hdr = *d.first().ok_or_else(|| bad("read past end of buffer".into()))?;
    let op = (hdr >> 16) as u16;
    let len = (hdr & 0xFFFF) as usize;
    if len == 0 || len > d.len() {
        return Err(bad(format!("command length {len} invalid at header 0x{hdr:08x}")));
    }
    let need = |n: usize| {
        if len == n {
            Ok(())
        } else {
            Err(bad(format!("opcode 0x{op:04x} expects {n} dwords, got {len}")))
        }
    };

    let cmd = if op == t.copy {
        need(7)?;
        Command::Copy {
            src: read_u64(d, 1),
            dst: read_u64(d, 3),
            size: read_u64(d, 5),
        }
    } else if op == t.copy_region {
        need(12)?;
        Command::CopyRegion {
            src: read_u64(d, 1),
            dst: read_u64(d, 3),
            src_pitch: d[5],
            src_slice_pitch: d[6],
            dst_pitch: d[7],
            dst_slice_pitch: d[8],
            width: d[9],
            height: d[10],
            depth: d[11],
        }
    } else if op == t.fill {
        if len < 6 {
            return Err(bad("truncated fill".into()));
        }
        let pattern_len = d[5] as usize;
        need(6 + pattern_len.div_ceil(4))?;
        let pattern = d[6..len]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .take(pattern_len)
            .collect();
        Command::Fill {
            dst: read_u64(d, 1),
            size: read_u64(d, 3),
            pattern,
        }
    } else if Some(op) == t.dispatch {
        need(5)?;
        Command::Dispatch {
            launch: d[1],
            group_count: [d[2], d[3], d[4]],
        }
    } else if op == t.barrier {
        need(1)?;
        Command::Barrier
    } else if op == t.timestamp {
        need(4)?;
        let kind = match d[3] {
            0 => TimestampKind::Global,
            1 => TimestampKind::Context,
            k => return Err(bad(format!("unknown timestamp kind {k}"))),
        };
        Command::Timestamp {
            dst: read_u64(d, 1),
            kind,
        }
    } else if op == t.semaphore_wait {
        need(5)?;
        Command::SemaphoreWait {
            addr: read_u64(d, 1),
            value: read_u64(d, 3),
        }
    } else if op == t.store_data {
        need(5)?;
        Command::StoreData {
            addr: read_u64(d, 1),
            value: read_u64(d, 3),
        }
    } else if op == t.hint {
        need(6)?;
        Command::Hint {
            addr: read_u64(d, 1),
            size: read_u64(d, 3),
            kind: d[5],
        }
    } else if op == t.end {
        need(1)?;
        Command::BatchBufferEnd
    } else {
        return Err(bad(format!("unknown opcode 0x{op:04x}")));
    };
    Ok((cmd, len))
}

// =============================================================================
// COMPUTE ENCODER
// =============================================================================

/// Render/compute command streamer encoding. Copies and fills run as builtin
/// kernels; dispatch uses the generation's walker command.
#[derive(Debug)]
pub struct ComputeEncoder {
    table: OpcodeTable,
    max_fill_pattern: usize,
}

impl ComputeEncoder {
    #[must_use]
    pub fn new(hw: &HwInfo) -> Self {
        Self {
            table: OpcodeTable {
                copy: BUILTIN_COPY,
                copy_region: BUILTIN_COPY_REGION,
                fill: BUILTIN_FILL,
                dispatch: Some(hw.walker_opcode),
                barrier: PIPE_CONTROL,
                timestamp: PIPE_CONTROL_TIMESTAMP,
                semaphore_wait: MI_SEMAPHORE_WAIT,
                store_data: MI_STORE_DATA_IMM,
                hint: MI_MEM_HINT,
                end: MI_BATCH_BUFFER_END,
            },
            max_fill_pattern: hw.max_fill_pattern_size as usize,
        }
    }
}

impl CommandEncoder for ComputeEncoder {
    fn encode(&self, cmd: &Command, out: &mut Vec<u32>) -> ZeResult<()> {
        if let Command::Fill { pattern, .. } = cmd {
            if pattern.is_empty() || pattern.len() > self.max_fill_pattern {
                return Err(ZeError::InvalidSize(format!(
                    "fill pattern of {} bytes (max {})",
                    pattern.len(),
                    self.max_fill_pattern
                )));
            }
        }
        encode_with(&self.table, cmd, out)
    }

    fn decode(&self, dwords: &[u32]) -> Result<(Command, usize), GpuFault> {
        decode_with(&self.table, dwords)
    }

    fn family(&self) -> EngineFamily {
        EngineFamily::Compute
    }

    fn name(&self) -> &'static str {
        "compute"
    }
}

// =============================================================================
// BLITTER ENCODER
// =============================================================================

/// Copy engine encoding. No kernel dispatch; fills only with 1, 2 or 4 byte
/// patterns.
#[derive(Debug)]
pub struct BlitterEncoder {
    table: OpcodeTable,
}

impl BlitterEncoder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            table: OpcodeTable {
                copy: XY_FAST_COPY_BLT,
                copy_region: XY_BLOCK_COPY_BLT,
                fill: XY_COLOR_BLT,
                dispatch: None,
                barrier: MI_FLUSH_DW,
                timestamp: MI_STORE_TIMESTAMP,
                semaphore_wait: MI_SEMAPHORE_WAIT,
                store_data: MI_STORE_DATA_IMM,
                hint: MI_MEM_HINT,
                end: MI_BATCH_BUFFER_END,
            },
        }
    }
}

impl Default for BlitterEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandEncoder for BlitterEncoder {
    fn encode(&self, cmd: &Command, out: &mut Vec<u32>) -> ZeResult<()> {
        if let Command::Fill { pattern, .. } = cmd {
            if pattern.is_empty() {
                return Err(ZeError::InvalidSize("empty fill pattern".into()));
            }
            if !matches!(pattern.len(), 1 | 2 | 4) {
                return Err(ZeError::UnsupportedFeature(format!(
                    "copy engine fill with {}-byte pattern",
                    pattern.len()
                )));
            }
        }
        encode_with(&self.table, cmd, out)
    }

    fn decode(&self, dwords: &[u32]) -> Result<(Command, usize), GpuFault> {
        decode_with(&self.table, dwords)
    }

    fn family(&self) -> EngineFamily {
        EngineFamily::Copy
    }

    fn name(&self) -> &'static str {
        "blitter"
    }
}

/// Encoder for `family` on hardware described by `hw`.
#[must_use]
pub fn encoder_for(family: EngineFamily, hw: &HwInfo) -> Arc<dyn CommandEncoder> {
    match family {
        EngineFamily::Compute => Arc::new(ComputeEncoder::new(hw)),
        EngineFamily::Copy => Arc::new(BlitterEncoder::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmd::hw_info::{HwFamily, hw_info};

    fn decode_all(enc: &dyn CommandEncoder, mut d: &[u32]) -> Vec<Command> {
        let mut cmds = Vec::new();
        while !d.is_empty() {
            let (cmd, len) = enc.decode(d).unwrap();
            cmds.push(cmd);
            d = &d[len..];
        }
        cmds
    }

    #[test]
    fn compute_stream_decodes_in_order() {
        let enc = ComputeEncoder::new(hw_info(HwFamily::Gen12Lp));
        let cmds = vec![
            Command::Fill {
                dst: 0x8000_0000_1000,
                size: 4096,
                pattern: vec![1, 2, 3, 4, 5],
            },
            Command::Barrier,
            Command::Dispatch {
                launch: 3,
                group_count: [4, 2, 1],
            },
            Command::Timestamp {
                dst: 0x10,
                kind: TimestampKind::Context,
            },
            Command::BatchBufferEnd,
        ];
        let mut out = Vec::new();
        for c in &cmds {
            enc.encode(c, &mut out).unwrap();
        }
        assert_eq!(decode_all(&enc, &out), cmds);
    }

    #[test]
    fn walker_opcode_follows_generation() {
        let gen9 = ComputeEncoder::new(hw_info(HwFamily::Gen9));
        let gen12 = ComputeEncoder::new(hw_info(HwFamily::Gen12Lp));
        let dispatch = Command::Dispatch {
            launch: 0,
            group_count: [1, 1, 1],
        };
        let (mut a, mut b) = (Vec::new(), Vec::new());
        gen9.encode(&dispatch, &mut a).unwrap();
        gen12.encode(&dispatch, &mut b).unwrap();
        assert_eq!(a[0] >> 16, 0x7105);
        assert_eq!(b[0] >> 16, 0x7202);
        assert!(gen12.decode(&a).is_err());
    }

    #[test]
    fn blitter_rejects_dispatch_and_wide_patterns() {
        let enc = BlitterEncoder::new();
        let mut out = Vec::new();
        assert!(matches!(
            enc.encode(
                &Command::Dispatch {
                    launch: 0,
                    group_count: [1, 1, 1]
                },
                &mut out
            ),
            Err(ZeError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            enc.encode(
                &Command::Fill {
                    dst: 0,
                    size: 16,
                    pattern: vec![0; 8]
                },
                &mut out
            ),
            Err(ZeError::UnsupportedFeature(_))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn truncated_command_is_a_fault() {
        let enc = BlitterEncoder::new();
        let mut out = Vec::new();
        enc.encode(&Command::Copy { src: 1, dst: 2, size: 3 }, &mut out)
            .unwrap();
        out.truncate(4);
        assert!(matches!(enc.decode(&out), Err(GpuFault::BadCommand(_))));
    }
}
