//! Per-ASIC veto cross-check.
//!
//! Every train trailer carries the veto count the PPT applied plus the
//! count each of the 16 ASICs saw. A healthy ASIC reports the PPT's
//! count; a dead one reports a fixed sentinel derived from its index.

use serde::{Deserialize, Serialize};

pub const NUM_ASICS: usize = 16;

/// Byte offset of the first per-ASIC counter in the trailer.
const ASIC_COUNTER_OFFSET: usize = 162;
const ASIC_COUNTER_STRIDE: usize = 16;
/// A dead ASIC `i` reports `384 + i` instead of a real count.
const BROKEN_SENTINEL_BASE: u16 = 384;
/// Trailer bytes needed to read all counters.
const MIN_TRAILER_LEN: usize = ASIC_COUNTER_OFFSET + (NUM_ASICS - 1) * ASIC_COUNTER_STRIDE + 2;

/// Health of one ASIC's veto handling, derived from a train trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsicVetoState {
    /// Counter matches the PPT's.
    Ok,
    /// Counter disagrees with the PPT's.
    Mismatched,
    /// Counter carries the dead-ASIC sentinel.
    Broken,
    /// No statement possible (dummy data or malformed trailer).
    Unknown,
}

/// What one train trailer says about veto handling: the per-ASIC health
/// verdicts plus the raw counters they were derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsicVetoReport {
    pub states: [AsicVetoState; NUM_ASICS],
    /// Raw veto count each ASIC reported.
    pub counters: [u16; NUM_ASICS],
    /// Veto count the PPT applied.
    pub ppt_veto: u16,
}

impl AsicVetoReport {
    fn unknown() -> Self {
        Self {
            states: [AsicVetoState::Unknown; NUM_ASICS],
            counters: [0; NUM_ASICS],
            ppt_veto: 0,
        }
    }
}

fn read_u16_le(trailer: &[u8], offset: usize) -> u16 {
    u16::from(trailer[offset]) + u16::from(trailer[offset + 1]) * 256
}

/// Compare each ASIC's veto counter against the PPT's.
///
/// Dummy data carries meaningless counters, and a short trailer cannot be
/// read at all; both yield all-Unknown rather than a false alarm.
pub fn validate_asic_vetos(trailer: &[u8], dummy_data: bool) -> AsicVetoReport {
    if dummy_data || trailer.len() < MIN_TRAILER_LEN {
        return AsicVetoReport::unknown();
    }
    let mut report = AsicVetoReport::unknown();
    report.ppt_veto = read_u16_le(trailer, 0);
    for i in 0..NUM_ASICS {
        let count = read_u16_le(trailer, ASIC_COUNTER_OFFSET + i * ASIC_COUNTER_STRIDE);
        report.counters[i] = count;
        report.states[i] = if count == report.ppt_veto {
            AsicVetoState::Ok
        } else if count == BROKEN_SENTINEL_BASE + i as u16 {
            AsicVetoState::Broken
        } else {
            AsicVetoState::Mismatched
        };
    }
    report
}
