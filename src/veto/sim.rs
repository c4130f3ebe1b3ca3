//! Veto-pattern simulation.
//!
//! The detector head decides 82 pulses late whether a frame is vetoed, so
//! the memory-cell addresses the hardware assigns follow the pattern in a
//! non-obvious way: a vetoed pulse reuses the address of an earlier frame
//! whose data is discarded, tracked through a latency-deep FIFO. This
//! module replays that allocation in software; comparing the predicted
//! cell ids against the ones the detector reports is how the checker
//! decides whether the head applied the pattern correctly.

use std::collections::VecDeque;

/// Pulses between a veto decision and the pulse it applies to.
pub const VETO_LATENCY: usize = 82;

/// Highest memory-cell address; allocation stops once it is reached.
pub const MAX_CELL_ADDR: u16 = 799;

/// Pattern entries with this code in their top nibble mark the pulse as
/// not used, i.e. not vetoed.
const NOT_USED_CODE: u16 = 0b101;

/// Predicted per-frame addressing for one train.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimData {
    pub cell_id: Vec<u16>,
    pub pulse_id: Vec<u32>,
}

/// Replay the hardware's memory-cell allocation for a veto pattern.
///
/// The first [`VETO_LATENCY`] pulses always land in fresh cells (the
/// decision for them has not arrived yet), the next `preveto` pulses are
/// unconditionally vetoed, and the rest follow the pattern. Output is
/// truncated to `frames`, the number of frames actually sent out.
pub fn veto_pattern_to_sim_data(pattern: &[u16], frames: usize, preveto: usize) -> SimData {
    let mut vetoed = Vec::with_capacity(VETO_LATENCY + preveto + pattern.len());
    vetoed.extend(std::iter::repeat(false).take(VETO_LATENCY));
    vetoed.extend(std::iter::repeat(true).take(preveto));
    vetoed.extend(pattern.iter().map(|e| (e >> 12) != NOT_USED_CODE));

    let mut fifo: VecDeque<u16> = VecDeque::with_capacity(VETO_LATENCY);
    let mut cell_id: Vec<u16> = Vec::new();
    let mut pulse_id: Vec<u32> = Vec::new();

    // Only `frames` pulses leave the head; vetoes beyond that never fire.
    for (pulse, flagged) in vetoed.into_iter().enumerate().take(frames) {
        let addr = if flagged {
            match fifo.pop_front() {
                Some(addr) => {
                    // The reused cell's earlier frame is discarded.
                    if let Some(pos) = cell_id.iter().position(|c| *c == addr) {
                        cell_id.remove(pos);
                        pulse_id.remove(pos);
                    }
                    addr
                }
                None => cell_id.len() as u16,
            }
        } else {
            cell_id.len() as u16
        };
        if fifo.len() == VETO_LATENCY {
            fifo.pop_front();
        }
        fifo.push_back(addr);
        cell_id.push(addr);
        pulse_id.push(pulse as u32);
        if addr >= MAX_CELL_ADDR {
            break;
        }
    }

    cell_id.truncate(frames);
    pulse_id.truncate(frames);
    SimData { cell_id, pulse_id }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn not_used_pattern(len: usize) -> Vec<u16> {
        vec![NOT_USED_CODE << 12; len]
    }

    #[test]
    fn no_vetoes_gives_identity_addressing() {
        let sim = veto_pattern_to_sim_data(&not_used_pattern(800), 400, 0);
        assert_eq!(sim.cell_id.len(), 400);
        for (i, cell) in sim.cell_id.iter().enumerate() {
            assert_eq!(*cell as usize, i);
        }
        assert_eq!(sim.pulse_id, (0..400).collect::<Vec<u32>>());
    }

    #[test]
    fn prevetos_reuse_latency_cells() {
        let sim = veto_pattern_to_sim_data(&not_used_pattern(200), 100, 5);
        // The five prevetoed pulses reuse the first five latency cells,
        // discarding their original frames.
        assert_eq!(&sim.cell_id[..5], &[5, 6, 7, 8, 9]);
        assert_eq!(sim.cell_id[77], 0);
        assert_eq!(sim.pulse_id[77], 82);
        assert_eq!(sim.cell_id.len(), 100);
    }

    #[test]
    fn vetoed_pattern_entries_reuse_cells() {
        let mut pattern = not_used_pattern(200);
        pattern[0] = 0;
        let baseline = veto_pattern_to_sim_data(&not_used_pattern(200), 250, 0);
        let sim = veto_pattern_to_sim_data(&pattern, 250, 0);
        assert_ne!(sim.cell_id, baseline.cell_id);
        // Pulse 82 (first pattern entry) reuses cell 0.
        let pos = sim.pulse_id.iter().position(|p| *p == 82).unwrap();
        assert_eq!(sim.cell_id[pos], 0);
        assert!(!sim.pulse_id.contains(&0));
    }

    #[test]
    fn allocation_stops_at_the_last_cell() {
        let sim = veto_pattern_to_sim_data(&not_used_pattern(2000), 2000, 0);
        assert!(sim.cell_id.iter().all(|c| *c <= MAX_CELL_ADDR));
        assert_eq!(sim.cell_id.last().copied(), Some(MAX_CELL_ADDR));
    }

    #[test]
    fn vetoes_beyond_the_frame_window_never_fire() {
        let mut pattern = not_used_pattern(800);
        // Pattern entry 68 sits at pulse 150, past the 100 sent frames.
        pattern[68] = 0;
        let sim = veto_pattern_to_sim_data(&pattern, 100, 0);
        assert_eq!(sim.cell_id.len(), 100);
        assert_eq!(sim.cell_id[68], 68);
        assert_eq!(sim.cell_id, veto_pattern_to_sim_data(&not_used_pattern(800), 100, 0).cell_id);
    }

    #[test]
    fn output_is_truncated_to_frames() {
        let sim = veto_pattern_to_sim_data(&not_used_pattern(800), 30, 0);
        assert_eq!(sim.cell_id.len(), 30);
        assert_eq!(sim.pulse_id.len(), 30);
    }
}
