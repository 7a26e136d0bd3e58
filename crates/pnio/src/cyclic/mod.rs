// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cyclic real-time engine.
//!
//! One thread runs the base clock: AR housekeeping, one output frame per
//! RUN-state AR, timing statistics, drift-free sleep. Input frames are
//! consumed on the receive thread via [`input_payload`] +
//! `ArManager::ingest_input_frame`.

use crate::ar::{Ar, ArManager};
use crate::clock::MonotonicClock;
use crate::protocol::constants::*;
use crate::protocol::frame::{build_eth_header, FrameBuilder};
use crate::transport::raw::RawSocket;
use crate::types::{MacAddr, SlotRole};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Timing statistics of the cyclic loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct CyclicStats {
    pub cycles: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub running_avg_us: u64,
    /// Ticks whose work exceeded the cycle time (clock re-anchored).
    pub overruns: u64,
    pub send_errors: u64,
}

impl CyclicStats {
    fn record(&mut self, elapsed_us: u64, cycle_time_us: u64) {
        self.cycles += 1;
        if self.cycles == 1 || elapsed_us < self.min_us {
            self.min_us = elapsed_us;
        }
        if elapsed_us > self.max_us {
            self.max_us = elapsed_us;
        }
        // Exponential running average, 1/16 weight for the newest tick.
        self.running_avg_us = if self.cycles == 1 {
            elapsed_us
        } else {
            (self.running_avg_us * 15 + elapsed_us) / 16
        };
        if elapsed_us > cycle_time_us {
            self.overruns += 1;
        }
    }
}

/// Build one output cyclic frame for an AR: frame ID, output image, one
/// IOPS byte per actuator slot, cycle counter, data status, transfer
/// status, zero-padded to the Ethernet minimum.
#[must_use]
pub fn build_output_frame(controller_mac: MacAddr, ar: &mut Ar) -> Vec<u8> {
    let actuator_slots = ar
        .slots
        .iter()
        .filter(|s| s.role == SlotRole::Actuator)
        .count();
    let payload_len =
        ETH_HEADER_LEN + 2 + ar.output.buffer.len() + actuator_slots + RT_TRAILER_LEN;
    let mut frame = vec![0u8; payload_len.max(MIN_ETH_FRAME_LEN)];
    let cycle = ar.output.next_cycle();
    let len = {
        let mut b = FrameBuilder::new(&mut frame);
        // Building into a buffer sized above cannot fail.
        build_eth_header(&mut b, ar.device_mac, controller_mac).expect("sized frame");
        b.u16_be(ar.output.frame_id).expect("sized frame");
        b.bytes(&ar.output.buffer).expect("sized frame");
        for _ in 0..actuator_slots {
            b.u8(IOXS_GOOD).expect("sized frame");
        }
        b.u16_be(cycle).expect("sized frame");
        b.u8(DATA_STATUS_RUN_FRAME).expect("sized frame");
        b.u8(0).expect("sized frame"); // transfer status
        b.pad_to(MIN_ETH_FRAME_LEN).expect("sized frame");
        b.finish()
    };
    frame.truncate(len);
    frame
}

/// Split a received RT frame into `(frame_id, cyclic payload)`. The payload
/// excludes the Ethernet header, frame ID and the 4-byte trailer. Returns
/// `None` for frames too short to carry the trailer.
#[must_use]
pub fn input_payload(frame: &[u8]) -> Option<(u16, &[u8])> {
    if frame.len() < ETH_HEADER_LEN + 2 + RT_TRAILER_LEN {
        return None;
    }
    let frame_id = u16::from_be_bytes([frame[ETH_HEADER_LEN], frame[ETH_HEADER_LEN + 1]]);
    let payload = &frame[ETH_HEADER_LEN + 2..frame.len() - RT_TRAILER_LEN];
    Some((frame_id, payload))
}

/// True when `frame_id` falls in the RT Class 1 cyclic range.
#[must_use]
pub fn is_rt_class1(frame_id: u16) -> bool {
    (RT_CLASS1_FRAME_ID_BASE..=RT_CLASS1_FRAME_ID_MAX).contains(&frame_id)
}

pub struct CyclicEngine {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<CyclicStats>>,
}

impl CyclicEngine {
    /// Spawn the cyclic thread.
    pub fn spawn(
        running: Arc<AtomicBool>,
        cycle_time_us: u32,
        ar_manager: Arc<ArManager>,
        socket: Arc<RawSocket>,
        clock: MonotonicClock,
        controller_mac: MacAddr,
    ) -> CyclicEngine {
        let stats = Arc::new(Mutex::new(CyclicStats::default()));
        let thread_stats = Arc::clone(&stats);
        let thread_running = Arc::clone(&running);
        let cycle = Duration::from_micros(u64::from(cycle_time_us));
        let handle = std::thread::Builder::new()
            .name("pnio-cyclic".into())
            .spawn(move || {
                log::debug!("[cyclic] thread up, period {} us", cycle_time_us);
                let mut next_tick = Instant::now() + cycle;
                let mut frames: Vec<Vec<u8>> = Vec::new();
                while thread_running.load(Ordering::Relaxed) {
                    let tick_start = Instant::now();

                    ar_manager.tick(clock.now_ms());

                    frames.clear();
                    ar_manager.with_run_ars(|ar| {
                        frames.push(build_output_frame(controller_mac, ar));
                    });
                    let mut send_errors = 0u64;
                    for frame in &frames {
                        if let Err(e) = socket.send_frame(frame) {
                            send_errors += 1;
                            log::warn!("[cyclic] output send failed: {}", e);
                        }
                    }

                    let elapsed_us = tick_start.elapsed().as_micros() as u64;
                    {
                        let mut s = thread_stats.lock();
                        s.record(elapsed_us, u64::from(cycle_time_us));
                        s.send_errors += send_errors;
                    }

                    // Fixed-rate pacing; re-anchor when behind so lateness
                    // does not accumulate.
                    next_tick += cycle;
                    let now = Instant::now();
                    if next_tick <= now {
                        next_tick = now + cycle;
                    } else {
                        std::thread::sleep(next_tick - now);
                    }
                }
                log::debug!("[cyclic] thread down");
            })
            .expect("spawn cyclic thread");
        CyclicEngine {
            handle: Some(handle),
            running,
            stats,
        }
    }

    #[must_use]
    pub fn stats(&self) -> CyclicStats {
        *self.stats.lock()
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CyclicEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_track_extremes_and_overruns() {
        let mut s = CyclicStats::default();
        s.record(100, 1000);
        s.record(50, 1000);
        s.record(2000, 1000);
        assert_eq!(s.cycles, 3);
        assert_eq!(s.min_us, 50);
        assert_eq!(s.max_us, 2000);
        assert_eq!(s.overruns, 1);
        assert!(s.running_avg_us > 50);
    }

    #[test]
    fn input_payload_strips_header_and_trailer() {
        let mut frame = vec![0u8; 64];
        frame[12] = 0x88;
        frame[13] = 0x92;
        frame[14] = 0xC0;
        frame[15] = 0x02;
        let (frame_id, payload) = input_payload(&frame).unwrap();
        assert_eq!(frame_id, 0xC002);
        assert_eq!(payload.len(), 64 - ETH_HEADER_LEN - 2 - RT_TRAILER_LEN);
        assert!(input_payload(&frame[..17]).is_none());
    }

    #[test]
    fn rt_class1_range_check() {
        assert!(is_rt_class1(0xC000));
        assert!(is_rt_class1(0xF7FF));
        assert!(!is_rt_class1(0xBFFF));
        assert!(!is_rt_class1(0xFEFE));
    }
}
