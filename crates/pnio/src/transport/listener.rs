// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receive thread: raw socket -> frame demux.
//!
//! One dedicated thread blocks on the raw socket (bounded by its 100 ms
//! read timeout), hands every PROFINET frame to the demux callback, and
//! observes the controller-wide running flag between reads. Malformed
//! frames are counted and dropped; the loop never stops on them.

use crate::protocol::frame::is_profinet_frame;
use crate::transport::raw::{RawSocket, MAX_FRAME_LEN};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Demux callback: receives every PROFINET frame, Ethernet header included.
pub type FrameCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Receive-side counters.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub bytes_received: AtomicU64,
}

pub struct FrameListener {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    pub stats: Arc<ListenerStats>,
}

impl FrameListener {
    /// Spawn the receive thread.
    pub fn spawn(
        socket: Arc<RawSocket>,
        running: Arc<AtomicBool>,
        callback: FrameCallback,
    ) -> FrameListener {
        let stats = Arc::new(ListenerStats::default());
        let thread_stats = Arc::clone(&stats);
        let thread_running = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name("pnio-recv".into())
            .spawn(move || {
                let mut buf = vec![0u8; MAX_FRAME_LEN];
                log::debug!("[transport] receive thread up");
                while thread_running.load(Ordering::Relaxed) {
                    match socket.recv_frame(&mut buf) {
                        Ok(Some(n)) => {
                            thread_stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            thread_stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                            if is_profinet_frame(&buf[..n]) {
                                callback(&buf[..n]);
                            } else {
                                thread_stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Ok(None) => {} // timeout, re-check the running flag
                        Err(e) => {
                            log::warn!("[transport] raw recv failed: {}", e);
                            thread_stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                log::debug!("[transport] receive thread down");
            })
            .expect("spawn receive thread");
        FrameListener {
            handle: Some(handle),
            running,
            stats,
        }
    }

    /// Clear the running flag and join the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FrameListener {
    fn drop(&mut self) {
        self.stop();
    }
}
