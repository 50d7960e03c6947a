// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Flow control (sliding receive window) and Reno-style congestion control, combined into one
//! `AdaptiveFlowController` used by each connection to decide how much it may have in flight.

use std::time::Duration;

/// Sliding-window flow controller: bounds bytes in flight against the receiver's advertised
/// window.
#[derive(Debug)]
pub struct FlowController {
    window_size: u32,
    receiver_window: u32,
    bytes_in_flight: u32,
}

impl FlowController {
    /// Build a flow controller starting at `initial_window` bytes.
    pub fn new(initial_window: u32) -> Self {
        Self {
            window_size: initial_window,
            receiver_window: initial_window,
            bytes_in_flight: 0,
        }
    }

    fn effective_window(&self) -> u32 {
        self.window_size.min(self.receiver_window)
    }

    /// Whether `data_size` more bytes can be sent without exceeding the effective window.
    pub fn can_send(&self, data_size: u32) -> bool {
        self.bytes_in_flight.saturating_add(data_size) <= self.effective_window()
    }

    /// Record that `data_size` bytes were just sent.
    pub fn on_send(&mut self, data_size: u32) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_add(data_size);
    }

    /// Record an acknowledgment for `data_size` bytes, updating the receiver's advertised window.
    pub fn on_ack(&mut self, data_size: u32, receiver_window: u32) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(data_size);
        self.receiver_window = receiver_window;
    }

    /// Bytes still available to send under the effective window.
    pub fn available_window(&self) -> u32 {
        self.effective_window().saturating_sub(self.bytes_in_flight)
    }

    /// Current count of unacknowledged bytes.
    pub fn bytes_in_flight(&self) -> u32 {
        self.bytes_in_flight
    }
}

const RTT_HISTORY: usize = 10;

/// Reno-style congestion controller: slow start, congestion avoidance, fast retransmit/recovery.
#[derive(Debug)]
pub struct CongestionController {
    mss: u32,
    cwnd: f64,
    ssthresh: f64,
    in_slow_start: bool,
    in_fast_recovery: bool,
    last_ack: u32,
    duplicate_ack_count: u32,
    min_rtt: Option<Duration>,
    rtt_history: std::collections::VecDeque<Duration>,
    losses: u64,
    fast_retransmits: u64,
}

/// Snapshot of congestion controller state, for logging/metrics.
#[derive(Clone, Copy, Debug)]
pub struct CongestionStats {
    /// Current congestion window, in bytes.
    pub cwnd: u32,
    /// Current slow-start threshold, in bytes.
    pub ssthresh: u32,
    /// Whether still in slow start.
    pub in_slow_start: bool,
    /// Whether in fast recovery.
    pub in_fast_recovery: bool,
    /// Cumulative retransmission-timeout count.
    pub losses: u64,
    /// Cumulative fast-retransmit count.
    pub fast_retransmits: u64,
}

impl CongestionController {
    /// Build a congestion controller with the given maximum segment size.
    pub fn new(mss: u32) -> Self {
        Self {
            mss,
            cwnd: mss as f64,
            ssthresh: 65535.0,
            in_slow_start: true,
            in_fast_recovery: false,
            last_ack: 0,
            duplicate_ack_count: 0,
            min_rtt: None,
            rtt_history: std::collections::VecDeque::with_capacity(RTT_HISTORY),
            losses: 0,
            fast_retransmits: 0,
        }
    }

    /// Current congestion window, in bytes.
    pub fn send_window(&self) -> u32 {
        self.cwnd as u32
    }

    /// Called on every in-order ACK; `rtt` is the sample for this ACK, if measurable.
    pub fn on_ack(&mut self, rtt: Option<Duration>) {
        if let Some(rtt) = rtt {
            if self.rtt_history.len() == RTT_HISTORY {
                self.rtt_history.pop_front();
            }
            self.rtt_history.push_back(rtt);
            self.min_rtt = Some(self.min_rtt.map_or(rtt, |m| m.min(rtt)));
        }

        if self.in_fast_recovery {
            self.cwnd = self.ssthresh;
            self.in_fast_recovery = false;
        } else if self.in_slow_start {
            self.cwnd += self.mss as f64;
            if self.cwnd >= self.ssthresh {
                self.in_slow_start = false;
            }
        } else {
            let increment = (self.mss as f64 * self.mss as f64) / self.cwnd;
            self.cwnd += increment;
        }
        self.duplicate_ack_count = 0;
    }

    /// Called on a duplicate ACK; triggers fast retransmit on the third in a row.
    pub fn on_duplicate_ack(&mut self, ack_number: u32) {
        if ack_number == self.last_ack {
            self.duplicate_ack_count += 1;
            if self.duplicate_ack_count == 3 {
                self.fast_retransmit();
            }
        } else {
            self.last_ack = ack_number;
            self.duplicate_ack_count = 1;
        }
    }

    fn fast_retransmit(&mut self) {
        self.fast_retransmits += 1;
        self.ssthresh = (self.cwnd / 2.0).max(2.0 * self.mss as f64);
        self.cwnd = self.ssthresh + 3.0 * self.mss as f64;
        self.in_fast_recovery = true;
        self.in_slow_start = false;
    }

    /// Called on a retransmission timeout: multiplicative decrease, re-enter slow start.
    pub fn on_timeout(&mut self) {
        self.losses += 1;
        self.ssthresh = (self.cwnd / 2.0).max(2.0 * self.mss as f64);
        self.cwnd = self.mss as f64;
        self.in_slow_start = true;
        self.in_fast_recovery = false;
        self.duplicate_ack_count = 0;
    }

    /// Heuristic congestion signal: the last 3 RTT samples average notably above the observed
    /// minimum RTT.
    pub fn is_network_congested(&self) -> bool {
        if self.rtt_history.len() < 5 {
            return false;
        }
        let min_rtt = match self.min_rtt {
            Some(m) => m,
            None => return false,
        };
        let recent: Duration = self.rtt_history.iter().rev().take(3).sum();
        let recent_avg = recent / 3;
        recent_avg.as_secs_f64() > min_rtt.as_secs_f64() * 1.5
    }

    /// Snapshot current stats.
    pub fn stats(&self) -> CongestionStats {
        CongestionStats {
            cwnd: self.cwnd as u32,
            ssthresh: self.ssthresh as u32,
            in_slow_start: self.in_slow_start,
            in_fast_recovery: self.in_fast_recovery,
            losses: self.losses,
            fast_retransmits: self.fast_retransmits,
        }
    }
}

/// Combined flow + congestion control, gating how much a connection may have in flight.
#[derive(Debug)]
pub struct AdaptiveFlowController {
    flow: FlowController,
    congestion: CongestionController,
}

impl AdaptiveFlowController {
    /// Build a combined controller.
    pub fn new(mss: u32, initial_window: u32) -> Self {
        Self {
            flow: FlowController::new(initial_window),
            congestion: CongestionController::new(mss),
        }
    }

    /// Whether `data_size` more bytes can be sent under both flow and congestion limits.
    pub fn can_send(&self, data_size: u32) -> bool {
        self.flow.can_send(data_size)
            && self.flow.bytes_in_flight() + data_size <= self.congestion.send_window()
    }

    /// Record that `data_size` bytes were sent.
    pub fn on_send(&mut self, data_size: u32) {
        self.flow.on_send(data_size);
    }

    /// Record an ACK covering `data_size` bytes.
    pub fn on_ack(&mut self, data_size: u32, receiver_window: u32, rtt: Option<Duration>) {
        self.flow.on_ack(data_size, receiver_window);
        self.congestion.on_ack(rtt);
    }

    /// Record a duplicate ACK.
    pub fn on_duplicate_ack(&mut self, ack_number: u32) {
        self.congestion.on_duplicate_ack(ack_number);
    }

    /// Record a retransmission timeout.
    pub fn on_timeout(&mut self) {
        self.congestion.on_timeout();
    }

    /// Bytes available to send right now, the smaller of the flow and congestion windows.
    pub fn effective_window(&self) -> u32 {
        self.flow.available_window().min(self.congestion.send_window())
    }

    /// Congestion controller stats, for metrics/logging.
    pub fn congestion_stats(&self) -> CongestionStats {
        self.congestion.stats()
    }
}

/// Jacobson/Karels RTT estimator, producing a smoothed RTT, RTT variance, and retransmission
/// timeout. The RTO is clamped to `[1s, 60s]` in both directions.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
}

const RTO_MIN: Duration = Duration::from_secs(1);
const RTO_MAX: Duration = Duration::from_secs(60);

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            srtt: None,
            rttvar: Duration::from_millis(0),
        }
    }
}

impl RttEstimator {
    /// Feed a new round-trip sample.
    pub fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let diff = if rtt > srtt { rtt - srtt } else { srtt - rtt };
                self.rttvar = (self.rttvar * 3 + diff) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
    }

    /// Current retransmission timeout, clamped to `[1s, 60s]`.
    pub fn rto(&self) -> Duration {
        let srtt = self.srtt.unwrap_or(Duration::from_secs(1));
        let computed = srtt + self.rttvar * 4;
        computed.clamp(RTO_MIN, RTO_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_controller_blocks_past_receiver_window() {
        let mut fc = FlowController::new(1000);
        assert!(fc.can_send(900));
        fc.on_send(900);
        assert!(!fc.can_send(200));
        fc.on_ack(900, 1000);
        assert!(fc.can_send(900));
    }

    #[test]
    fn congestion_window_grows_in_slow_start() {
        let mut cc = CongestionController::new(1400);
        let w0 = cc.send_window();
        cc.on_ack(None);
        assert!(cc.send_window() > w0);
    }

    #[test]
    fn three_duplicate_acks_trigger_fast_retransmit() {
        let mut cc = CongestionController::new(1400);
        cc.on_duplicate_ack(5);
        cc.on_duplicate_ack(5);
        assert_eq!(cc.stats().fast_retransmits, 0);
        cc.on_duplicate_ack(5);
        assert_eq!(cc.stats().fast_retransmits, 1);
        assert!(cc.stats().in_fast_recovery);
    }

    #[test]
    fn timeout_resets_to_slow_start() {
        let mut cc = CongestionController::new(1400);
        for _ in 0..10 {
            cc.on_ack(None);
        }
        assert!(!cc.stats().in_slow_start);
        cc.on_timeout();
        assert!(cc.stats().in_slow_start);
        assert_eq!(cc.send_window(), 1400);
    }

    #[test]
    fn rto_is_clamped_both_directions() {
        let mut est = RttEstimator::default();
        est.sample(Duration::from_millis(1));
        assert!(est.rto() >= RTO_MIN);

        let mut est = RttEstimator::default();
        for _ in 0..5 {
            est.sample(Duration::from_secs(120));
        }
        assert!(est.rto() <= RTO_MAX);
    }
}
