//! Connection quality and traffic counters.

use std::collections::VecDeque;

/// Round trips and sequence gaps kept for the rolling figures
const SAMPLE_WINDOW: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ConnectionQuality {
    pub ping_ms: f32,
    /// Percent, 0..=100
    pub packet_loss: f32,
    /// Received bytes per second
    pub bandwidth: f32,
    pub jitter_ms: f32,
    pub is_stable: bool,
    /// 0..=100
    pub quality_score: f32,
}

impl ConnectionQuality {
    pub fn new(ping_ms: f32, packet_loss: f32, jitter_ms: f32, bandwidth: f32) -> Self {
        let mut quality = Self {
            ping_ms,
            packet_loss,
            bandwidth,
            jitter_ms,
            is_stable: false,
            quality_score: 0.0,
        };
        quality.is_stable = quality.calculate_stability();
        quality.quality_score = quality.calculate_score();
        quality
    }

    /// Mean of the ping, loss and jitter sub-scores.
    pub fn calculate_score(&self) -> f32 {
        let ping = (100.0 - self.ping_ms / 2.0).clamp(0.0, 100.0);
        let loss = (100.0 - self.packet_loss * 10.0).clamp(0.0, 100.0);
        let jitter = (100.0 - self.jitter_ms / 2.0).clamp(0.0, 100.0);
        (ping + loss + jitter) / 3.0
    }

    pub fn calculate_stability(&self) -> bool {
        self.ping_ms < 200.0 && self.packet_loss < 5.0 && self.jitter_ms < 50.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NetworkStatistics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub average_packet_size: f32,
    pub total_bandwidth_used: u64,
}

impl NetworkStatistics {
    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
        self.update_totals();
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
        self.update_totals();
    }

    fn update_totals(&mut self) {
        self.total_bandwidth_used = self.bytes_sent + self.bytes_received;
        let packets = self.packets_sent + self.packets_received;
        self.average_packet_size = if packets == 0 {
            0.0
        } else {
            self.total_bandwidth_used as f32 / packets as f32
        };
    }
}

/// Rolling ping, jitter and loss measurements.
#[derive(Debug, Clone, Default)]
pub struct QualityTracker {
    round_trips: VecDeque<f32>,
    /// (expected, received) per gap between arrived replication packets
    sequence_gaps: VecDeque<(u32, u32)>,
    last_sequence: Option<u32>,
    bytes_received: u64,
    first_receive: Option<f64>,
    last_receive: Option<f64>,
}

impl QualityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_round_trip(&mut self, rtt_ms: f32) {
        if self.round_trips.len() == SAMPLE_WINDOW {
            self.round_trips.pop_front();
        }
        self.round_trips.push_back(rtt_ms.max(0.0));
    }

    /// Notes the sequence number of a replication packet that arrived
    ///
    /// The server numbers the packets it sends to each client, so skipped
    /// numbers are packets that were sent and lost. Ticks on which the
    /// server had nothing for this client never consume a number and do
    /// not count. Repeats and reordered packets are ignored.
    pub fn record_sequence(&mut self, sequence: u32) {
        if let Some(last) = self.last_sequence {
            let gap = sequence.wrapping_sub(last);
            if gap == 0 || gap > u32::MAX / 2 {
                return;
            }
            if self.sequence_gaps.len() == SAMPLE_WINDOW {
                self.sequence_gaps.pop_front();
            }
            self.sequence_gaps.push_back((gap, 1));
        }
        self.last_sequence = Some(sequence);
    }

    pub fn record_bytes(&mut self, bytes: usize, now: f64) {
        self.bytes_received += bytes as u64;
        self.first_receive.get_or_insert(now);
        self.last_receive = Some(now);
    }

    /// Mean of the recent round trips
    pub fn ping_ms(&self) -> f32 {
        if self.round_trips.is_empty() {
            return 0.0;
        }
        self.round_trips.iter().sum::<f32>() / self.round_trips.len() as f32
    }

    /// Mean absolute difference between consecutive round trips
    pub fn jitter_ms(&self) -> f32 {
        if self.round_trips.len() < 2 {
            return 0.0;
        }
        let deltas: f32 = self
            .round_trips
            .iter()
            .zip(self.round_trips.iter().skip(1))
            .map(|(a, b)| (b - a).abs())
            .sum();
        deltas / (self.round_trips.len() - 1) as f32
    }

    pub fn packet_loss(&self) -> f32 {
        let (expected, received) = self
            .sequence_gaps
            .iter()
            .fold((0u64, 0u64), |(e, r), (gap, got)| (e + *gap as u64, r + *got as u64));
        if expected == 0 {
            return 0.0;
        }
        (expected - received) as f32 / expected as f32 * 100.0
    }

    pub fn bandwidth(&self) -> f32 {
        match (self.first_receive, self.last_receive) {
            (Some(first), Some(last)) if last > first => {
                (self.bytes_received as f64 / (last - first)) as f32
            }
            _ => 0.0,
        }
    }

    pub fn quality(&self) -> ConnectionQuality {
        ConnectionQuality::new(
            self.ping_ms(),
            self.packet_loss(),
            self.jitter_ms(),
            self.bandwidth(),
        )
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
