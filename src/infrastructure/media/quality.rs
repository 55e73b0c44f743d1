//! Network quality estimation
//!
//! Reduces raw connection statistics to the coarse indicator the call UI
//! shows. Sampled periodically while a call is active.

use serde::{Deserialize, Serialize};

/// Raw connection statistics for one sampling window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkStats {
    /// Packet loss percentage (0.0 - 100.0)
    pub packet_loss_percent: f64,
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
}

impl Default for LinkStats {
    fn default() -> Self {
        Self {
            packet_loss_percent: 0.0,
            rtt_ms: 40.0,
        }
    }
}

/// Coarse network quality indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    /// Classify a sampling window. Thresholds follow the usual VoIP
    /// rules of thumb: above ~5% loss or ~400ms RTT a call is degraded
    /// beyond what conversation tolerates.
    pub fn from_stats(stats: LinkStats) -> Self {
        if stats.packet_loss_percent > 5.0 || stats.rtt_ms > 400.0 {
            NetworkQuality::Poor
        } else if stats.packet_loss_percent > 1.0 || stats.rtt_ms > 150.0 {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Good
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NetworkQuality::Good => "good",
            NetworkQuality::Fair => "fair",
            NetworkQuality::Poor => "poor",
        }
    }
}

impl Default for NetworkQuality {
    fn default() -> Self {
        NetworkQuality::Good
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_link_is_good() {
        let stats = LinkStats {
            packet_loss_percent: 0.2,
            rtt_ms: 35.0,
        };
        assert_eq!(NetworkQuality::from_stats(stats), NetworkQuality::Good);
    }

    #[test]
    fn test_moderate_latency_is_fair() {
        let stats = LinkStats {
            packet_loss_percent: 0.0,
            rtt_ms: 220.0,
        };
        assert_eq!(NetworkQuality::from_stats(stats), NetworkQuality::Fair);
    }

    #[test]
    fn test_heavy_loss_is_poor() {
        let stats = LinkStats {
            packet_loss_percent: 9.0,
            rtt_ms: 50.0,
        };
        assert_eq!(NetworkQuality::from_stats(stats), NetworkQuality::Poor);
    }
}
