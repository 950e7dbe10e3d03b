use anyhow::bail;
use std::sync::Arc;
use std::time::Duration;

use crate::packet::MAX_PACKET_DATA_LEN;
use crate::reader::{ConnectListener, MessageReader, PunchListener};

/// Endpoint configuration.
///
/// `RudpConfig::default()` is a working production setup; tests and specialized
///  deployments override individual fields. `validate()` runs at endpoint creation.
pub struct RudpConfig {
    /// Local UDP port to bind; 0 picks any free port.
    pub local_port: u16,

    /// Global reader: invoked for every inbound application message that the
    ///  channel's own reader did not consume, and for terminal notifications.
    pub reader: Option<Arc<dyn MessageReader>>,

    /// Invoked when a remote peer completes a handshake with this endpoint.
    pub connect_listener: Option<Arc<dyn ConnectListener>>,

    /// Invoked on inbound PUNCH packets.
    pub punch_listener: Option<Arc<dyn PunchListener>>,

    /// Upper limit for application payload bytes in a single DATA packet. Larger
    ///  messages are split. Must not exceed what fits a UDP datagram after header
    ///  and encryption overhead.
    pub max_packet_data_len: usize,

    /// Starting value of the adaptive client-mode send delay.
    pub initial_send_delay: Duration,

    /// Test knob: drop every Nth client-mode DATA packet on its first transmission
    ///  (uniform random trial) to exercise the retransmission path. 0 disables.
    pub drop_one_in: u32,

    /// A packet retransmitted more than this many times destroys its channel.
    pub max_retransmit_attempts: u32,

    /// Period of the per-channel tick driving the retransmit scan. The inactivity
    ///  check piggybacks on the same tick at `keepalive_check_interval` granularity.
    pub retransmit_tick: Duration,

    pub keepalive_check_interval: Duration,

    /// A client-mode channel pings its peer when nothing was received for this long.
    pub ping_after: Duration,

    /// A channel is destroyed when nothing was received for this long.
    pub disconnect_after: Duration,

    /// Deadline for the four-way connection handshake.
    pub handshake_timeout: Duration,

    /// Default deadline for registered delivery callbacks.
    pub delivery_timeout: Duration,

    /// Sleep step of the pacing probe that waits for head-of-queue retransmits to
    ///  clear before sending.
    pub pacing_probe_step: Duration,

    /// Maximum number of pacing probe rounds per packet.
    pub pacing_probe_rounds: u32,

    /// How often the adaptive send delay is re-evaluated.
    pub delay_check_interval: Duration,

    /// The send delay is not decreased below this value (microseconds).
    pub delay_decrease_threshold: u64,

    /// Above this value (microseconds) the send delay decreases in large steps.
    pub delay_fast_decrease_threshold: u64,
}

impl Default for RudpConfig {
    fn default() -> RudpConfig {
        RudpConfig {
            local_port: 0,
            reader: None,
            connect_listener: None,
            punch_listener: None,
            max_packet_data_len: MAX_PACKET_DATA_LEN,
            initial_send_delay: Duration::from_micros(15),
            drop_one_in: 0,
            max_retransmit_attempts: 100,
            retransmit_tick: Duration::from_millis(30),
            keepalive_check_interval: Duration::from_millis(500),
            ping_after: Duration::from_secs(4),
            disconnect_after: Duration::from_secs(6),
            handshake_timeout: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(5),
            pacing_probe_step: Duration::from_micros(20),
            pacing_probe_rounds: 15,
            delay_check_interval: Duration::from_millis(40),
            delay_decrease_threshold: 30,
            delay_fast_decrease_threshold: 100,
        }
    }
}

impl RudpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_data_len == 0 || self.max_packet_data_len > MAX_PACKET_DATA_LEN {
            bail!(
                "max packet data length must be in 1..={}, was {}",
                MAX_PACKET_DATA_LEN,
                self.max_packet_data_len
            );
        }
        if self.max_retransmit_attempts < 5 {
            bail!(
                "retransmit attempts ceiling must be at least 5, was {}",
                self.max_retransmit_attempts
            );
        }
        if self.retransmit_tick < Duration::from_millis(10)
            || self.retransmit_tick > Duration::from_millis(100)
        {
            bail!(
                "retransmit tick must be between 10ms and 100ms, was {:?}",
                self.retransmit_tick
            );
        }
        if self.ping_after >= self.disconnect_after {
            bail!("ping deadline must come before the disconnect deadline");
        }
        Ok(())
    }
}
