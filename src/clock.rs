//! Wall-clock source for measurement timestamps
//!
//! The agent syncs once at startup. [`SntpClock`] asks an NTP server for the
//! time and keeps the offset against the system clock; [`SystemClock`] trusts
//! the OS.

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Seconds between the NTP era (1900) and the Unix epoch (1970)
const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

const NTP_PACKET_LEN: usize = 48;
const NTP_PORT: u16 = 123;

/// LI = 0, VN = 3, Mode = 3 (client)
const SNTP_CLIENT_REQUEST: u8 = 0x1B;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("NTP socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No NTP response from {0}")]
    Timeout(String),
    #[error("Invalid NTP response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait Clock: Send + Sync {
    /// Synchronize against the time source
    async fn sync(&mut self) -> Result<(), ClockError>;

    /// Current Unix time in seconds
    fn now(&self) -> i64;
}

/// The operating system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    async fn sync(&mut self) -> Result<(), ClockError> {
        Ok(())
    }

    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// One-shot SNTP client
#[derive(Debug, Clone)]
pub struct SntpClock {
    server: String,
    timeout: Duration,
    offset: i64,
}

impl SntpClock {
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
            offset: 0,
        }
    }

    /// Seconds added to the system clock after the last sync
    pub fn offset(&self) -> i64 {
        self.offset
    }

    fn server_address(&self) -> String {
        if self.server.contains(':') {
            self.server.clone()
        } else {
            format!("{}:{NTP_PORT}", self.server)
        }
    }

    async fn query(&self) -> Result<i64, ClockError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.server_address()).await?;

        let mut request = [0u8; NTP_PACKET_LEN];
        request[0] = SNTP_CLIENT_REQUEST;
        socket.send(&request).await?;

        let mut response = [0u8; NTP_PACKET_LEN];
        let received = tokio::time::timeout(self.timeout, socket.recv(&mut response))
            .await
            .map_err(|_| ClockError::Timeout(self.server.clone()))??;

        parse_response(&response[..received])
    }
}

#[async_trait]
impl Clock for SntpClock {
    async fn sync(&mut self) -> Result<(), ClockError> {
        let server_time = self.query().await?;
        self.offset = server_time - Utc::now().timestamp();
        info!(
            server = %self.server,
            offset_secs = self.offset,
            "Clock synchronized"
        );
        Ok(())
    }

    fn now(&self) -> i64 {
        Utc::now().timestamp() + self.offset
    }
}

/// Convert NTP era seconds to Unix seconds
pub fn ntp_to_unix(seconds: u32) -> i64 {
    i64::from(seconds) - NTP_UNIX_OFFSET
}

/// Extract the server transmit time, in Unix seconds, from an SNTP reply
pub fn parse_response(packet: &[u8]) -> Result<i64, ClockError> {
    if packet.len() < NTP_PACKET_LEN {
        return Err(ClockError::InvalidResponse(format!(
            "expected {NTP_PACKET_LEN} bytes, got {}",
            packet.len()
        )));
    }

    let mode = packet[0] & 0x07;
    if mode != 4 {
        return Err(ClockError::InvalidResponse(format!(
            "unexpected mode {mode}"
        )));
    }
    // Stratum 0 is a kiss-of-death packet
    if packet[1] == 0 {
        return Err(ClockError::InvalidResponse("kiss-of-death".to_string()));
    }

    let seconds = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]);
    if seconds == 0 {
        return Err(ClockError::InvalidResponse(
            "empty transmit timestamp".to_string(),
        ));
    }
    let fraction = u32::from_be_bytes([packet[44], packet[45], packet[46], packet[47]]);
    let round_up = i64::from(fraction >= 0x8000_0000);

    let unix = ntp_to_unix(seconds) + round_up;
    debug!(unix, "Parsed SNTP transmit timestamp");
    Ok(unix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(seconds: u32, fraction: u32) -> [u8; NTP_PACKET_LEN] {
        let mut packet = [0u8; NTP_PACKET_LEN];
        packet[0] = 0x1C; // LI 0, VN 3, mode 4
        packet[1] = 2;
        packet[40..44].copy_from_slice(&seconds.to_be_bytes());
        packet[44..48].copy_from_slice(&fraction.to_be_bytes());
        packet
    }

    #[test]
    fn test_ntp_to_unix() {
        assert_eq!(ntp_to_unix(2_208_988_800), 0);
        assert_eq!(ntp_to_unix(3_908_988_800), 1_700_000_000);
    }

    #[test]
    fn test_parse_response() {
        assert_eq!(parse_response(&reply(3_908_988_800, 0)).unwrap(), 1_700_000_000);
        // Half a second or more rounds up
        assert_eq!(
            parse_response(&reply(3_908_988_800, 0x8000_0000)).unwrap(),
            1_700_000_001
        );
    }

    #[test]
    fn test_parse_response_rejects_bad_packets() {
        assert!(parse_response(&[0u8; 12]).is_err());

        let mut client_mode = reply(3_908_988_800, 0);
        client_mode[0] = SNTP_CLIENT_REQUEST;
        assert!(parse_response(&client_mode).is_err());

        let mut kiss = reply(3_908_988_800, 0);
        kiss[1] = 0;
        assert!(parse_response(&kiss).is_err());

        assert!(parse_response(&reply(0, 0)).is_err());
    }

    #[test]
    fn test_server_address_default_port() {
        let clock = SntpClock::new("pool.ntp.org", Duration::from_secs(1));
        assert_eq!(clock.server_address(), "pool.ntp.org:123");

        let clock = SntpClock::new("10.0.0.1:1123", Duration::from_secs(1));
        assert_eq!(clock.server_address(), "10.0.0.1:1123");
    }

    #[tokio::test]
    async fn test_sync_against_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap().to_string();

        let responder = tokio::spawn(async move {
            let mut request = [0u8; NTP_PACKET_LEN];
            let (_, peer) = server.recv_from(&mut request).await.unwrap();
            assert_eq!(request[0], SNTP_CLIENT_REQUEST);
            let now = Utc::now().timestamp() + 100;
            let seconds = (now + NTP_UNIX_OFFSET) as u32;
            server.send_to(&reply(seconds, 0), peer).await.unwrap();
        });

        let mut clock = SntpClock::new(address, Duration::from_secs(2));
        clock.sync().await.unwrap();
        responder.await.unwrap();

        assert!((99..=101).contains(&clock.offset()));
        assert!((clock.now() - SystemClock.now() - clock.offset()).abs() <= 1);
    }

    #[tokio::test]
    async fn test_sync_times_out() {
        // Bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = silent.local_addr().unwrap().to_string();

        let mut clock = SntpClock::new(address, Duration::from_millis(50));
        assert!(matches!(clock.sync().await, Err(ClockError::Timeout(_))));
        assert_eq!(clock.offset(), 0);
    }
}
