//! Tri-axis vibration sensor on a serial register bus.
//!
//! Register layout from the configured start register: 0..=2 hold X/Y/Z
//! acceleration at ±16 g full scale, 11 holds temperature in hundredths of °C.
//!
//! Velocity is derived from acceleration at a fixed assumed frequency
//! (`assumed_frequency_hz`, 30 Hz by default). The sensor does not report its
//! dominant frequency, so readings for machines running far from that
//! frequency are scaled wrongly.

pub mod protocol;
pub mod transport;

use std::{f64::consts::PI, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{config::VibrationCfg, conversion::celsius_to_fahrenheit, error::ProtocolError};

pub use protocol::ReadRequest;
pub use transport::{SerialPortTransport, SerialTransport};

/// Response budget of one exchange.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

const FULL_SCALE_G: f64 = 16.0;
const REGISTER_SPAN: f64 = 32768.0;
const STANDARD_GRAVITY: f64 = 9.80665;
const TEMPERATURE_REGISTER: usize = 11;
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// ISO 10816-3 vibration severity zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsoZone {
    A,
    B,
    C,
    D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Good,
    Acceptable,
    Warning,
    Unsatisfactory,
    Unacceptable,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AlertLevel::Good => "Good",
            AlertLevel::Acceptable => "Acceptable",
            AlertLevel::Warning => "Warning",
            AlertLevel::Unsatisfactory => "Unsatisfactory",
            AlertLevel::Unacceptable => "Unacceptable",
        };
        f.write_str(label)
    }
}

/// Classifies an RMS velocity in mm/s.
pub fn classify(velocity_mm_s: f64) -> (IsoZone, AlertLevel) {
    match velocity_mm_s {
        v if v <= 2.8 => (IsoZone::A, AlertLevel::Good),
        v if v <= 4.5 => (IsoZone::B, AlertLevel::Acceptable),
        v if v <= 7.1 => (IsoZone::B, AlertLevel::Warning),
        v if v <= 11.0 => (IsoZone::C, AlertLevel::Unsatisfactory),
        _ => (IsoZone::D, AlertLevel::Unacceptable),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Axes {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Axes {
    fn map(self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            x: f(self.x),
            y: f(self.y),
            z: f(self.z),
        }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x.powi(2) + self.y.powi(2) + self.z.powi(2)).sqrt()
    }
}

/// One decoded sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VibrationSample {
    pub sensor_id: String,
    /// Acceleration in g.
    pub acceleration: Axes,
    /// Velocity in mm/s.
    pub velocity: Axes,
    pub velocity_magnitude: f64,
    pub temperature_f: Option<f64>,
    pub zone: IsoZone,
    pub alert: AlertLevel,
    pub timestamp: DateTime<Utc>,
}

/// Turns signed registers into a sample.
pub fn decode(
    sensor_id: &str,
    registers: &[i16],
    frequency_hz: f64,
) -> Result<VibrationSample, ProtocolError> {
    let [x, y, z] = match registers {
        [x, y, z, ..] => [*x, *y, *z],
        _ => {
            return Err(ProtocolError::ShortFrame {
                expected: 3,
                actual: registers.len(),
            });
        }
    };

    let acceleration = Axes {
        x: f64::from(x),
        y: f64::from(y),
        z: f64::from(z),
    }
    .map(|raw| raw / REGISTER_SPAN * FULL_SCALE_G);
    let velocity =
        acceleration.map(|g| g * STANDARD_GRAVITY / (2.0 * PI * frequency_hz) * 1000.0);
    let velocity_magnitude = velocity.magnitude();
    let (zone, alert) = classify(velocity_magnitude);

    Ok(VibrationSample {
        sensor_id: sensor_id.to_string(),
        acceleration,
        velocity,
        velocity_magnitude,
        temperature_f: registers
            .get(TEMPERATURE_REGISTER)
            .map(|raw| celsius_to_fahrenheit(f64::from(*raw) / 100.0)),
        zone,
        alert,
        timestamp: Utc::now(),
    })
}

/// Reads samples from one sensor. Failures are returned as-is.
pub struct VibrationDriver {
    sensor_id: String,
    request: ReadRequest,
    frequency_hz: f64,
    transport: Box<dyn SerialTransport>,
}

impl VibrationDriver {
    pub fn new(
        sensor_id: impl Into<String>,
        request: ReadRequest,
        frequency_hz: f64,
        transport: Box<dyn SerialTransport>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            request,
            frequency_hz,
            transport,
        }
    }

    pub fn from_config(cfg: &VibrationCfg) -> Self {
        Self::new(
            cfg.id.clone(),
            ReadRequest {
                address: cfg.address,
                start: cfg.start_register,
                count: cfg.register_count,
            },
            cfg.assumed_frequency_hz,
            Box::new(SerialPortTransport::new(cfg.port.clone(), cfg.baud)),
        )
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub async fn read_sample(&self) -> Result<VibrationSample, ProtocolError> {
        let frame = self
            .transport
            .exchange(
                &self.request.to_bytes(),
                self.request.response_len(),
                RESPONSE_TIMEOUT,
            )
            .await?;
        let registers = self.request.parse_response(&frame)?;
        decode(&self.sensor_id, &registers, self.frequency_hz)
    }
}

/// Polling state of one sensor: failure count, backoff and suspension.
pub struct VibrationPoller {
    driver: VibrationDriver,
    interval: Duration,
    max_failures: u32,
    consecutive_failures: u32,
    suspended: bool,
}

impl VibrationPoller {
    pub fn new(driver: VibrationDriver, interval: Duration, max_failures: u32) -> Self {
        Self {
            driver,
            interval,
            max_failures: max_failures.max(1),
            consecutive_failures: 0,
            suspended: false,
        }
    }

    pub fn from_config(cfg: &VibrationCfg) -> Self {
        Self::new(
            VibrationDriver::from_config(cfg),
            Duration::from_secs(u64::from(cfg.poll_secs.max(1))),
            cfg.max_failures,
        )
    }

    pub fn sensor_id(&self) -> &str {
        self.driver.sensor_id()
    }

    /// Takes one reading unless polling is suspended.
    pub async fn poll(&mut self) -> Result<VibrationSample, ProtocolError> {
        if self.suspended {
            return Err(ProtocolError::Suspended(self.consecutive_failures));
        }
        match self.driver.read_sample().await {
            Ok(sample) => {
                self.consecutive_failures = 0;
                Ok(sample)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.max_failures {
                    self.suspended = true;
                }
                Err(e)
            }
        }
    }

    /// Delay before the next poll: the interval, doubled per consecutive failure.
    pub fn next_delay(&self) -> Duration {
        let factor = 1u32 << self.consecutive_failures.min(6);
        (self.interval * factor).min(MAX_BACKOFF.max(self.interval))
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn resume(&mut self) {
        self.suspended = false;
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::protocol::tests::{FRAME_7_MM_S, FRAME_8_MM_S, REQUEST};
    use super::transport::MockSerialTransport;
    use super::*;
    use pretty_assertions::assert_eq;

    fn driver_returning(frame: Vec<u8>) -> VibrationDriver {
        let mut transport = MockSerialTransport::new();
        transport
            .expect_exchange()
            .withf(|request, len, timeout| {
                request.to_vec() == REQUEST.to_bytes().to_vec()
                    && *len == 29
                    && *timeout == RESPONSE_TIMEOUT
            })
            .returning(move |_, _, _| Ok(frame.clone()));
        VibrationDriver::new("tower-fan", REQUEST, 30.0, Box::new(transport))
    }

    fn failing_driver(times: usize) -> VibrationDriver {
        let mut transport = MockSerialTransport::new();
        transport
            .expect_exchange()
            .times(times)
            .returning(|_, _, timeout| Err(ProtocolError::Timeout(timeout)));
        VibrationDriver::new("tower-fan", REQUEST, 30.0, Box::new(transport))
    }

    #[test]
    fn zone_boundaries() {
        assert_eq!(classify(2.8), (IsoZone::A, AlertLevel::Good));
        assert_eq!(classify(4.5), (IsoZone::B, AlertLevel::Acceptable));
        assert_eq!(classify(7.0), (IsoZone::B, AlertLevel::Warning));
        assert_eq!(classify(7.1), (IsoZone::B, AlertLevel::Warning));
        assert_eq!(classify(8.0), (IsoZone::C, AlertLevel::Unsatisfactory));
        assert_eq!(classify(11.01), (IsoZone::D, AlertLevel::Unacceptable));
    }

    #[test]
    fn decode_equal_axes() {
        let sample = decode("s", &[100, 100, 100], 30.0).unwrap();
        assert!((sample.velocity_magnitude - 4.40).abs() < 0.01);
        assert_eq!(sample.zone, IsoZone::B);
        assert_eq!(sample.temperature_f, None);
    }

    #[test]
    fn decode_negative_acceleration_has_same_magnitude() {
        let positive = decode("s", &[276, 0, 0], 30.0).unwrap();
        let negative = decode("s", &[-276, 0, 0], 30.0).unwrap();
        assert!((positive.velocity_magnitude - negative.velocity_magnitude).abs() < 1e-12);
        assert!(negative.velocity.x < 0.0);
    }

    #[test]
    fn decode_needs_three_axes() {
        assert!(matches!(
            decode("s", &[1, 2], 30.0),
            Err(ProtocolError::ShortFrame { expected: 3, actual: 2 })
        ));
    }

    #[tokio::test]
    async fn known_frame_decodes_to_warning() {
        let sample = driver_returning(FRAME_7_MM_S.to_vec())
            .read_sample()
            .await
            .unwrap();
        assert!((sample.velocity_magnitude - 7.0).abs() < 0.05);
        assert_eq!(sample.zone, IsoZone::B);
        assert_eq!(sample.alert, AlertLevel::Warning);
        assert!((sample.temperature_f.unwrap() - 74.3).abs() < 1e-9);
        assert_eq!(sample.sensor_id, "tower-fan");
    }

    #[tokio::test]
    async fn known_frame_decodes_to_unsatisfactory() {
        let sample = driver_returning(FRAME_8_MM_S.to_vec())
            .read_sample()
            .await
            .unwrap();
        assert!((sample.velocity_magnitude - 8.0).abs() < 0.05);
        assert_eq!(sample.zone, IsoZone::C);
        assert_eq!(sample.alert, AlertLevel::Unsatisfactory);
    }

    #[tokio::test]
    async fn malformed_frame_is_an_error_not_a_sample() {
        let mut frame = FRAME_7_MM_S.to_vec();
        frame[0] = 0x01;
        let result = driver_returning(frame).read_sample().await;
        assert!(matches!(result, Err(ProtocolError::AddressMismatch { .. })));

        let result = driver_returning(FRAME_7_MM_S[..10].to_vec()).read_sample().await;
        assert!(matches!(result, Err(ProtocolError::ShortFrame { .. })));
    }

    #[tokio::test]
    async fn poller_suspends_after_max_failures() {
        let mut poller = VibrationPoller::new(failing_driver(3), Duration::from_secs(5), 3);

        for attempt in 1..=3 {
            assert!(matches!(poller.poll().await, Err(ProtocolError::Timeout(_))));
            assert_eq!(poller.consecutive_failures(), attempt);
        }
        assert!(poller.is_suspended());

        // no further exchange happens while suspended
        assert_eq!(poller.poll().await, Err(ProtocolError::Suspended(3)));
    }

    #[tokio::test]
    async fn poller_backs_off_exponentially() {
        let mut poller = VibrationPoller::new(failing_driver(2), Duration::from_secs(5), 5);
        assert_eq!(poller.next_delay(), Duration::from_secs(5));
        let _ = poller.poll().await;
        assert_eq!(poller.next_delay(), Duration::from_secs(10));
        let _ = poller.poll().await;
        assert_eq!(poller.next_delay(), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn resume_clears_suspension() {
        let mut transport = MockSerialTransport::new();
        let mut calls = 0;
        transport.expect_exchange().times(2).returning(move |_, _, timeout| {
            calls += 1;
            if calls == 1 {
                Err(ProtocolError::Timeout(timeout))
            } else {
                Ok(FRAME_7_MM_S.to_vec())
            }
        });
        let driver = VibrationDriver::new("tower-fan", REQUEST, 30.0, Box::new(transport));
        let mut poller = VibrationPoller::new(driver, Duration::from_secs(5), 1);

        assert!(poller.poll().await.is_err());
        assert!(poller.is_suspended());

        poller.resume();
        assert!(!poller.is_suspended());
        assert!(poller.poll().await.is_ok());
        assert_eq!(poller.consecutive_failures(), 0);
    }
}
