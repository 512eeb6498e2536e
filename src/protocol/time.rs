//! Event time representation.
//!
//! Forward protocol timestamps carry sub-second precision as a MessagePack
//! extension value (type 0) holding big-endian u32 seconds followed by
//! big-endian u32 nanoseconds.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rmpv::Value;

use crate::core::error::{EmitError, ProtocolError};
use crate::core::{EVENT_TIME_EXT_TYPE, EVENT_TIME_SIZE};

/// A protocol event time: seconds since the Unix epoch plus nanoseconds.
///
/// Ordering is lexicographic on `(seconds, nanos)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventTime {
    /// Seconds since the Unix epoch.
    pub seconds: u32,
    /// Nanoseconds within the second.
    pub nanos: u32,
}

impl EventTime {
    /// Create an event time from epoch seconds and nanoseconds.
    pub fn from_epoch(seconds: u32, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Create an event time from a wall-clock millisecond value.
    ///
    /// Values of 2^32 seconds or more do not fit the wire format.
    pub fn from_millis(ms: u64) -> Result<Self, EmitError> {
        let seconds = ms / 1000;
        if seconds > u64::from(u32::MAX) {
            return Err(EmitError::DataType(format!(
                "timestamp {ms}ms is out of the representable range"
            )));
        }
        Ok(Self {
            seconds: seconds as u32,
            nanos: (ms % 1000) as u32 * 1_000_000,
        })
    }

    /// Create an event time from epoch seconds expressed as a `u64`.
    pub fn from_seconds(seconds: u64) -> Result<Self, EmitError> {
        if seconds > u64::from(u32::MAX) {
            return Err(EmitError::DataType(format!(
                "timestamp {seconds}s is out of the representable range"
            )));
        }
        Ok(Self {
            seconds: seconds as u32,
            nanos: 0,
        })
    }

    /// Create an event time from a wall-clock instant.
    pub fn from_system_time(time: SystemTime) -> Result<Self, EmitError> {
        let elapsed = time
            .duration_since(UNIX_EPOCH)
            .map_err(|_| EmitError::DataType("timestamp precedes the Unix epoch".into()))?;
        if elapsed.as_secs() > u64::from(u32::MAX) {
            return Err(EmitError::DataType(
                "timestamp is out of the representable range".into(),
            ));
        }
        Ok(Self {
            seconds: elapsed.as_secs() as u32,
            nanos: elapsed.subsec_nanos(),
        })
    }

    /// Capture the current wall-clock time.
    pub fn now() -> Self {
        // The wall clock stays below 2^32 seconds until the year 2106.
        Self::from_system_time(SystemTime::now()).unwrap_or_default()
    }

    /// Encode to the 8-byte wire form.
    pub fn to_bytes(self) -> [u8; EVENT_TIME_SIZE] {
        let mut buf = [0u8; EVENT_TIME_SIZE];
        buf[..4].copy_from_slice(&self.seconds.to_be_bytes());
        buf[4..].copy_from_slice(&self.nanos.to_be_bytes());
        buf
    }

    /// Decode from the 8-byte wire form.
    pub fn from_bytes(buf: [u8; EVENT_TIME_SIZE]) -> Self {
        Self {
            seconds: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            nanos: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    /// Represent as the MessagePack extension value used on the wire.
    pub fn to_value(self) -> Value {
        Value::Ext(EVENT_TIME_EXT_TYPE, self.to_bytes().to_vec())
    }

    /// Parse from a decoded MessagePack value.
    ///
    /// Peers may send either the extension form or a plain non-negative
    /// integer of epoch seconds; both are accepted.
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Ext(code, data) => {
                if *code != EVENT_TIME_EXT_TYPE {
                    return Err(ProtocolError::Malformed(format!(
                        "event time extension has type {code}, expected {EVENT_TIME_EXT_TYPE}"
                    )));
                }
                let bytes: [u8; EVENT_TIME_SIZE] = data.as_slice().try_into().map_err(|_| {
                    ProtocolError::Malformed(format!(
                        "event time extension has {} bytes, expected {EVENT_TIME_SIZE}",
                        data.len()
                    ))
                })?;
                Ok(Self::from_bytes(bytes))
            }
            Value::Integer(_) => {
                let seconds = value.as_u64().ok_or_else(|| {
                    ProtocolError::Malformed("event time integer is negative".into())
                })?;
                if seconds > u64::from(u32::MAX) {
                    return Err(ProtocolError::Malformed(
                        "event time integer is out of range".into(),
                    ));
                }
                Ok(Self {
                    seconds: seconds as u32,
                    nanos: 0,
                })
            }
            other => Err(ProtocolError::Malformed(format!(
                "event time has unexpected type: {other}"
            ))),
        }
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_bytes() {
        let time = EventTime::from_epoch(1_700_000_000, 123_456_789);
        let decoded = EventTime::from_bytes(time.to_bytes());
        assert_eq!(decoded, time);
    }

    #[test]
    fn test_from_millis() {
        let time = EventTime::from_millis(1_700_000_000_123).unwrap();
        assert_eq!(time.seconds, 1_700_000_000);
        assert_eq!(time.nanos, 123_000_000);
    }

    #[test]
    fn test_from_millis_out_of_range() {
        let ms = (u64::from(u32::MAX) + 1) * 1000;
        assert!(matches!(
            EventTime::from_millis(ms),
            Err(EmitError::DataType(_))
        ));
    }

    #[test]
    fn test_ordering() {
        let a = EventTime::from_epoch(10, 999_999_999);
        let b = EventTime::from_epoch(11, 0);
        let c = EventTime::from_epoch(11, 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_value_ext_roundtrip() {
        let time = EventTime::from_epoch(42, 7);
        let value = time.to_value();
        assert_eq!(EventTime::from_value(&value).unwrap(), time);
    }

    #[test]
    fn test_value_integer_accepted() {
        let value = Value::from(1_700_000_000u64);
        let time = EventTime::from_value(&value).unwrap();
        assert_eq!(time.seconds, 1_700_000_000);
        assert_eq!(time.nanos, 0);
    }

    #[test]
    fn test_value_wrong_ext_type_rejected() {
        let value = Value::Ext(3, vec![0; EVENT_TIME_SIZE]);
        assert!(EventTime::from_value(&value).is_err());
    }

    #[test]
    fn test_value_short_ext_rejected() {
        let value = Value::Ext(EVENT_TIME_EXT_TYPE, vec![0; 4]);
        assert!(EventTime::from_value(&value).is_err());
    }
}
