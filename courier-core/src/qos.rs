//! MQTT quality-of-service levels.

/// Delivery guarantee attached to a subscription or publish.
///
/// A SUBACK reports the granted level as a raw byte; codes outside the three
/// defined levels, notably 0x80 (the SUBACK failure code), map to `Invalid`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
    Invalid = 0xff,
}

impl From<u8> for QoS {
    fn from(code: u8) -> Self {
        match code {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::Invalid,
        }
    }
}
