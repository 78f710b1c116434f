use bytes::Bytes;
use courier_core::qos::QoS;

/// Will message configuration.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Will {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Parameters for connecting to an MQTT broker.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub(crate) client_id: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) keepalive: u16,
}

impl ConnectionParams {
    /// Create connection parameters for the given client ID and host.
    /// Port and keep-alive receive their default values.
    pub fn new(client_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port: 1883,
            keepalive: 30,
        }
    }

    /// Set the broker port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the keep-alive interval in seconds.
    pub fn keepalive(mut self, seconds: u16) -> Self {
        self.keepalive = seconds;
        self
    }
}
