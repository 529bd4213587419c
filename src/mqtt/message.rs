use std::fmt;

/// Delivery guarantee of a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    pub fn level(self) -> u8 {
        match self {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }

    /// Whether the broker sends an acknowledgement the publisher has to wait for
    pub fn is_acknowledged(self) -> bool {
        !matches!(self, QosLevel::AtMostOnce)
    }
}

impl TryFrom<u8> for QosLevel {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(other),
        }
    }
}

impl From<QosLevel> for rumqttc::QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// One message on its way to the broker. Transient, never stored.
#[derive(Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
    pub retain: bool,
}

impl PublishRequest {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, qos: QosLevel) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain: false,
        }
    }

    /// UTF-8 text message (status, info, warning)
    pub fn text(topic: impl Into<String>, body: &str) -> Self {
        Self::new(topic, body.as_bytes().to_vec(), QosLevel::AtLeastOnce)
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

// Payloads can be megabytes of image data, so Debug only shows the length
impl fmt::Debug for PublishRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishRequest")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("qos", &self.qos)
            .field("retain", &self.retain)
            .finish()
    }
}

impl fmt::Display for PublishRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes, QoS {})",
            self.topic,
            self.payload.len(),
            self.qos.level()
        )
    }
}
