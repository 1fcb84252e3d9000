use crate::protocol::Frame;
use std::fmt;
use std::sync::Arc;

/// Broker-assigned message identifier, unique within one broker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A published frame on its way to subscribers.
///
/// The frame is shared so fan-out to many subscribers does not copy headers
/// or body.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub frame: Arc<Frame>,
}

impl Message {
    pub fn new(id: MessageId, frame: Frame) -> Self {
        Self {
            id,
            frame: Arc::new(frame),
        }
    }
}
