use crate::error::{ProtocolError, Result};
use std::fmt;

/// Op codes used for network communication.
///
/// The numeric values are part of the wire format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpCode {
    /// Sending a heartbeat out into the network.
    Heartbeat = 0,
    /// A host is alive on the network and wants to join it.
    Alive = 1,
    /// A host is leaving the network.
    Dead = 2,
    /// Generic application data.
    Data = 3,
    /// Acknowledgement of a previously sent packet (echoes its seq).
    Ack = 4,
    /// Bootstrap response carrying the network stack.
    Hello = 5,
    /// Forced network stack synchronisation.
    Sync = 6,
}

impl OpCode {
    /// Every op code, in wire order.
    pub const ALL: [OpCode; 7] = [
        OpCode::Heartbeat,
        OpCode::Alive,
        OpCode::Dead,
        OpCode::Data,
        OpCode::Ack,
        OpCode::Hello,
        OpCode::Sync,
    ];

    /// Wire value of this op code
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Heartbeat => "Heartbeat",
            OpCode::Alive => "Alive",
            OpCode::Dead => "Dead",
            OpCode::Data => "Data",
            OpCode::Ack => "Ack",
            OpCode::Hello => "Hello",
            OpCode::Sync => "Sync",
        }
    }
}

impl TryFrom<i64> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self> {
        OpCode::ALL
            .iter()
            .copied()
            .find(|op| op.code() == value)
            .ok_or(ProtocolError::InvalidOpCode(value))
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
