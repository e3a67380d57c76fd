//! # Network Stack
//!
//! The local view of network membership: an ordered member list in join
//! order plus a backlog of packets that arrived before membership could be
//! resolved. The last member is the head, the only host that answers
//! bootstrap requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::core::opcode::OpCode;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};

/// Wire form of a [`NetworkStack`], carried as the data of Hello and Sync
/// packets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackSnapshot {
    #[serde(alias = "s")]
    pub members: Vec<String>,
    #[serde(alias = "b", default, deserialize_with = "null_as_empty")]
    pub backlog: Vec<Value>,
}

impl StackSnapshot {
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        Self::deserialize(value).map_err(|e| ProtocolError::InvalidPacket(e.to_string()))
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStack {
    members: Vec<String>,
    backlog: VecDeque<Packet>,
}

impl NetworkStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
            backlog: VecDeque::new(),
        }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn backlog(&self) -> &VecDeque<Packet> {
        &self.backlog
    }

    /// The most recently joined member.
    pub fn head(&self) -> Option<&str> {
        self.members.last().map(String::as_str)
    }

    pub fn is_head(&self, host: &str) -> bool {
        self.head() == Some(host)
    }

    pub fn contains(&self, host: &str) -> bool {
        self.members.iter().any(|m| m == host)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Snapshot for a Hello or Sync payload.
    #[allow(clippy::wrong_self_convention)]
    pub fn into_raw(&self) -> Result<StackSnapshot> {
        let backlog = self
            .backlog
            .iter()
            .map(Packet::to_wire_value)
            .collect::<Result<Vec<_>>>()?;
        Ok(StackSnapshot {
            members: self.members.clone(),
            backlog,
        })
    }

    /// Fold a bootstrap snapshot into this stack.
    ///
    /// Members become the snapshot's members with `local` appended. The
    /// snapshot's backlog is adopted when it has one, otherwise the local
    /// backlog is carried forward.
    pub fn from_data(&mut self, snapshot: StackSnapshot, local: &str) {
        let incoming = decode_backlog(snapshot.backlog);
        self.members = snapshot.members;
        self.push_member(local);
        if !incoming.is_empty() {
            self.backlog = incoming;
        }
    }

    /// Hard replace from a forced sync. The backlog is cleared and `local`
    /// is appended if the snapshot does not already list it.
    pub fn replace(&mut self, snapshot: StackSnapshot, local: &str) {
        self.members = snapshot.members;
        self.backlog.clear();
        self.push_member(local);
    }

    /// Replace the member list and clear the backlog.
    pub fn reset<I, S>(&mut self, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backlog.clear();
        self.members = members.into_iter().map(Into::into).collect();
    }

    /// Drop `host` from the members. Returns whether it was present.
    pub fn remove(&mut self, host: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != host);
        before != self.members.len()
    }

    /// Append `host` unless it is already a member.
    pub fn push_member(&mut self, host: &str) -> bool {
        if self.contains(host) {
            return false;
        }
        self.members.push(host.to_string());
        true
    }

    pub fn queue(&mut self, packet: Packet) {
        self.backlog.push_back(packet);
    }

    /// Apply one backlogged packet to the member list.
    ///
    /// An `Alive` adds its author, a `Dead` removes the host named in its
    /// data. Every other op code leaves the stack alone. Returns whether the
    /// members changed.
    pub fn step(&mut self, packet: &Packet) -> bool {
        match packet.op() {
            OpCode::Alive => self.push_member(packet.author()),
            OpCode::Dead => match packet.data().as_str() {
                Some(host) => self.remove(host),
                None => false,
            },
            _ => false,
        }
    }

    /// Drain the backlog through [`step`](Self::step) in arrival order.
    /// Returns how many packets changed the members.
    pub fn replay_backlog(&mut self) -> usize {
        let backlog = std::mem::take(&mut self.backlog);
        let applied = backlog.iter().filter(|p| self.step(p)).count();
        debug!(
            replayed = backlog.len(),
            applied,
            members = ?self.members,
            "replayed backlog"
        );
        applied
    }
}

fn decode_backlog(entries: Vec<Value>) -> VecDeque<Packet> {
    entries
        .into_iter()
        .filter_map(|entry| match Packet::from_wire_value(entry) {
            Ok(packet) => Some(packet),
            Err(e) => {
                warn!(error = %e, "dropping malformed backlog entry");
                None
            }
        })
        .collect()
}
