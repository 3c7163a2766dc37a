use bytes::{BufMut, Bytes, BytesMut};

use crate::paxos::codec::{Reader, put_bytes};
use crate::paxos::error::{PaxosError, PaxosResult};
use crate::paxos::instance::InstanceState;
use crate::paxos::request::Request;
use crate::paxos::snapshot::Snapshot;
use crate::paxos::{InstanceId, View};

/// Discriminant written as the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageKind {
    Accept = 1,
    Alive = 2,
    Phase1Request = 3,
    Phase1Response = 4,
    Propose = 5,
    CatchUpQuery = 6,
    CatchUpResponse = 7,
    CatchUpSnapshot = 8,
    Recovery = 9,
    RecoveryAnswer = 10,
    ForwardedClientRequests = 11,
}

impl MessageKind {
    pub const ALL: [MessageKind; 11] = [
        MessageKind::Accept,
        MessageKind::Alive,
        MessageKind::Phase1Request,
        MessageKind::Phase1Response,
        MessageKind::Propose,
        MessageKind::CatchUpQuery,
        MessageKind::CatchUpResponse,
        MessageKind::CatchUpSnapshot,
        MessageKind::Recovery,
        MessageKind::RecoveryAnswer,
        MessageKind::ForwardedClientRequests,
    ];

    fn from_tag(tag: u8) -> PaxosResult<Self> {
        MessageKind::ALL
            .into_iter()
            .find(|k| *k as u8 == tag)
            .ok_or_else(|| PaxosError::Malformed(format!("Unknown message kind {}", tag)))
    }
}

/// What an acceptor knows about one instance, reported during phase 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub view: View,
    pub state: InstanceState,
    /// Present unless the state is unknown.
    pub value: Option<Bytes>,
}

/// A decided instance shipped during catch-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecidedRecord {
    pub id: InstanceId,
    pub view: View,
    pub value: Bytes,
}

impl DecidedRecord {
    pub fn encoded_len(&self) -> usize {
        8 + 8 + 4 + self.value.len()
    }
}

/// A protocol message along with the view of its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub view: View,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Asks acceptors for everything they know at or after from_instance.
    Phase1Request { from_instance: InstanceId },

    /// Promise for the message view, with the evidence collected by the acceptor.
    Phase1Response {
        /// Instances below this id were compacted away by the responder.
        lowest_available: InstanceId,
        /// The responder's epoch vector; empty unless the epoch crash model is used.
        epochs: Vec<u64>,
        instances: Vec<InstanceRecord>,
    },

    Propose { instance: InstanceId, value: Bytes },

    Accept { instance: InstanceId, value: Bytes },

    /// Sent periodically by the leader.
    Alive { log_next_id: InstanceId },

    CatchUpQuery {
        from_instance: InstanceId,
        request_time: i64,
    },

    CatchUpResponse {
        request_time: i64,
        last_part: bool,
        instances: Vec<DecidedRecord>,
    },

    CatchUpSnapshot { request_time: i64, snapshot: Snapshot },

    /// Sent by a restarting replica. The message view is the view it recovered.
    Recovery { epoch: u64 },

    RecoveryAnswer {
        epochs: Vec<u64>,
        next_instance: InstanceId,
    },

    ForwardedClientRequests { requests: Vec<Request> },
}

impl Message {
    pub fn new(view: View, payload: Payload) -> Self {
        Message { view, payload }
    }

    pub fn kind(&self) -> MessageKind {
        match &self.payload {
            Payload::Phase1Request { .. } => MessageKind::Phase1Request,
            Payload::Phase1Response { .. } => MessageKind::Phase1Response,
            Payload::Propose { .. } => MessageKind::Propose,
            Payload::Accept { .. } => MessageKind::Accept,
            Payload::Alive { .. } => MessageKind::Alive,
            Payload::CatchUpQuery { .. } => MessageKind::CatchUpQuery,
            Payload::CatchUpResponse { .. } => MessageKind::CatchUpResponse,
            Payload::CatchUpSnapshot { .. } => MessageKind::CatchUpSnapshot,
            Payload::Recovery { .. } => MessageKind::Recovery,
            Payload::RecoveryAnswer { .. } => MessageKind::RecoveryAnswer,
            Payload::ForwardedClientRequests { .. } => MessageKind::ForwardedClientRequests,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.kind() as u8);
        buf.put_u64(self.view);
        match &self.payload {
            Payload::Phase1Request { from_instance } => buf.put_u64(*from_instance),
            Payload::Phase1Response {
                lowest_available,
                epochs,
                instances,
            } => {
                buf.put_u64(*lowest_available);
                put_epochs(&mut buf, epochs);
                buf.put_u32(instances.len() as u32);
                for record in instances {
                    buf.put_u64(record.id);
                    buf.put_u64(record.view);
                    buf.put_u8(record.state.tag());
                    if let Some(value) = &record.value {
                        put_bytes(&mut buf, value);
                    }
                }
            }
            Payload::Propose { instance, value } | Payload::Accept { instance, value } => {
                buf.put_u64(*instance);
                put_bytes(&mut buf, value);
            }
            Payload::Alive { log_next_id } => buf.put_u64(*log_next_id),
            Payload::CatchUpQuery {
                from_instance,
                request_time,
            } => {
                buf.put_u64(*from_instance);
                buf.put_i64(*request_time);
            }
            Payload::CatchUpResponse {
                request_time,
                last_part,
                instances,
            } => {
                buf.put_u8(if *last_part { 1 } else { 0 });
                buf.put_i64(*request_time);
                buf.put_u32(instances.len() as u32);
                for record in instances {
                    buf.put_u64(record.id);
                    buf.put_u64(record.view);
                    put_bytes(&mut buf, &record.value);
                }
            }
            Payload::CatchUpSnapshot {
                request_time,
                snapshot,
            } => {
                buf.put_i64(*request_time);
                snapshot.write_to(&mut buf);
            }
            Payload::Recovery { epoch } => buf.put_u64(*epoch),
            Payload::RecoveryAnswer {
                epochs,
                next_instance,
            } => {
                put_epochs(&mut buf, epochs);
                buf.put_u64(*next_instance);
            }
            Payload::ForwardedClientRequests { requests } => {
                buf.put_u32(requests.len() as u32);
                for request in requests {
                    request.write_to(&mut buf);
                }
            }
        }
        buf.freeze()
    }

    /// Parses a frame produced by encode. Unknown kinds, truncated bodies and
    /// trailing bytes are all rejected.
    pub fn decode(frame: Bytes) -> PaxosResult<Self> {
        let mut r = Reader::new(frame);
        let kind = MessageKind::from_tag(r.u8("message kind")?)?;
        let view = r.u64("view")?;
        let payload = match kind {
            MessageKind::Phase1Request => Payload::Phase1Request {
                from_instance: r.u64("phase 1 request")?,
            },
            MessageKind::Phase1Response => {
                let lowest_available = r.u64("phase 1 response")?;
                let epochs = read_epochs(&mut r)?;
                let count = r.count("phase 1 instances", 17)?;
                let mut instances = Vec::with_capacity(count);
                for _ in 0..count {
                    let id = r.u64("phase 1 instance")?;
                    let view = r.u64("phase 1 instance")?;
                    let state = InstanceState::from_tag(r.u8("phase 1 instance")?)?;
                    let value = match state {
                        InstanceState::Unknown => None,
                        _ => Some(r.bytes("phase 1 value")?),
                    };
                    instances.push(InstanceRecord {
                        id,
                        view,
                        state,
                        value,
                    });
                }
                Payload::Phase1Response {
                    lowest_available,
                    epochs,
                    instances,
                }
            }
            MessageKind::Propose => Payload::Propose {
                instance: r.u64("propose")?,
                value: r.bytes("propose value")?,
            },
            MessageKind::Accept => Payload::Accept {
                instance: r.u64("accept")?,
                value: r.bytes("accept value")?,
            },
            MessageKind::Alive => Payload::Alive {
                log_next_id: r.u64("alive")?,
            },
            MessageKind::CatchUpQuery => Payload::CatchUpQuery {
                from_instance: r.u64("catch-up query")?,
                request_time: r.u64("catch-up query")? as i64,
            },
            MessageKind::CatchUpResponse => {
                let last_part = r.u8("catch-up response")? & 1 == 1;
                let request_time = r.u64("catch-up response")? as i64;
                let count = r.count("catch-up instances", 20)?;
                let mut instances = Vec::with_capacity(count);
                for _ in 0..count {
                    instances.push(DecidedRecord {
                        id: r.u64("catch-up instance")?,
                        view: r.u64("catch-up instance")?,
                        value: r.bytes("catch-up value")?,
                    });
                }
                Payload::CatchUpResponse {
                    request_time,
                    last_part,
                    instances,
                }
            }
            MessageKind::CatchUpSnapshot => {
                let request_time = r.u64("catch-up snapshot")? as i64;
                let snapshot = Snapshot::decode(r.bytes("catch-up snapshot")?)?;
                Payload::CatchUpSnapshot {
                    request_time,
                    snapshot,
                }
            }
            MessageKind::Recovery => Payload::Recovery {
                epoch: r.u64("recovery")?,
            },
            MessageKind::RecoveryAnswer => Payload::RecoveryAnswer {
                epochs: read_epochs(&mut r)?,
                next_instance: r.u64("recovery answer")?,
            },
            MessageKind::ForwardedClientRequests => {
                let count = r.count("forwarded requests", 20)?;
                let mut requests = Vec::with_capacity(count);
                for _ in 0..count {
                    requests.push(Request::read_from(&mut r)?);
                }
                Payload::ForwardedClientRequests { requests }
            }
        };
        r.finish("message")?;
        Ok(Message { view, payload })
    }
}

fn put_epochs(buf: &mut BytesMut, epochs: &[u64]) {
    buf.put_u32(epochs.len() as u32);
    for epoch in epochs {
        buf.put_u64(*epoch);
    }
}

fn read_epochs(r: &mut Reader) -> PaxosResult<Vec<u64>> {
    let count = r.count("epochs", 8)?;
    let mut epochs = Vec::with_capacity(count);
    for _ in 0..count {
        epochs.push(r.u64("epoch")?);
    }
    Ok(epochs)
}
