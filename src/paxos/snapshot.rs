use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::paxos::InstanceId;
use crate::paxos::codec::{Reader, put_bytes};
use crate::paxos::error::PaxosResult;
use crate::paxos::request::{ClientId, Reply};

// Represents the state of the application after executing every instance
// strictly below next_instance_id, along with the last reply produced for
// each client so that duplicate detection survives compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub next_instance_id: InstanceId,
    pub state: Bytes,
    pub last_replies: BTreeMap<ClientId, Reply>,
}

impl Snapshot {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64(self.next_instance_id);
        put_bytes(&mut buf, &self.state);
        buf.put_u32(self.last_replies.len() as u32);
        for reply in self.last_replies.values() {
            reply.write_to(&mut buf);
        }
        buf.freeze()
    }

    pub fn decode(encoded: Bytes) -> PaxosResult<Self> {
        let mut reader = Reader::new(encoded);
        let snapshot = Self::read_from(&mut reader)?;
        reader.finish("snapshot")?;
        Ok(snapshot)
    }

    pub(crate) fn write_to(&self, buf: &mut BytesMut) {
        put_bytes(buf, &self.encode());
    }

    pub(crate) fn read_from(reader: &mut Reader) -> PaxosResult<Self> {
        let next_instance_id = reader.u64("snapshot")?;
        let state = reader.bytes("snapshot state")?;
        let count = reader.count("snapshot replies", 20)?;
        let mut last_replies = BTreeMap::new();
        for _ in 0..count {
            let reply = Reply::read_from(reader)?;
            last_replies.insert(reply.id.client_id, reply);
        }
        Ok(Snapshot {
            next_instance_id,
            state,
            last_replies,
        })
    }

    pub fn size_bytes(&self) -> usize {
        self.state.len()
            + self
                .last_replies
                .values()
                .map(|r| r.value.len() + 20)
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::request::RequestId;

    fn make_snapshot() -> Snapshot {
        let mut last_replies = BTreeMap::new();
        last_replies.insert(7, Reply::new(RequestId::new(7, 3), Bytes::from("ok")));
        last_replies.insert(9, Reply::new(RequestId::new(9, 1), Bytes::new()));
        Snapshot {
            next_instance_id: 42,
            state: Bytes::from("application state"),
            last_replies,
        }
    }

    #[test]
    fn test_encode_decode() {
        let snapshot = make_snapshot();
        let decoded = Snapshot::decode(snapshot.encode()).unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.last_replies[&7].id.sequence, 3);
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = make_snapshot().encode();
        assert!(Snapshot::decode(encoded.slice(0..encoded.len() - 1)).is_err());
    }
}
