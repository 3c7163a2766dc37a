use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::paxos::codec::{Reader, put_bytes};
use crate::paxos::error::PaxosResult;

pub type ClientId = u64;
pub type SequenceNumber = u64;

// Fixed part of an encoded request or reply: client id, sequence, length.
const HEADER_BYTES: usize = 8 + 8 + 4;

// Identifies one command of one client. Commands of the same client are
// ordered by their sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId {
    pub client_id: ClientId,
    pub sequence: SequenceNumber,
}

impl RequestId {
    pub fn new(client_id: ClientId, sequence: SequenceNumber) -> Self {
        RequestId {
            client_id,
            sequence,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.sequence)
    }
}

// A client command, opaque to the replication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub value: Bytes,
}

impl Request {
    pub fn new(client_id: ClientId, sequence: SequenceNumber, value: Bytes) -> Self {
        Request {
            id: RequestId::new(client_id, sequence),
            value,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_BYTES + self.value.len()
    }

    pub(crate) fn write_to(&self, buf: &mut BytesMut) {
        write_tagged(buf, &self.id, &self.value);
    }

    pub(crate) fn read_from(reader: &mut Reader) -> PaxosResult<Self> {
        let (id, value) = read_tagged(reader, "request")?;
        Ok(Request { id, value })
    }
}

// The outcome of executing a request, as cached per client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub id: RequestId,
    pub value: Bytes,
}

impl Reply {
    pub fn new(id: RequestId, value: Bytes) -> Self {
        Reply { id, value }
    }

    pub(crate) fn write_to(&self, buf: &mut BytesMut) {
        write_tagged(buf, &self.id, &self.value);
    }

    pub(crate) fn read_from(reader: &mut Reader) -> PaxosResult<Self> {
        let (id, value) = read_tagged(reader, "reply")?;
        Ok(Reply { id, value })
    }
}

// Packs the supplied requests into a single consensus value. The empty batch
// doubles as the no-op value used to fill holes in the log.
pub fn encode_batch(requests: &[Request]) -> Bytes {
    let size = 4 + requests.iter().map(Request::encoded_len).sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u32(requests.len() as u32);
    for request in requests {
        request.write_to(&mut buf);
    }
    buf.freeze()
}

pub fn decode_batch(value: &Bytes) -> PaxosResult<Vec<Request>> {
    let mut reader = Reader::new(value.clone());
    let count = reader.count("batch", HEADER_BYTES)?;
    let mut requests = Vec::with_capacity(count);
    for _ in 0..count {
        requests.push(Request::read_from(&mut reader)?);
    }
    reader.finish("batch")?;
    Ok(requests)
}

pub fn noop() -> Bytes {
    encode_batch(&[])
}

fn write_tagged(buf: &mut BytesMut, id: &RequestId, value: &Bytes) {
    buf.put_u64(id.client_id);
    buf.put_u64(id.sequence);
    put_bytes(buf, value);
}

fn read_tagged(reader: &mut Reader, what: &str) -> PaxosResult<(RequestId, Bytes)> {
    let client_id = reader.u64(what)?;
    let sequence = reader.u64(what)?;
    let value = reader.bytes(what)?;
    Ok((RequestId::new(client_id, sequence), value))
}
