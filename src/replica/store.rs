use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::paxos::{StateMachine, StateMachineResult};

const OK: &str = "OK";
const NOT_FOUND: &str = "NOT_FOUND";

// A key-value store where both the key and the value type are just bytes,
// backed by an ordered map so that snapshots come out the same on every
// replica.
pub struct MapStore {
    data: BTreeMap<Bytes, Bytes>,
}

// A parsed text command.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Set(Bytes, Bytes),
    Get(Bytes),
}

impl MapStore {
    pub fn new() -> Self {
        MapStore {
            data: BTreeMap::new(),
        }
    }

    // Commands look like "set <key> <value>" or "get <key>". Values may
    // contain spaces.
    fn parse(payload: &Bytes) -> Result<Command, String> {
        let text =
            std::str::from_utf8(payload).map_err(|e| format!("Command is not utf-8: {}", e))?;
        let mut parts = text.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("set"), Some(key), Some(value)) => Ok(Command::Set(
                Bytes::copy_from_slice(key.as_bytes()),
                Bytes::copy_from_slice(value.as_bytes()),
            )),
            (Some("get"), Some(key), None) => Ok(Command::Get(Bytes::copy_from_slice(key.as_bytes()))),
            _ => Err(format!("Unrecognized command: {}", text)),
        }
    }

    pub fn get(&self, key: &Bytes) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    pub fn set(&mut self, key: Bytes, value: Bytes) {
        self.data.insert(key, value);
    }
}

impl StateMachine for MapStore {
    fn execute(&mut self, request: &Bytes) -> Bytes {
        match MapStore::parse(request) {
            Ok(Command::Set(key, value)) => {
                self.set(key, value);
                Bytes::from_static(OK.as_bytes())
            }
            Ok(Command::Get(key)) => self
                .get(&key)
                .unwrap_or_else(|| Bytes::from_static(NOT_FOUND.as_bytes())),
            Err(message) => Bytes::from(format!("ERR {}", message)),
        }
    }

    fn create_snapshot(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.data.len() as u32);
        for (k, v) in &self.data {
            buf.put_u32(k.len() as u32);
            buf.put_slice(k);
            buf.put_u32(v.len() as u32);
            buf.put_slice(v);
        }
        buf.freeze()
    }

    fn load_snapshot(&mut self, snapshot: &Bytes) -> StateMachineResult {
        let mut buf = snapshot.clone();
        let count = read_u32(&mut buf)?;
        let mut data = BTreeMap::new();
        for _ in 0..count {
            let key = read_bytes(&mut buf)?;
            let value = read_bytes(&mut buf)?;
            data.insert(key, value);
        }
        if buf.has_remaining() {
            return Err(format!("{} trailing snapshot bytes", buf.remaining()));
        }
        self.data = data;
        Ok(())
    }
}

fn read_u32(buf: &mut Bytes) -> Result<u32, String> {
    if buf.remaining() < 4 {
        return Err("Truncated snapshot".to_string());
    }
    Ok(buf.get_u32())
}

fn read_bytes(buf: &mut Bytes) -> Result<Bytes, String> {
    let len = read_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err("Truncated snapshot entry".to_string());
    }
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_store_get_set() {
        let mut store = MapStore::new();

        let k = Bytes::from("some-key");
        assert!(store.get(&k).is_none());

        let v1 = Bytes::from("value1");
        store.set(k.clone(), v1.clone());
        assert_eq!(v1, store.get(&k).unwrap());
    }

    #[test]
    fn test_execute_commands() {
        let mut store = MapStore::new();
        assert_eq!(store.execute(&Bytes::from("get k")), Bytes::from(NOT_FOUND));
        assert_eq!(store.execute(&Bytes::from("set k hello world")), Bytes::from(OK));
        assert_eq!(store.execute(&Bytes::from("get k")), Bytes::from("hello world"));
    }

    #[test]
    fn test_execute_malformed() {
        let mut store = MapStore::new();
        let reply = store.execute(&Bytes::from("delete k"));
        assert!(reply.starts_with(b"ERR"));
        let reply = store.execute(&Bytes::from_static(&[0xff, 0xfe]));
        assert!(reply.starts_with(b"ERR"));
    }

    #[test]
    fn test_map_store_snapshot() {
        let k1 = Bytes::from("key1");
        let v1 = Bytes::from("value1");
        let k2 = Bytes::from("key2");
        let v2 = Bytes::from("value2");

        let mut store = MapStore::new();
        store.set(k1.clone(), v1.clone());
        let snap = store.create_snapshot();

        let mut other_store = MapStore::new();
        other_store.set(k2.clone(), v2.clone());

        // Check that the value present in the snapshot is not in the store.
        assert!(other_store.get(&k1).is_none());

        other_store
            .load_snapshot(&snap)
            .expect("load should succeed");
        assert_eq!(other_store.get(&k1).unwrap(), v1);
        assert!(other_store.get(&k2).is_none());
    }

    #[test]
    fn test_truncated_snapshot() {
        let mut store = MapStore::new();
        store.set(Bytes::from("k"), Bytes::from("v"));
        let snap = store.create_snapshot();
        assert!(MapStore::new().load_snapshot(&snap.slice(0..snap.len() - 1)).is_err());
    }
}
