use bytes::Bytes;

use crate::paxos::{StateMachine, StateMachineResult};

// A fake implementation of the StateMachine trait for testing purposes. Every
// reply names the number of requests executed so far, which makes double
// execution visible in replies.
pub struct FakeStateMachine {
    executed: u64,
}

impl FakeStateMachine {
    pub fn new() -> Self {
        FakeStateMachine { executed: 0 }
    }
}

impl StateMachine for FakeStateMachine {
    fn execute(&mut self, request: &Bytes) -> Bytes {
        self.executed += 1;
        Bytes::from(format!(
            "{}:{}",
            self.executed,
            String::from_utf8_lossy(request)
        ))
    }

    fn create_snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.executed.to_be_bytes())
    }

    fn load_snapshot(&mut self, snapshot: &Bytes) -> StateMachineResult {
        let raw: [u8; 8] = snapshot
            .as_ref()
            .try_into()
            .map_err(|_| format!("Expected 8 snapshot bytes, got {}", snapshot.len()))?;
        self.executed = u64::from_be_bytes(raw);
        Ok(())
    }
}
