use bytes::Bytes;

pub type StateMachineResult = Result<(), String>;

// The application replicated by the cluster. Every replica executes the same
// decided requests in the same order, so implementations must be
// deterministic.
pub trait StateMachine {
    // Executes the supplied request payload and returns the reply payload.
    // Failures of the command itself are part of the reply.
    fn execute(&mut self, request: &Bytes) -> Bytes;

    fn create_snapshot(&self) -> Bytes;

    // Replaces the entire state with the contents of a snapshot produced by
    // create_snapshot, possibly on another replica.
    fn load_snapshot(&mut self, snapshot: &Bytes) -> StateMachineResult;
}
