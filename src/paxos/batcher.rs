use std::collections::{HashSet, VecDeque};

use bytes::Bytes;

use crate::paxos::request::{self, Request, RequestId};

// Queues client requests at the leader and packs them into batches, each of
// which becomes the value of one consensus instance.
pub struct Batcher {
    queue: VecDeque<Request>,
    queued: HashSet<RequestId>,
    max_batch_bytes: usize,
}

impl Batcher {
    pub fn new(max_batch_bytes: usize) -> Self {
        Batcher {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            max_batch_bytes,
        }
    }

    // Adds a request to the queue. Returns false if the same request is
    // already waiting, e.g., because its client retried.
    pub fn enqueue(&mut self, request: Request) -> bool {
        if !self.queued.insert(request.id) {
            return false;
        }
        self.queue.push_back(request);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    // Removes as many requests from the front of the queue as fit into one
    // batch and returns the encoded batch. A request larger than the limit
    // still goes out, alone.
    pub fn next_batch(&mut self) -> Option<Bytes> {
        let mut batch = Vec::new();
        let mut size = 4;
        while let Some(front) = self.queue.front() {
            let len = front.encoded_len();
            if !batch.is_empty() && size + len > self.max_batch_bytes {
                break;
            }
            size += len;
            if let Some(request) = self.queue.pop_front() {
                self.queued.remove(&request.id);
                batch.push(request);
            }
        }
        if batch.is_empty() {
            return None;
        }
        Some(request::encode_batch(&batch))
    }

    // Empties the queue, e.g., to hand its contents to a new leader.
    pub fn drain(&mut self) -> Vec<Request> {
        self.queued.clear();
        self.queue.drain(..).collect()
    }
}
