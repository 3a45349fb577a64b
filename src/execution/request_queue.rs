//! The process-wide request queue.
//!
//! A bounded lock-free MPMC queue shared by every request processor. User
//! threads enqueue, processor tasks dequeue; the only wake guarantee is
//! that a request sitting in the queue is eventually drained by some
//! processor.

use crossbeam_queue::ArrayQueue;

use crate::execution::request_handler::RequestHandler;

pub(crate) struct RequestQueue {
    queue: ArrayQueue<RequestHandler>,
}

impl RequestQueue {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Hands the handler back when the queue is at capacity, so the caller
    /// can fail its future.
    pub(crate) fn enqueue(&self, handler: RequestHandler) -> Result<(), RequestHandler> {
        self.queue.push(handler)
    }

    pub(crate) fn dequeue(&self) -> Option<RequestHandler> {
        self.queue.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Request;

    #[test]
    fn overflow_returns_the_handler() {
        let queue = RequestQueue::with_capacity(2);
        let mut futures = Vec::new();
        for _ in 0..2 {
            let (handler, future) = RequestHandler::new(Request::query("SELECT 1"));
            assert!(queue.enqueue(handler).is_ok());
            futures.push(future);
        }

        let (handler, _future) = RequestHandler::new(Request::query("SELECT 1"));
        assert!(queue.enqueue(handler).is_err());

        assert!(queue.dequeue().is_some());
        let (handler, _future2) = RequestHandler::new(Request::query("SELECT 1"));
        assert!(queue.enqueue(handler).is_ok());
    }

    #[test]
    fn drains_to_empty() {
        let queue = RequestQueue::with_capacity(4);
        assert!(queue.is_empty());
        let (handler, _future) = RequestHandler::new(Request::query("SELECT 1"));
        queue.enqueue(handler).unwrap();
        assert!(!queue.is_empty());
        queue.dequeue().unwrap();
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
    }
}
