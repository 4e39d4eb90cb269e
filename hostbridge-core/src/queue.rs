//! Bounded command queue between the network side and the host tick.
//!
//! Producers never block: a full queue is reported immediately so the
//! connection can answer `ServerBusy`. Only the dispatcher consumes.

use crate::command::Command;
use crate::error::QueueError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

/// Creates a queue holding at most `capacity` commands.
pub fn command_queue(capacity: usize) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (
        CommandSender {
            tx,
            depth: depth.clone(),
            capacity,
        },
        CommandReceiver { rx, depth },
    )
}

/// Producer handle, cloned into every connection.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Command>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

impl CommandSender {
    pub fn try_enqueue(&self, command: Command) -> Result<(), QueueError> {
        // Count before sending so the consumer never observes a negative depth
        self.depth.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                match e {
                    TrySendError::Full(cmd) => Err(QueueError::Backpressure(cmd)),
                    TrySendError::Closed(cmd) => Err(QueueError::Closed(cmd)),
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer handle, owned by the dispatcher.
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::Receiver<Command>,
    depth: Arc<AtomicUsize>,
}

impl CommandReceiver {
    /// Pops the oldest command without waiting.
    pub fn try_dequeue(&mut self) -> Option<Command> {
        match self.rx.try_recv() {
            Ok(cmd) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                Some(cmd)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Stops accepting new commands. Already queued ones can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RequestId;
    use chrono::Utc;
    use hostbridge_protocol::{CommandKind, CommandPayload};
    use serde_json::json;

    fn cmd(n: u64) -> Command {
        Command {
            id: RequestId::new(n),
            client_id: json!(n),
            kind: CommandKind::QueryState,
            payload: CommandPayload::Empty,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_fifo_order() {
        let (tx, mut rx) = command_queue(8);
        for n in 1..=5 {
            tx.try_enqueue(cmd(n)).unwrap();
        }
        assert_eq!(tx.depth(), 5);

        let order: Vec<u64> = std::iter::from_fn(|| rx.try_dequeue())
            .map(|c| c.id.as_u64())
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
        assert_eq!(rx.depth(), 0);
    }

    #[test]
    fn test_full_queue_returns_command() {
        let (tx, _rx) = command_queue(2);
        tx.try_enqueue(cmd(1)).unwrap();
        tx.try_enqueue(cmd(2)).unwrap();

        let err = tx.try_enqueue(cmd(3)).unwrap_err();
        assert!(matches!(err, QueueError::Backpressure(_)));
        assert_eq!(err.into_command().id, RequestId::new(3));
        assert_eq!(tx.depth(), 2);
    }

    #[test]
    fn test_closed_queue() {
        let (tx, mut rx) = command_queue(4);
        tx.try_enqueue(cmd(1)).unwrap();
        rx.close();

        let err = tx.try_enqueue(cmd(2)).unwrap_err();
        assert!(matches!(err, QueueError::Closed(_)));

        // Already queued commands survive the close
        assert_eq!(rx.try_dequeue().map(|c| c.id), Some(RequestId::new(1)));
        assert!(rx.try_dequeue().is_none());
    }

    #[test]
    fn test_empty_dequeue() {
        let (_tx, mut rx) = command_queue(1);
        assert!(rx.try_dequeue().is_none());
    }
}
