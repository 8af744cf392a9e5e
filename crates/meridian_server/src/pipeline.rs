//! Partitioned read/write queues between the sockets and the world.
//!
//! The pipeline owns one read queue and one write queue per I/O partition.
//! A session is pinned to a partition for its whole life, so every frame it
//! reads is handled in arrival order and every frame written to it goes out
//! in submission order. Sessions on different partitions never wait on each
//! other.

use crate::error::SessionError;
use crate::session::{ConnectionSession, DisconnectReason};
use meridian_core::{
    hex_preview, join_all_within, opcodes, DispatchError, ExchangeReply, Frame, PartitionId,
    QueueWorker, SerialQueue,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Receives decrypted inbound frames on the read worker of their partition.
///
/// Routing must be quick: implementations hand the frame to the next layer
/// (world or entity queues) rather than doing the work inline.
pub trait FrameRouter: Send + Sync {
    fn route(&self, session: &Arc<ConnectionSession>, frame: Frame) -> Result<(), DispatchError>;

    /// Called once per session after it disconnected, on the read worker of
    /// its partition and behind every frame it sent before.
    fn on_disconnect(&self, _session: &Arc<ConnectionSession>) {}
}

/// Work chained behind a write; it runs only once that write has completed.
pub enum Followup {
    /// Write another frame right after
    Send(Frame),
    /// Close the session once the frame is on the wire
    Close(DisconnectReason),
    /// Run arbitrary code on the write worker
    Run(Box<dyn FnOnce() + Send + 'static>),
}

impl std::fmt::Debug for Followup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Followup::Send(frame) => write!(f, "Followup::Send({:#06x})", frame.type_code),
            Followup::Close(reason) => write!(f, "Followup::Close({reason})"),
            Followup::Run(_) => f.write_str("Followup::Run"),
        }
    }
}

struct Partition {
    read: SerialQueue,
    write: SerialQueue,
}

/// N read queues plus N write queues, each drained by a single worker.
pub struct PacketPipeline {
    partitions: Vec<Partition>,
    workers: Mutex<Vec<QueueWorker>>,
}

impl PacketPipeline {
    /// Spawns the `2 * partitions` workers on the current runtime.
    pub fn start(partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let mut workers = Vec::with_capacity(partitions * 2);
        let partitions = (0..partitions)
            .map(|i| {
                let (read, read_worker) = SerialQueue::spawn(format!("read-p{i}"));
                let (write, write_worker) = SerialQueue::spawn(format!("write-p{i}"));
                workers.push(read_worker);
                workers.push(write_worker);
                Partition { read, write }
            })
            .collect::<Vec<_>>();

        info!("📦 Packet pipeline started with {} partition(s)", partitions.len());
        Self { partitions, workers: Mutex::new(workers) }
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    fn partition(&self, id: PartitionId) -> &Partition {
        &self.partitions[id.0 % self.partitions.len()]
    }

    /// Queues an inbound frame for decryption and routing.
    ///
    /// Frames are opened in arrival order, so the inbound cipher counter
    /// always matches the peer's. A key exchange frame on an established
    /// session is refused only after it was opened, leaving the cipher where
    /// the peer expects it.
    ///
    /// # Arguments
    ///
    /// * `session` - Session the frame was read from
    /// * `frame` - Frame as it came off the wire
    /// * `router` - Where the decrypted frame goes next
    ///
    /// # Returns
    ///
    /// `QueueClosed` once the pipeline is shutting down.
    pub fn enqueue_read(
        &self,
        session: &Arc<ConnectionSession>,
        frame: Frame,
        router: Arc<dyn FrameRouter>,
    ) -> Result<(), DispatchError> {
        let session = session.clone();
        self.partition(session.partition()).read.run(async move {
            let type_code = frame.type_code;
            let raw = frame.payload.clone();
            let frame = match session.open(frame) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(
                        session = %session.id(),
                        type_code,
                        bytes = %hex_preview(&raw, 64),
                        "Protocol fault: {}", e
                    );
                    session.close(DisconnectReason::Protocol(e.to_string()));
                    return Ok(());
                }
            };
            if matches!(type_code, opcodes::EXCHANGE_OFFER | opcodes::EXCHANGE_REPLY) {
                reject_exchange(&session, &frame);
                return Ok(());
            }
            router.route(&session, frame)
        })
    }

    /// Queues the router's disconnect hook behind the session's pending reads.
    ///
    /// Falls back to calling the hook inline when the read queue is closed.
    pub fn enqueue_disconnect(&self, session: &Arc<ConnectionSession>, router: Arc<dyn FrameRouter>) {
        let queued = {
            let session = session.clone();
            let router = router.clone();
            self.partition(session.partition()).read.run(async move {
                router.on_disconnect(&session);
                Ok(())
            })
        };
        if queued.is_err() {
            trace!(session = %session.id(), "Read queue closed, running disconnect hook inline");
            router.on_disconnect(session);
        }
    }

    /// Queues an outbound frame, optionally chaining a follow-up.
    ///
    /// # Arguments
    ///
    /// * `session` - Destination session
    /// * `frame` - Plaintext frame, sealed on the write worker
    /// * `followup` - Work that must wait until `frame` is on the wire
    ///
    /// # Returns
    ///
    /// `QueueClosed` once the pipeline is shutting down. Write failures are
    /// reported by the queued job and close the session.
    pub fn enqueue_write(
        &self,
        session: &Arc<ConnectionSession>,
        frame: Frame,
        followup: Option<Followup>,
    ) -> Result<(), DispatchError> {
        let session = session.clone();
        self.partition(session.partition()).write.run(async move {
            write_or_close(&session, &frame).await?;
            match followup {
                None => {}
                Some(Followup::Send(next)) => write_or_close(&session, &next).await?,
                Some(Followup::Close(reason)) => {
                    session.close(reason);
                    session.shutdown_writer().await;
                }
                Some(Followup::Run(work)) => work(),
            }
            Ok(())
        })
    }

    /// Closes the session's write side after everything already queued for it
    /// has been written.
    pub fn enqueue_finish(&self, session: &Arc<ConnectionSession>) -> Result<(), DispatchError> {
        let session = session.clone();
        self.partition(session.partition()).write.run(async move {
            session.shutdown_writer().await;
            trace!(session = %session.id(), "Writer finished");
            Ok(())
        })
    }

    /// Stops accepting work and waits for every partition worker to drain.
    pub async fn shutdown(&self, grace: Duration) {
        for partition in &self.partitions {
            partition.read.close();
            partition.write.close();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        let busy = join_all_within(workers, grace).await;
        if busy > 0 {
            warn!("{} pipeline worker(s) still busy after {:?}", busy, grace);
        } else {
            debug!("Packet pipeline drained");
        }
    }
}

/// Refuses a key exchange on an established session. The installed ciphers
/// stay as they are and the session keeps running.
fn reject_exchange(session: &ConnectionSession, frame: &Frame) {
    let result = ExchangeReply::decode(&frame.payload)
        .map_err(SessionError::from)
        .and_then(|reply| session.complete_exchange(&reply));
    if let Err(e) = result {
        warn!(
            session = %session.id(),
            type_code = frame.type_code,
            "Rejected key exchange on established session: {}", e
        );
    }
}

async fn write_or_close(session: &ConnectionSession, frame: &Frame) -> Result<(), DispatchError> {
    match session.write_frame(frame).await {
        Ok(()) => Ok(()),
        Err(SessionError::Closed) => {
            trace!(session = %session.id(), "Dropping write to closed session");
            Ok(())
        }
        Err(SessionError::Frame(e)) => {
            warn!(
                session = %session.id(),
                type_code = frame.type_code,
                "Dropping outbound frame: {}", e
            );
            Err(DispatchError::Transport(format!("frame to {} not sent: {}", session.id(), e)))
        }
        Err(e) => {
            session.close(DisconnectReason::Transport(e.to_string()));
            Err(DispatchError::Transport(format!("write to {} failed: {}", session.id(), e)))
        }
    }
}
