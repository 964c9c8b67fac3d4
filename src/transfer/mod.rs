use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::oci::image::Descriptor;

pub mod progress;

use progress::{Progress, ProgressStream};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy)]
enum Event {
    Bytes(u64),
    Done,
    Failed,
}

/// Coalesces concurrent transfers of the same descriptor into a single
/// producer whose progress is multicast to every subscriber.
///
/// The first caller for a descriptor spawns the producer; later callers
/// subscribe to the live channel and may miss earlier progress items, but
/// always observe completion or failure. When the producer fails, the
/// originating subscriber receives the underlying error and joined
/// subscribers receive [`Error::TransferFailed`]. Once every subscriber is
/// dropped the producer is cancelled at its next progress item.
#[derive(Clone)]
pub struct TransferCoordinator {
    in_flight: Arc<Mutex<HashMap<Descriptor, broadcast::Sender<Event>>>>,
}

impl TransferCoordinator {
    pub fn new() -> TransferCoordinator {
        TransferCoordinator {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of transfers currently in flight.
    pub fn len(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.lock().unwrap().is_empty()
    }

    /// Run `producer` for `descriptor`, or join the transfer already running
    /// for it. The producer is invoked at most once while any subscriber is
    /// active.
    pub fn transfer<F>(&self, descriptor: &Descriptor, producer: F) -> ProgressStream
    where
        F: FnOnce() -> ProgressStream + Send + 'static,
    {
        let digest = descriptor.digest.to_string();

        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(sender) = in_flight.get(descriptor) {
            log::debug!("joining in-flight transfer for `{}`", digest);
            let receiver = sender.subscribe();
            return Box::pin(subscription(digest, receiver, None));
        }

        let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
        let failure = Arc::new(Mutex::new(None));
        in_flight.insert(descriptor.clone(), sender.clone());
        drop(in_flight);

        log::debug!("starting transfer for `{}`", digest);
        let in_flight = self.in_flight.clone();
        let descriptor = descriptor.clone();
        let producer_failure = failure.clone();
        tokio::spawn(async move {
            let mut source = producer();
            let mut failed = false;
            while let Some(item) = source.next().await {
                let event = match item {
                    Ok(bytes) => Event::Bytes(bytes),
                    Err(error) => {
                        log::debug!(
                            "transfer for `{}` failed: {}",
                            descriptor.digest,
                            error
                        );
                        *producer_failure.lock().unwrap() = Some(error);
                        failed = true;
                        Event::Failed
                    }
                };
                if sender.send(event).is_err() {
                    // Every subscriber is gone; dropping the source cancels
                    // the underlying transfer.
                    log::debug!(
                        "all subscribers of `{}` are gone, cancelling transfer",
                        descriptor.digest
                    );
                    break;
                }
                if failed {
                    break;
                }
            }
            if !failed {
                let _ = sender.send(Event::Done);
            }
            drop(source);

            in_flight.lock().unwrap().remove(&descriptor);
        });

        Box::pin(subscription(digest, receiver, Some(failure)))
    }
}

impl Default for TransferCoordinator {
    fn default() -> Self {
        TransferCoordinator::new()
    }
}

fn subscription(
    digest: String,
    mut receiver: broadcast::Receiver<Event>,
    failure: Option<Arc<Mutex<Option<Error>>>>,
) -> impl Stream<Item = Result<Progress>> + Send {
    try_stream! {
        loop {
            match receiver.recv().await {
                Ok(Event::Bytes(bytes)) => yield bytes,
                Ok(Event::Done) => break,
                Ok(Event::Failed) => {
                    let error = failure
                        .as_ref()
                        .and_then(|slot| slot.lock().unwrap().take())
                        .unwrap_or_else(|| Error::TransferFailed(digest.clone()));
                    Err(error)?
                }
                // Progress is advisory; a lagged subscriber just resumes.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
