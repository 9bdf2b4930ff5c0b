use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::BlockCache;
use crate::error::GridFsError;
use crate::fs::file_map::{BlockKey, FileInfo};
use crate::fs::future::CompletionCell;
use crate::Result;

/// Completion handle of a queued delete or flush request.
pub type DeleteCompletion = Arc<CompletionCell<Result<()>>>;

enum DeleteRequest {
    Delete { file: FileInfo, done: DeleteCompletion },
    Flush { done: DeleteCompletion },
    Stop,
}

/// Background worker erasing all blocks of removed files.
///
/// A single consumer drains a FIFO queue, so deletions of one store are
/// strictly serialized. Requests queued behind a graceful stop are still
/// processed; a hard cancel lets the in-flight request finish its cleanup
/// and resolves everything still queued as cancelled.
pub(crate) struct AsyncDeleteWorker {
    sender: mpsc::UnboundedSender<DeleteRequest>,
    cancelled: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncDeleteWorker {
    pub(crate) fn start<C: BlockCache>(cache: Arc<C>, batch_size: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(Self::run(cache, receiver, batch_size, Arc::clone(&cancelled)));

        AsyncDeleteWorker {
            sender,
            cancelled,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue removal of all blocks of `file`.
    pub(crate) fn delete_async(&self, file: &FileInfo) -> DeleteCompletion {
        let done: DeleteCompletion = Arc::new(CompletionCell::new());

        if !file.is_file() {
            debug!("cannot delete content of a non-data entry: {}", file.id());
            done.complete(Ok(()));
            return done;
        }

        let request = DeleteRequest::Delete {
            file: file.clone(),
            done: Arc::clone(&done),
        };

        if self.sender.send(request).is_err() {
            done.complete(Err(GridFsError::Cancelled(
                "delete worker is stopped".to_string(),
            )));
        }

        done
    }

    /// Completes once every previously queued deletion has been processed.
    pub(crate) fn flush(&self) -> DeleteCompletion {
        let done: DeleteCompletion = Arc::new(CompletionCell::new());

        let request = DeleteRequest::Flush {
            done: Arc::clone(&done),
        };

        if self.sender.send(request).is_err() {
            done.complete(Err(GridFsError::Cancelled(
                "delete worker is stopped".to_string(),
            )));
        }

        done
    }

    /// Stop the worker. A graceful stop first drains requests queued so far,
    /// a cancel only finishes the request already being processed.
    pub(crate) fn stop(&self, cancel: bool) {
        if cancel {
            self.cancelled.store(true, Ordering::SeqCst);
        }

        let _ = self.sender.send(DeleteRequest::Stop);
    }

    pub(crate) async fn join(&self) {
        let handle = self.handle.lock().unwrap().take();

        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run<C: BlockCache>(
        cache: Arc<C>,
        mut receiver: mpsc::UnboundedReceiver<DeleteRequest>,
        batch_size: usize,
        cancelled: Arc<AtomicBool>,
    ) {
        while let Some(request) = receiver.recv().await {
            match request {
                DeleteRequest::Stop => break,
                DeleteRequest::Flush { done } => {
                    done.complete(Ok(()));
                }
                DeleteRequest::Delete { file, done } => {
                    if let Err(e) = Self::delete_file_blocks(&*cache, &file, batch_size).await {
                        error!("failed to remove file contents [file_id={}]: {e:?}", file.id());
                    }

                    done.complete(Ok(()));
                }
            }

            if cancelled.load(Ordering::SeqCst) {
                break;
            }
        }

        debug!("stopping asynchronous file delete worker");

        receiver.close();

        while let Ok(request) = receiver.try_recv() {
            match request {
                DeleteRequest::Delete { done, .. } | DeleteRequest::Flush { done } => {
                    done.complete(Err(GridFsError::Cancelled(
                        "delete worker stopped before request was processed".to_string(),
                    )));
                }
                DeleteRequest::Stop => {}
            }
        }
    }

    /// Remove the live key variant of every block, plus the non-colocated
    /// twin wherever the live variant is colocated.
    async fn delete_file_blocks<C: BlockCache>(
        cache: &C,
        file: &FileInfo,
        batch_size: usize,
    ) -> Result<()> {
        let block_size = file.block_size() as u64;

        let mut keys = Vec::with_capacity(batch_size);

        for block in 0..file.blocks_count() {
            let affinity_key = file
                .affinity_key()
                .or_else(|| file.file_map().affinity_key(block * block_size, true));

            keys.push(BlockKey::new(
                file.id(),
                affinity_key,
                file.evict_exclude(),
                block,
            ));

            if affinity_key.is_some() {
                keys.push(BlockKey::new(file.id(), None, file.evict_exclude(), block));
            }

            if keys.len() >= batch_size {
                cache.remove_keys(std::mem::take(&mut keys)).await?;
            }
        }

        if !keys.is_empty() {
            cache.remove_keys(keys).await?;
        }

        Ok(())
    }
}
