//! Streamed message completion with an explicit stop signal.
//!
//! Each chunk is appended to the message in the local cache only. When the
//! source ends, one regular update settles the message as complete (or
//! error) through the coordinator's write policy. Stopping halts all further
//! mutation at once, even if the source would keep producing.

use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::coordinator::SyncCoordinator;
use crate::cache::CacheStorage;
use crate::error::SyncResult;
use crate::types::{Message, MessagePatch, MessageStatus};

/// How a stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
  /// Source finished; message settled as complete
  Completed(Message),
  /// Source failed; message settled as error with the content received so far
  Failed { message: Message, reason: String },
  /// Stop was requested; the cache holds `content` and nothing more is written
  Stopped { content: String },
}

/// Cloneable stop signal for a running [`MessageStream`].
#[derive(Debug, Clone)]
pub struct StopHandle {
  tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
  pub fn stop(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_stopped(&self) -> bool {
    *self.tx.borrow()
  }
}

pub struct MessageStream<S: CacheStorage> {
  sync: SyncCoordinator<S>,
  message_id: String,
  stop_tx: Arc<watch::Sender<bool>>,
  stop_rx: watch::Receiver<bool>,
}

impl<S: CacheStorage> MessageStream<S> {
  pub fn new(sync: SyncCoordinator<S>, message_id: impl Into<String>) -> Self {
    let (stop_tx, stop_rx) = watch::channel(false);
    Self {
      sync,
      message_id: message_id.into(),
      stop_tx: Arc::new(stop_tx),
      stop_rx,
    }
  }

  pub fn stop_handle(&self) -> StopHandle {
    StopHandle {
      tx: Arc::clone(&self.stop_tx),
    }
  }

  /// Pump `chunks` into the message until the source ends or stop is requested.
  pub async fn run<St, E>(mut self, chunks: St) -> SyncResult<StreamOutcome>
  where
    St: Stream<Item = Result<String, E>>,
    E: Display,
  {
    let mut content = self.sync.cached_message(&self.message_id)?.content;
    futures::pin_mut!(chunks);

    loop {
      let stopped = *self.stop_rx.borrow();
      if stopped {
        debug!(message_id = %self.message_id, "stream stopped");
        return Ok(StreamOutcome::Stopped { content });
      }

      tokio::select! {
        biased;

        // Sender lives in self, so this only fires on a real stop
        _ = self.stop_rx.changed() => {}

        next = chunks.next() => match next {
          Some(Ok(chunk)) => {
            content.push_str(&chunk);
            self.sync.apply_streamed_content(&self.message_id, &content)?;
          }
          Some(Err(err)) => {
            let reason = err.to_string();
            warn!(message_id = %self.message_id, reason = %reason, "stream failed");
            let message = self.settle(content, MessageStatus::Error).await?;
            return Ok(StreamOutcome::Failed { message, reason });
          }
          None => {
            let message = self.settle(content, MessageStatus::Complete).await?;
            return Ok(StreamOutcome::Completed(message));
          }
        },
      }
    }
  }

  async fn settle(&self, content: String, status: MessageStatus) -> SyncResult<Message> {
    self
      .sync
      .update_message(
        &self.message_id,
        MessagePatch {
          content: Some(content),
          status: Some(status),
          ..MessagePatch::default()
        },
      )
      .await
  }
}
