// Copyright (C) 2024 Weft, Inc.
//
// Weft is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@weft.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use weft_entities::Entity;

use crate::cursor::CursorUpdate;
use crate::source::{EntitySink, Source, SourceError};

/// Terminal state of the producer task.
#[derive(Debug)]
pub struct ProducerOutcome {
    pub result: Result<(), SourceError>,
    /// Cursor the source published after a complete run.
    pub cursor: Option<CursorUpdate>,
}

/// Bounded read-ahead queue between a source and its consumer.
///
/// The source runs in a dedicated producer task and pushes entities through
/// a fixed-capacity channel; back-pressure is implicit in the capacity. The
/// producer's terminal error is captured and surfaced by [`finish`], not
/// interleaved with entities. Cancelling the stream cancels the producer at
/// its next suspension point and releases any buffered entities.
///
/// [`finish`]: SourceStream::finish
pub struct SourceStream {
    rx: mpsc::Receiver<Entity>,
    outcome_rx: oneshot::Receiver<ProducerOutcome>,
    cancel: CancellationToken,
    producer: JoinHandle<()>,
}

impl SourceStream {
    pub fn spawn(
        mut source: Box<dyn Source>,
        capacity: usize,
        parent_cancel: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let cancel = parent_cancel.child_token();
        let sink = EntitySink::new(tx, cancel.clone());
        let producer = tokio::spawn(async move {
            let result = source.produce(&sink).await;
            let cursor = source.published_cursor();
            debug!(source = %source.name(), ok = result.is_ok(), "source-producer-finished");
            let _ = outcome_tx.send(ProducerOutcome { result, cursor });
        });
        Self {
            rx,
            outcome_rx,
            cancel,
            producer,
        }
    }

    /// Next entity, or `None` once the producer closed the queue.
    pub async fn next_entity(&mut self) -> Option<Entity> {
        self.rx.recv().await
    }

    /// Cancels the producer; buffered entities are dropped by `finish`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the producer task and returns its terminal state.
    pub async fn finish(self) -> ProducerOutcome {
        // Dropping the receiver unblocks a producer stuck on a full queue;
        // it observes `StreamClosed` on its next send.
        drop(self.rx);
        match self.outcome_rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.producer.abort();
                ProducerOutcome {
                    result: Err(SourceError::Cancelled),
                    cursor: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::source::vec_source::VecSource;
    use weft_entities::{Entity, EntityCommon};

    fn base_entity(entity_id: &str) -> Entity {
        Entity::Base {
            common: EntityCommon::new(entity_id, entity_id, "test.entity"),
        }
    }

    #[tokio::test]
    async fn test_stream_forwards_all_entities_then_closes() {
        let source = VecSource::new(vec![base_entity("E1"), base_entity("E2"), base_entity("E3")]);
        let cancel = CancellationToken::new();
        let mut stream = SourceStream::spawn(Box::new(source), 10, &cancel);

        let mut ids = Vec::new();
        while let Some(entity) = stream.next_entity().await {
            ids.push(entity.entity_id().to_string());
        }
        assert_eq!(ids, vec!["E1", "E2", "E3"]);

        let outcome = stream.finish().await;
        assert!(outcome.result.is_ok());
    }

    #[tokio::test]
    async fn test_stream_captures_producer_error() {
        struct FailingSource;

        #[async_trait]
        impl Source for FailingSource {
            fn name(&self) -> String {
                "FailingSource".to_string()
            }

            async fn produce(&mut self, sink: &EntitySink) -> Result<(), SourceError> {
                sink.send(base_entity("E1")).await?;
                Err(SourceError::Api {
                    status: Some(500),
                    message: "upstream exploded".to_string(),
                })
            }
        }

        let cancel = CancellationToken::new();
        let mut stream = SourceStream::spawn(Box::new(FailingSource), 10, &cancel);
        assert!(stream.next_entity().await.is_some());
        assert!(stream.next_entity().await.is_none());
        let outcome = stream.finish().await;
        assert!(matches!(outcome.result, Err(SourceError::Api { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_stops_a_blocked_producer() {
        struct EndlessSource;

        #[async_trait]
        impl Source for EndlessSource {
            fn name(&self) -> String {
                "EndlessSource".to_string()
            }

            async fn produce(&mut self, sink: &EntitySink) -> Result<(), SourceError> {
                let mut i = 0u64;
                loop {
                    sink.send(base_entity(&format!("E{i}"))).await?;
                    i += 1;
                }
            }
        }

        let cancel = CancellationToken::new();
        // Tiny capacity so the producer parks on a full queue.
        let mut stream = SourceStream::spawn(Box::new(EndlessSource), 2, &cancel);
        assert!(stream.next_entity().await.is_some());
        stream.cancel();
        let outcome = stream.finish().await;
        assert!(matches!(
            outcome.result,
            Err(SourceError::Cancelled) | Err(SourceError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_back_pressure_bounds_read_ahead() {
        let entities: Vec<Entity> = (0..100).map(|i| base_entity(&format!("E{i}"))).collect();
        let cancel = CancellationToken::new();
        let mut stream = SourceStream::spawn(Box::new(VecSource::new(entities)), 5, &cancel);
        // Consume slowly; the producer can only ever be 5 ahead, and all 100
        // still arrive.
        let mut count = 0;
        while let Some(_entity) = stream.next_entity().await {
            count += 1;
            tokio::task::yield_now().await;
        }
        assert_eq!(count, 100);
        assert!(stream.finish().await.result.is_ok());
    }
}
