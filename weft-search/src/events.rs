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

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::response::SearchResponse;

/// Typed progress events streamed to the caller while a search runs.
///
/// `thinking` carries the model's reasoning between steps, `searching`
/// reports an executed query with its timing, `done` carries the final
/// response, and `error` a failure. The `type` tag is the discriminator on
/// the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchEvent {
    Thinking {
        iteration: usize,
        text: String,
    },
    Searching {
        iteration: usize,
        result_count: usize,
        duration_ms: u64,
    },
    Done {
        response: SearchResponse,
    },
    Error {
        message: String,
    },
}

/// Fans events out to an optional channel; absent a channel, emission is a
/// no-op so library callers pay nothing.
#[derive(Clone, Default)]
pub struct EventEmitter {
    tx: Option<mpsc::UnboundedSender<SearchEvent>>,
}

impl EventEmitter {
    pub fn no_op() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SearchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Emits one event. A dropped receiver is fine; events are progress
    /// reporting, never control flow.
    pub fn emit(&self, event: SearchEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
