//! Live feed of cell state changes.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

use super::cell_state::CellState;
use crate::graph::CellId;

/// One cell entering one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub cell: CellId,
    pub state: CellState,
}

/// A subscriber's view of state changes.
///
/// Starts with one entry per registered cell describing its current state,
/// followed by every change made after subscribing. History before the
/// subscription is not replayed. The feed is unbounded: a slow reader never
/// loses changes.
pub struct StateSubscription {
    rx: UnboundedReceiver<StateChange>,
}

impl StateSubscription {
    pub(crate) fn new(rx: UnboundedReceiver<StateChange>) -> Self {
        Self { rx }
    }

    /// Wait for the next change. `None` once the scheduler is gone.
    pub async fn next_change(&mut self) -> Option<StateChange> {
        self.rx.recv().await
    }

    /// Take the next change if one is already waiting.
    pub fn try_next(&mut self) -> Option<StateChange> {
        self.rx.try_recv().ok()
    }

    /// Take every change currently waiting.
    pub fn drain(&mut self) -> Vec<StateChange> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

impl Stream for StateSubscription {
    type Item = StateChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
