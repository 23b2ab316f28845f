// FlashLaunch Core - Query Session
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Keystroke-driven querying where only the newest query counts
//!
//! Each submission cancels the dispatch of the one before it. Results are
//! published on a watch channel, and only while the submission is still the
//! latest, so a slow old query can never overwrite a newer one.

use crate::core::query_processor::{DispatchError, QueryDispatcher};
use crate::log_debug;
use crate::plugins::api::SearchResult;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Results of one completed, still-current submission
#[derive(Debug, Clone)]
pub struct QueryUpdate {
    pub sequence: u64,
    pub query: String,
    pub results: Arc<Vec<SearchResult>>,
}

#[derive(Debug, Default)]
struct Latest {
    sequence: u64,
    token: Option<CancellationToken>,
}

pub struct QuerySession {
    dispatcher: Arc<QueryDispatcher>,
    latest: Mutex<Latest>,
    updates: watch::Sender<Option<Arc<QueryUpdate>>>,
}

impl QuerySession {
    pub fn new(dispatcher: Arc<QueryDispatcher>) -> Self {
        let (updates, _) = watch::channel(None);
        Self {
            dispatcher,
            latest: Mutex::new(Latest::default()),
            updates,
        }
    }

    /// Receiver that always holds the latest published update
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<QueryUpdate>>> {
        self.updates.subscribe()
    }

    /// Dispatch `text`, superseding any submission still in flight
    ///
    /// Returns `None` when a newer submission (or [`QuerySession::cancel`])
    /// superseded this one.
    pub async fn search(&self, text: &str) -> Option<Arc<QueryUpdate>> {
        let token = CancellationToken::new();
        let sequence = {
            let mut latest = self.lock();
            if let Some(previous) = latest.token.replace(token.clone()) {
                previous.cancel();
            }
            latest.sequence += 1;
            latest.sequence
        };

        let results = match self.dispatcher.dispatch(text, &token).await {
            Ok(results) => results,
            Err(DispatchError::Cancelled) => {
                log_debug!("Query #{} {:?} superseded", sequence, text);
                return None;
            }
            Err(e) => {
                log_debug!("Query #{} {:?} failed: {}", sequence, text, e);
                return None;
            }
        };

        let latest = self.lock();
        if latest.sequence != sequence {
            log_debug!("Query #{} {:?} finished after being superseded", sequence, text);
            return None;
        }

        let update = Arc::new(QueryUpdate {
            sequence,
            query: text.to_string(),
            results: Arc::new(results),
        });
        self.updates.send_replace(Some(Arc::clone(&update)));
        Some(update)
    }

    /// Cancel whatever is in flight without submitting anything new
    pub fn cancel(&self) {
        let mut latest = self.lock();
        latest.sequence += 1;
        if let Some(token) = latest.token.take() {
            token.cancel();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Latest> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
