//! Pieces shared by the lookup engines: candidate confirmation, the result
//! stream handed to callers, and id paging.

use crate::{
    check::CheckEngine,
    error::{EngineError, Result},
    models::{EntityRef, LookupPage, PageRequest, SubjectRef},
    scope::RequestScope,
    snapshot::SnapshotToken,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;

pub(crate) type Sink = mpsc::Sender<Result<String>>;

/// A candidate id and the check that decides whether it is emitted.
pub(crate) struct Candidate {
    pub id: String,
    pub entity: EntityRef,
    pub subject: SubjectRef,
}

/// Confirms candidates with a forward check and emits the allowed ids.
/// Returns `false` once the consumer has gone away.
pub(crate) async fn confirm(
    scope: &RequestScope,
    permission: &str,
    candidates: Vec<Candidate>,
    sink: &Sink,
) -> Result<bool> {
    if candidates.is_empty() {
        return Ok(true);
    }

    let checker = CheckEngine::new(scope);
    let mut decisions = stream::iter(candidates.into_iter().map(move |candidate| async move {
        let decision = checker
            .run(candidate.entity, permission, candidate.subject)
            .await?;
        Ok::<_, EngineError>((candidate.id, decision))
    }))
    .buffer_unordered(scope.fan_out_limit());

    while let Some(result) = decisions.next().await {
        let (id, decision) = result?;
        if decision.is_allowed() && sink.send(Ok(id)).await.is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Lazily produced lookup results.
///
/// Ids arrive in no particular order and each at most once. An error ends
/// the stream. Dropping the stream cancels the lookup.
pub struct LookupStream {
    inner: ReceiverStream<Result<String>>,
    snapshot: SnapshotToken,
    _guard: DropGuard,
}

impl LookupStream {
    pub(crate) fn new(
        receiver: mpsc::Receiver<Result<String>>,
        snapshot: SnapshotToken,
        guard: DropGuard,
    ) -> Self {
        Self {
            inner: ReceiverStream::new(receiver),
            snapshot,
            _guard: guard,
        }
    }

    /// The snapshot every read of the lookup was pinned to.
    pub fn snapshot(&self) -> SnapshotToken {
        self.snapshot
    }

    /// Drain the stream into a sorted list of ids.
    ///
    /// # Errors
    ///
    /// Returns the first error the lookup produced.
    pub async fn collect_sorted(mut self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        while let Some(id) = self.next().await {
            ids.push(id?);
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}

impl Stream for LookupStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

pub(crate) fn encode_continuation(last_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(last_id.as_bytes())
}

pub(crate) fn decode_continuation(marker: &str) -> Result<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(marker)
        .map_err(|e| EngineError::InvalidContinuation(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| EngineError::InvalidContinuation(e.to_string()))
}

/// Cut one page out of a sorted, deduplicated id list.
pub(crate) fn paginate(
    sorted_ids: Vec<String>,
    page: &PageRequest,
    snapshot: SnapshotToken,
) -> Result<LookupPage> {
    if page.page_size == 0 {
        return Err(EngineError::InvalidContinuation(
            "page size must be greater than zero".to_string(),
        ));
    }

    let after = page
        .continuation
        .as_deref()
        .map(decode_continuation)
        .transpose()?;

    let mut remaining = sorted_ids
        .into_iter()
        .filter(|id| after.as_ref().map_or(true, |after| id > after))
        .peekable();

    let ids: Vec<String> = remaining.by_ref().take(page.page_size).collect();
    let continuation = match (remaining.peek(), ids.last()) {
        (Some(_), Some(last)) => Some(encode_continuation(last)),
        _ => None,
    };

    Ok(LookupPage {
        ids,
        continuation,
        snapshot,
    })
}
