//! Streaming variant of the pipeline.
//!
//! Fragments are buffered and released a sentence at a time, and only
//! while the whole text so far passes the same evaluation as a complete
//! response. After the first sentence that would block, nothing more is
//! forwarded, though the provider stream is still read to the end. The
//! unforwarded tail goes out only when the final verdict allows the text
//! unmodified. The final [`StreamEvent::Done`] carries the delivered text
//! that supersedes the chunks. Cancelling the token (or dropping the
//! receiver) stops consuming the provider stream.

use super::{
    AiRequest, AiResponse, Admission, PipelineState, RequestFailure, RequestRun,
    SafetyOrchestrator,
};
use crate::audit::Outcome;
use crate::errors::GatewayError;
use crate::providers::TokenStream;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(String),
    Done(Box<AiResponse>),
    Error(Box<RequestFailure>),
}

enum Consumed {
    Finished(Buffered),
    Failed(anyhow::Error),
    Cancelled,
}

/// Provider text read so far and how much of it the caller has seen.
#[derive(Debug, Default)]
struct Buffered {
    raw: String,
    forwarded: usize,
    withheld: bool,
}

impl Buffered {
    fn unforwarded(&self) -> &str {
        &self.raw[self.forwarded..]
    }
}

impl SafetyOrchestrator {
    /// Start a streaming run. Events arrive on the returned receiver; the
    /// last one is always `Done` or `Error` unless the run was cancelled.
    pub fn process_stream(
        self: &Arc<Self>,
        request: AiRequest,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_stream(request, tx, cancel).await;
        });
        rx
    }

    async fn run_stream(
        &self,
        request: AiRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) {
        let mut run = match self.admit(request).await {
            Admission::Proceed(run) => *run,
            Admission::Finished(response) => {
                let _ = tx.send(StreamEvent::Done(Box::new(response))).await;
                return;
            }
            Admission::Rejected(failure) => {
                let _ = tx.send(StreamEvent::Error(failure)).await;
                return;
            }
        };

        let completion_request = self.completion_request(&run);
        let deadline = Instant::now() + self.provider_timeout();
        let timed_out = || -> anyhow::Error {
            GatewayError::Timeout {
                after_secs: self.provider_timeout().as_secs(),
            }
            .into()
        };

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            opened = tokio::time::timeout_at(deadline, self.provider.stream(&completion_request)) => {
                Some(opened.unwrap_or_else(|_| Err(timed_out())))
            }
        };
        let tokens = match opened {
            None => {
                self.cancel_run(run).await;
                return;
            }
            Some(Ok(tokens)) => tokens,
            Some(Err(err)) => return self.finish_failed(run, err, &tx).await,
        };

        let screen = |prefix: &str| {
            let evaluation = self.evaluate(&run, prefix, 0);
            if evaluation.is_blocked() {
                tracing::warn!(
                    request_id = %run.request_id,
                    task = run.task(),
                    reasons = ?evaluation.block_reasons,
                    "Stream withheld at unsafe text"
                );
            }
            !evaluation.is_blocked()
        };
        let consumed = consume(tokens, &tx, &cancel, deadline, screen).await;

        match consumed {
            Consumed::Cancelled => {
                self.cancel_run(run).await;
            }
            Consumed::Failed(err) if err.is::<tokio::time::error::Elapsed>() => {
                self.finish_failed(run, timed_out(), &tx).await;
            }
            Consumed::Failed(err) => self.finish_failed(run, err, &tx).await,
            Consumed::Finished(buffered) if buffered.raw.trim().is_empty() => {
                let err = GatewayError::Provider("provider stream produced no text".into());
                self.finish_failed(run, err.into(), &tx).await;
            }
            Consumed::Finished(buffered) => {
                run.enter(PipelineState::ProviderCalled);
                let model = completion_request.model.clone();
                let response = self
                    .complete_run(run, buffered.raw.trim().to_string(), model)
                    .await;
                let tail = buffered.unforwarded();
                let release_tail = !buffered.withheld
                    && !tail.is_empty()
                    && response.metadata.outcome == Outcome::Allowed
                    && !response.metadata.was_modified;
                if release_tail && tx.send(StreamEvent::Chunk(tail.to_string())).await.is_err() {
                    return;
                }
                let _ = tx.send(StreamEvent::Done(Box::new(response))).await;
            }
        }
    }

    async fn finish_failed(
        &self,
        run: RequestRun,
        err: anyhow::Error,
        tx: &mpsc::Sender<StreamEvent>,
    ) {
        let event = match self.fail_run(run, err).await {
            Ok(stale) => StreamEvent::Done(Box::new(stale)),
            Err(failure) => StreamEvent::Error(Box::new(failure)),
        };
        let _ = tx.send(event).await;
    }
}

/// Byte offset just past the last complete sentence in `text[from..]`.
fn sentence_end(text: &str, from: usize) -> Option<usize> {
    let mut end = None;
    let mut after_terminal = false;
    for (i, ch) in text[from..].char_indices() {
        if ch == '\n' || (after_terminal && ch.is_whitespace()) {
            end = Some(from + i + ch.len_utf8());
        }
        after_terminal = matches!(ch, '.' | '!' | '?');
    }
    end
}

/// Read fragments until the provider finishes, fails, the deadline
/// passes, or the caller goes away. Complete sentences are forwarded
/// while `screen` accepts the text up to them.
async fn consume(
    mut tokens: TokenStream,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    deadline: Instant,
    screen: impl Fn(&str) -> bool,
) -> Consumed {
    let mut buffered = Buffered::default();
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Consumed::Cancelled,
            next = tokio::time::timeout_at(deadline, tokens.next()) => next,
        };
        match next {
            Err(elapsed) => return Consumed::Failed(elapsed.into()),
            Ok(None) => return Consumed::Finished(buffered),
            Ok(Some(Err(err))) => return Consumed::Failed(err),
            Ok(Some(Ok(chunk))) => {
                buffered.raw.push_str(&chunk);
                if chunk.is_empty() || buffered.withheld {
                    continue;
                }
                let Some(end) = sentence_end(&buffered.raw, buffered.forwarded) else {
                    continue;
                };
                if !screen(&buffered.raw[..end]) {
                    buffered.withheld = true;
                    continue;
                }
                let sentence = buffered.raw[buffered.forwarded..end].to_string();
                buffered.forwarded = end;
                if tx.send(StreamEvent::Chunk(sentence)).await.is_err() {
                    return Consumed::Cancelled;
                }
            }
        }
    }
}
