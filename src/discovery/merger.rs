//! Fan-in of several discovery streams into one
//!
//! Every still-active stream has one outstanding "next value" request. The
//! first request to resolve wins the race; its stream is re-armed and the
//! value is yielded. A stream that reports completion leaves the active set.
//! No deduplication happens here.

use futures::stream::{FusedStream, FuturesUnordered, Stream, StreamExt, StreamFuture};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Stream returned by [`merge`]
#[must_use = "streams do nothing unless polled"]
pub struct Merge<S> {
    active: FuturesUnordered<StreamFuture<S>>,
    finished: bool,
}

/// Merge `streams` by arrival time.
///
/// Output is a permutation of everything the inputs produce. Each input's
/// own order is preserved; nothing is promised across inputs.
pub fn merge<S>(streams: impl IntoIterator<Item = S>) -> Merge<S>
where
    S: Stream + Unpin,
{
    let active: FuturesUnordered<_> = streams.into_iter().map(StreamExt::into_future).collect();
    Merge {
        active,
        finished: false,
    }
}

impl<S> Merge<S> {
    /// Number of inputs that have not completed yet
    pub fn active_len(&self) -> usize {
        self.active.len()
    }
}

impl<S> Stream for Merge<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            match self.active.poll_next_unpin(cx) {
                Poll::Ready(Some((Some(item), rest))) => {
                    self.active.push(rest.into_future());
                    return Poll::Ready(Some(item));
                }
                // Completed input: drop it without yielding for this turn
                Poll::Ready(Some((None, _))) => continue,
                Poll::Ready(None) => {
                    self.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.finished {
            (0, Some(0))
        } else {
            (0, None)
        }
    }
}

impl<S> FusedStream for Merge<S>
where
    S: Stream + Unpin,
{
    fn is_terminated(&self) -> bool {
        self.finished
    }
}
