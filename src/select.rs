//! Racing two futures.
//!
//! [`select`] polls two futures on the same task and resolves with whichever
//! finishes first. The loser is dropped, which is how a bridge wait is
//! abandoned when its deadline fires.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Which side of a [`select`] finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Either<A, B> {
    Left(A),
    Right(B),
}

/// Future returned by [`select`].
pub struct Select2<F1, F2> {
    future1: Option<F1>,
    future2: Option<F2>,
}

impl<F1, F2> Future for Select2<F1, F2>
where
    F1: Future + Unpin,
    F2: Future + Unpin,
{
    type Output = Either<F1::Output, F2::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(f1) = self.future1.as_mut() {
            if let Poll::Ready(result) = Pin::new(f1).poll(cx) {
                self.future1 = None;
                self.future2 = None;
                return Poll::Ready(Either::Left(result));
            }
        }

        if let Some(f2) = self.future2.as_mut() {
            if let Poll::Ready(result) = Pin::new(f2).poll(cx) {
                self.future1 = None;
                self.future2 = None;
                return Poll::Ready(Either::Right(result));
            }
        }

        Poll::Pending
    }
}

/// Poll both futures and return the output of the first to complete.
///
/// The left future is polled first, so it wins a tie.
pub fn select<F1, F2>(future1: F1, future2: F2) -> Select2<F1, F2>
where
    F1: Future + Unpin,
    F2: Future + Unpin,
{
    Select2 {
        future1: Some(future1),
        future2: Some(future2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn ready_left_wins_tie() {
        let out = block_on(select(Box::pin(async { 1 }), Box::pin(async { "two" })));
        assert_eq!(out, Either::Left(1));
    }

    #[test]
    fn pending_left_loses() {
        let out = block_on(select(
            Box::pin(futures::future::pending::<u8>()),
            Box::pin(async { "two" }),
        ));
        assert_eq!(out, Either::Right("two"));
    }
}
