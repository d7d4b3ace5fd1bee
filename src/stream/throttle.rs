//! Rate limiting for frame streams

use futures::Stream;
use futures::ready;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior, interval};

/// Adds [`Throttle`] to every stream
pub trait ThrottleExt: Stream {
    /// Emit at most one item per `duration`
    ///
    /// Items that arrive while waiting replace each other, so a slow
    /// consumer always sees the newest one. Needs a tokio runtime.
    fn throttle(self, duration: Duration) -> Throttle<Self>
    where
        Self: Sized,
    {
        Throttle::new(self, duration)
    }
}

impl<T: Stream> ThrottleExt for T {}

pin_project! {
    /// Latest-wins rate limiter returned by [`ThrottleExt::throttle`]
    pub struct Throttle<S: Stream> {
        #[pin]
        stream: S,
        interval: Interval,
        pending: Option<S::Item>,
        done: bool,
    }
}

impl<S: Stream> Throttle<S> {
    pub fn new(stream: S, duration: Duration) -> Self {
        let mut interval = interval(duration);
        // Don't burst after a quiet period
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { stream, interval, pending: None, done: false }
    }
}

impl<S: Stream> Stream for Throttle<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // Keep only the newest of everything that is ready
        while !*this.done {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => *this.pending = Some(item),
                Poll::Ready(None) => *this.done = true,
                Poll::Pending => break,
            }
        }

        if this.pending.is_none() {
            // Inner stream has registered the waker unless it ended
            return if *this.done { Poll::Ready(None) } else { Poll::Pending };
        }

        ready!(this.interval.poll_tick(cx));
        Poll::Ready(this.pending.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    #[tokio::test(start_paused = true)]
    async fn bursts_collapse_to_latest() {
        let (tx, rx) = mpsc::channel(16);
        let mut throttled = Box::pin(ReceiverStream::new(rx).throttle(Duration::from_millis(100)));

        tx.send(1).await.unwrap();
        assert_eq!(throttled.next().await, Some(1));

        for i in 2..=5 {
            tx.send(i).await.unwrap();
        }
        assert_eq!(throttled.next().await, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_source_does_not_end_the_stream() {
        let (tx, rx) = mpsc::channel(4);
        let mut throttled = Box::pin(ReceiverStream::new(rx).throttle(Duration::from_millis(10)));

        let waited = tokio::time::timeout(Duration::from_millis(50), throttled.next()).await;
        assert!(waited.is_err(), "stream must stay pending while the source is quiet");

        tx.send(7).await.unwrap();
        assert_eq!(throttled.next().await, Some(7));

        drop(tx);
        assert_eq!(throttled.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn last_item_is_flushed_before_end() {
        let (tx, rx) = mpsc::channel(4);
        let mut throttled = Box::pin(ReceiverStream::new(rx).throttle(Duration::from_secs(1)));

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        drop(tx);

        assert_eq!(throttled.next().await, Some(2));
        assert_eq!(throttled.next().await, None);
    }
}
