use core::pin::Pin;
use core::task::{Context, Poll};
use std::time::Duration;

use cdc_config::shared::BatchConfig;
use futures::future::BoxFuture;
use futures::{Future, FutureExt, Stream, ready};
use pin_project_lite::pin_project;
use tracing::info;

use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};

// Batching adapted from tokio-stream's `chunks_timeout`, with shutdown awareness added.
pin_project! {
    /// Groups the items of a stream into batches.
    ///
    /// A batch is emitted when it reaches `max_size` items or when `max_fill_ms` elapsed since
    /// the batch was started, whichever comes first. When shutdown is requested the buffered items
    /// are emitted as [`ShutdownResult::Shutdown`] and the stream ends.
    #[must_use = "streams do nothing unless polled"]
    pub struct BatchStream<S: Stream> {
        #[pin]
        stream: S,
        #[pin]
        deadline: Option<tokio::time::Sleep>,
        shutdown: BoxFuture<'static, ()>,
        items: Vec<S::Item>,
        batch_config: BatchConfig,
        finished: bool,
    }
}

impl<S: Stream> BatchStream<S> {
    pub fn wrap(stream: S, batch_config: BatchConfig, mut shutdown_rx: ShutdownRx) -> Self {
        // Resolves on the first shutdown request, or never if the sender is gone.
        let shutdown = async move {
            if shutdown_rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
        .boxed();

        BatchStream {
            stream,
            deadline: None,
            shutdown,
            items: Vec::with_capacity(batch_config.max_size),
            batch_config,
            finished: false,
        }
    }
}

impl<S: Stream> Stream for BatchStream<S> {
    type Item = ShutdownResult<Vec<S::Item>, Vec<S::Item>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.finished {
            return Poll::Ready(None);
        }

        loop {
            // Shutdown wins over everything else, buffered items are handed back for flushing.
            if this.shutdown.as_mut().poll(cx).is_ready() {
                info!(
                    buffered_items = this.items.len(),
                    "batch stream stopped by shutdown"
                );

                *this.finished = true;

                return Poll::Ready(Some(ShutdownResult::Shutdown(std::mem::take(this.items))));
            }

            match this.stream.as_mut().poll_next(cx) {
                Poll::Pending => break,
                Poll::Ready(Some(item)) => {
                    if this.items.is_empty() {
                        // The fill window starts with the first item of a batch.
                        this.deadline.set(Some(tokio::time::sleep(Duration::from_millis(
                            this.batch_config.max_fill_ms,
                        ))));
                    }

                    this.items.push(item);

                    if this.items.len() >= this.batch_config.max_size {
                        return Poll::Ready(Some(ShutdownResult::Ok(std::mem::take(this.items))));
                    }
                }
                Poll::Ready(None) => {
                    *this.finished = true;

                    if this.items.is_empty() {
                        return Poll::Ready(None);
                    }

                    return Poll::Ready(Some(ShutdownResult::Ok(std::mem::take(this.items))));
                }
            }
        }

        if !this.items.is_empty()
            && let Some(deadline) = this.deadline.as_pin_mut()
        {
            ready!(deadline.poll(cx));

            return Poll::Ready(Some(ShutdownResult::Ok(std::mem::take(this.items))));
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use futures::StreamExt;
    use std::pin::pin;
    use tokio::sync::mpsc;

    fn batch_config(max_size: usize, max_fill_ms: u64) -> BatchConfig {
        BatchConfig {
            max_size,
            max_fill_ms,
        }
    }

    fn channel_stream(mut rx: mpsc::UnboundedReceiver<u32>) -> impl Stream<Item = u32> {
        futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
    }

    #[tokio::test]
    async fn emits_full_batches_immediately() {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let stream = futures::stream::iter(1..=5);
        let mut batches = pin!(BatchStream::wrap(
            stream,
            batch_config(2, 60_000),
            shutdown_rx
        ));

        assert_eq!(batches.next().await, Some(ShutdownResult::Ok(vec![1, 2])));
        assert_eq!(batches.next().await, Some(ShutdownResult::Ok(vec![3, 4])));
        assert_eq!(batches.next().await, Some(ShutdownResult::Ok(vec![5])));
        assert_eq!(batches.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn emits_partial_batch_after_fill_timeout() {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut batches = pin!(BatchStream::wrap(
            channel_stream(rx),
            batch_config(100, 500),
            shutdown_rx
        ));

        tx.send(7).unwrap();
        tx.send(8).unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(batches.next().await, Some(ShutdownResult::Ok(vec![7, 8])));
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn shutdown_returns_buffered_items_and_ends() {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut batches = pin!(BatchStream::wrap(
            channel_stream(rx),
            batch_config(100, 60_000),
            shutdown_rx
        ));

        tx.send(1).unwrap();
        assert!(futures::poll!(batches.next()).is_pending());

        shutdown_tx.shutdown().unwrap();

        let first = batches.next().await;
        let second = batches.next().await;
        assert_eq!(first, Some(ShutdownResult::Shutdown(vec![1])));
        assert_eq!(second, None);
    }
}
