use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::core::{Payload, lock};

trait Rule<T>: Send {
    fn first(&mut self) -> T;
    fn next(&mut self, last: &T) -> T;
}

struct Stateless<T> {
    first: Box<dyn FnMut() -> T + Send>,
    rule: Box<dyn FnMut(&T) -> T + Send>,
}

impl<T> Rule<T> for Stateless<T> {
    fn first(&mut self) -> T {
        (self.first)()
    }

    fn next(&mut self, last: &T) -> T {
        (self.rule)(last)
    }
}

struct Stateful<S, T> {
    state: S,
    first: Box<dyn FnMut(&mut S) -> T + Send>,
    rule: Box<dyn FnMut(&mut S, &T) -> T + Send>,
}

impl<S: Send, T> Rule<T> for Stateful<S, T> {
    fn first(&mut self) -> T {
        (self.first)(&mut self.state)
    }

    fn next(&mut self, last: &T) -> T {
        (self.rule)(&mut self.state, last)
    }
}

struct Cursor<T> {
    last: Option<T>,
    rule: Box<dyn Rule<T>>,
}

impl<T: Payload> Cursor<T> {
    fn value(&mut self) -> T {
        match &self.last {
            Some(last) => last.clone(),
            None => {
                let first = self.rule.first();
                self.last = Some(first.clone());
                first
            }
        }
    }

    fn advance(&mut self) -> T {
        let last = self.value();
        let next = self.rule.next(&last);
        self.last = Some(next.clone());
        next
    }
}

/// A lazy, pull-based and possibly infinite sequence.
///
/// Nothing is computed until the first pull. Clones share the same cursor,
/// and pulls are serialized, so a generation rule never runs concurrently
/// with itself and any state it carries is only touched from inside it.
///
/// ```rust
/// use goalforge::Chain;
///
/// let powers = Chain::iterate(1u64, |n| n * 2);
/// assert_eq!(powers.take(4), vec![2, 4, 8, 16]);
/// ```
pub struct Chain<T> {
    cursor: Arc<Mutex<Cursor<T>>>,
}

impl<T> Clone for Chain<T> {
    fn clone(&self) -> Self {
        Self {
            cursor: Arc::clone(&self.cursor),
        }
    }
}

impl<T: Payload> Chain<T> {
    fn with_rule(rule: impl Rule<T> + 'static) -> Self {
        Self {
            cursor: Arc::new(Mutex::new(Cursor {
                last: None,
                rule: Box::new(rule),
            })),
        }
    }

    /// Starts at `seed`, each element is `rule` applied to the previous one.
    pub fn iterate<F>(seed: T, rule: F) -> Self
    where
        F: FnMut(&T) -> T + Send + 'static,
    {
        Self::with_rule(Stateless {
            first: Box::new(move || seed.clone()),
            rule: Box::new(rule),
        })
    }

    /// Like [`Chain::iterate`] with a lazily computed first element.
    pub fn from_fn<F, R>(first: F, rule: R) -> Self
    where
        F: FnMut() -> T + Send + 'static,
        R: FnMut(&T) -> T + Send + 'static,
    {
        Self::with_rule(Stateless {
            first: Box::new(first),
            rule: Box::new(rule),
        })
    }

    /// A chain owning external state, which only `first` and `rule` can
    /// read or write.
    pub fn stateful<S, F, R>(state: S, first: F, rule: R) -> Self
    where
        S: Send + 'static,
        F: FnMut(&mut S) -> T + Send + 'static,
        R: FnMut(&mut S, &T) -> T + Send + 'static,
    {
        Self::with_rule(Stateful {
            state,
            first: Box::new(first),
            rule: Box::new(rule),
        })
    }

    /// The last produced element, producing the first one if needed.
    pub fn value(&self) -> T {
        lock(&self.cursor).value()
    }

    /// Advances by one element and returns it.
    pub fn next(&self) -> T {
        lock(&self.cursor).advance()
    }

    /// Advances by `n` elements in one go. No other caller can interleave.
    pub fn take(&self, n: usize) -> Vec<T> {
        let mut cursor = lock(&self.cursor);
        (0..n).map(|_| cursor.advance()).collect()
    }

    /// Launches a producer thread pulling elements into a bounded buffer.
    ///
    /// The producer stops at the next element boundary once the stream is
    /// cancelled or dropped.
    pub fn produce(self, buffer: usize) -> std::io::Result<ChainStream<T>> {
        let (sender, receiver) = sync_channel(buffer);
        let cancelled = Arc::new(AtomicBool::new(false));

        let handle = std::thread::Builder::new()
            .name("chain-producer".into())
            .spawn({
                let cancelled = Arc::clone(&cancelled);
                move || pump(self, sender, cancelled)
            })?;

        Ok(ChainStream {
            receiver: Some(receiver),
            cancelled,
            handle: Some(handle),
        })
    }
}

fn pump<T: Payload>(chain: Chain<T>, sender: SyncSender<T>, cancelled: Arc<AtomicBool>) {
    let mut produced = 0usize;

    while !cancelled.load(Ordering::Acquire) {
        let next = chain.next();
        if sender.send(next).is_err() {
            break;
        }
        produced += 1;
    }

    tracing::trace!(produced, "chain producer stopped");
}

impl<T: Payload + std::fmt::Debug> std::fmt::Debug for Chain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("last", &lock(&self.cursor).last)
            .finish()
    }
}

/// Elements continuously produced from a [`Chain`].
pub struct ChainStream<T> {
    receiver: Option<Receiver<T>>,
    cancelled: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl<T> ChainStream<T> {
    /// Waits at most `timeout` for the next element.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        let receiver = self.receiver.as_ref()?;
        match receiver.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Stops the producer and waits for it to exit. An element being
    /// generated is finished first, then discarded.
    pub fn cancel(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn stop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        self.receiver = None;
    }
}

impl<T> Iterator for ChainStream<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl<T> Drop for ChainStream<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn counter() -> Chain<u64> {
        Chain::stateful(
            0u64,
            |count| *count,
            |count, _| {
                *count += 1;
                *count
            },
        )
    }

    #[test]
    fn test_stateful_counter() {
        let chain = counter();
        assert_eq!(chain.next(), 1);
        assert_eq!(chain.next(), 2);
        assert_eq!(chain.next(), 3);
        assert_eq!(chain.value(), 3);
    }

    #[test]
    fn test_value_lazy() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let chain = Chain::from_fn(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                10
            },
            |n| n + 1,
        );

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(chain.value(), 10);
        assert_eq!(chain.value(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(chain.next(), 11);
    }

    #[test]
    fn test_iterate() {
        let chain = Chain::iterate(String::from("a"), |s| format!("{s}a"));
        assert_eq!(chain.value(), "a");
        assert_eq!(chain.take(2), vec!["aa", "aaa"]);
    }

    #[test]
    fn test_concurrent_pulls() {
        let chain = counter();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let chain = chain.clone();
                std::thread::spawn(move || (0..250).map(|_| chain.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(seen.insert(value), "duplicated {value}");
            }
        }

        assert_eq!(seen.len(), 2000);
        assert_eq!(seen.iter().copied().min(), Some(1));
        assert_eq!(seen.iter().copied().max(), Some(2000));
    }

    #[test]
    fn test_produce() {
        let stream = counter().produce(4).unwrap();
        let values: Vec<u64> = stream.take(5).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_cancel_stops_producer() {
        let chain = counter();
        let stream = chain.clone().produce(2).unwrap();

        assert_eq!(stream.recv_timeout(Duration::from_secs(5)), Some(1));
        stream.cancel();

        let stopped = chain.value();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(chain.value(), stopped);
    }
}
