//! The rendezvous primitive behind the local server.
//!
//! A `Pool` is either a bounded FIFO of values or a single parked consumer,
//! never both. Producers hand values straight to the parked consumer when
//! one exists; consumers either drain the buffer or park themselves. The
//! suspension happens here, at the pool, never at the connection, which is
//! what lets the handler long-poll `/next` and a test client block on
//! `/invoke` on the same reactor without deadlocking.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;

const POOL_CAPACITY: usize = 64;

/// Producers outran the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolFull;

#[derive(Debug)]
enum PoolState<T> {
    Buffer(VecDeque<T>),
    Waiter(oneshot::Sender<T>),
}

#[derive(Debug)]
pub(crate) struct Pool<T> {
    state: Mutex<PoolState<T>>,
}

impl<T: Send> Pool<T> {
    pub(crate) fn new() -> Pool<T> {
        Pool {
            state: Mutex::new(PoolState::Buffer(VecDeque::new())),
        }
    }

    /// Hand `value` to the parked consumer, or buffer it.
    pub(crate) fn push(&self, value: T) -> Result<(), PoolFull> {
        let mut state = self.state.lock().expect("pool lock");
        if matches!(&*state, PoolState::Waiter(_)) {
            let PoolState::Waiter(waiter) =
                std::mem::replace(&mut *state, PoolState::Buffer(VecDeque::new()))
            else {
                unreachable!()
            };
            if let Err(value) = waiter.send(value) {
                // the consumer went away between parking and delivery
                let PoolState::Buffer(buffer) = &mut *state else {
                    unreachable!()
                };
                buffer.push_back(value);
            }
            return Ok(());
        }
        let PoolState::Buffer(buffer) = &mut *state else {
            unreachable!()
        };
        if buffer.len() >= POOL_CAPACITY {
            return Err(PoolFull);
        }
        buffer.push_back(value);
        Ok(())
    }

    /// Take the oldest buffered value, or park until a producer arrives.
    ///
    /// At most one consumer may wait at a time; a second concurrent `next`
    /// is a programming error and panics.
    pub(crate) async fn next(&self) -> T {
        let receiver = {
            let mut state = self.state.lock().expect("pool lock");
            // a waiter whose receiver was dropped mid-wait is stale and may
            // be replaced
            let stale = matches!(&*state, PoolState::Waiter(waiter) if waiter.is_closed());
            if stale {
                let (sender, receiver) = oneshot::channel();
                *state = PoolState::Waiter(sender);
                receiver
            } else {
                match &mut *state {
                    PoolState::Buffer(buffer) => {
                        if let Some(value) = buffer.pop_front() {
                            return value;
                        }
                        let (sender, receiver) = oneshot::channel();
                        *state = PoolState::Waiter(sender);
                        receiver
                    }
                    PoolState::Waiter(_) => {
                        panic!("concurrent next() calls on the same pool")
                    }
                }
            }
        };
        receiver.await.expect("pool dropped with a parked consumer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn buffered_values_drain_in_order() {
        let pool = Pool::new();
        pool.push(1).unwrap();
        pool.push(2).unwrap();
        assert_eq!(pool.next().await, 1);
        assert_eq!(pool.next().await, 2);
    }

    #[tokio::test]
    async fn a_parked_consumer_receives_the_next_push() {
        let pool = Arc::new(Pool::new());
        let consumer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.next().await })
        };
        // let the consumer park itself first
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.push(7u32).unwrap();
        assert_eq!(consumer.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let pool = Pool::new();
        for i in 0..POOL_CAPACITY {
            pool.push(i).unwrap();
        }
        assert_eq!(pool.push(POOL_CAPACITY), Err(PoolFull));
    }

    #[tokio::test]
    async fn a_second_concurrent_consumer_panics() {
        let pool: Arc<Pool<u32>> = Arc::new(Pool::new());
        let first = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.next().await })
        };
        let err = second.await.unwrap_err();
        assert!(err.is_panic());
        first.abort();
    }

    #[tokio::test]
    async fn an_abandoned_wait_does_not_poison_the_pool() {
        let pool: Arc<Pool<u32>> = Arc::new(Pool::new());
        let abandoned = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        abandoned.abort();
        let _ = abandoned.await;

        let consumer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.push(9).unwrap();
        assert_eq!(consumer.await.unwrap(), 9);
    }
}
