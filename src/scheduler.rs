//! Centralized keep-alive scheduler (spec.md §4.I).
//!
//! One `BTreeSet`-backed sorted set, plus a `client -> record` index, both
//! under one mutex. A single cooperative task drains due records and
//! dispatches sends/disconnects onto separate tasks so it never blocks on
//! I/O.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct ScheduledClient {
    client: Uuid,
    last_sent: Instant,
    last_received: Instant,
}

impl ScheduledClient {
    fn next_event(&self, interval: Duration, timeout: Duration) -> Instant {
        std::cmp::min(self.last_sent + interval, self.last_received + timeout)
    }
}

/// Order key for the sorted set. `client` breaks ties between records
/// whose `next_event` coincides exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    next_event_nanos: u64,
    client: Uuid,
}

struct Inner {
    index: HashMap<Uuid, ScheduledClient>,
    order: BTreeSet<OrderKey>,
    epoch: Instant,
}

impl Inner {
    fn key_for(&self, record: &ScheduledClient, interval: Duration, timeout: Duration) -> OrderKey {
        OrderKey {
            next_event_nanos: record
                .next_event(interval, timeout)
                .saturating_duration_since(self.epoch)
                .as_nanos() as u64,
            client: record.client,
        }
    }
}

/// What the loop decided to do with a due record.
pub enum DueAction {
    SendKeepAlive,
    Disconnect,
}

/// Keep-alive liveness tracker for every connected client. `interval <
/// timeout` is a hard invariant, enforced at construction.
pub struct KeepAliveScheduler {
    inner: Mutex<Inner>,
    interval: Duration,
    timeout: Duration,
    notify: Notify,
}

impl KeepAliveScheduler {
    pub fn new(interval: Duration, timeout: Duration) -> Arc<Self> {
        assert!(interval < timeout, "interval must be < timeout");
        Arc::new(Self {
            inner: Mutex::new(Inner {
                index: HashMap::new(),
                order: BTreeSet::new(),
                epoch: Instant::now(),
            }),
            interval,
            timeout,
            notify: Notify::new(),
        })
    }

    pub fn register(&self, client: Uuid) {
        let now = Instant::now();
        let record = ScheduledClient {
            client,
            last_sent: now,
            last_received: now,
        };
        let mut inner = self.inner.lock().unwrap();
        let key = inner.key_for(&record, self.interval, self.timeout);
        inner.index.insert(client, record);
        inner.order.insert(key);
        drop(inner);
        self.notify.notify_one();
    }

    pub fn unregister(&self, client: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.index.remove(&client) {
            let key = inner.key_for(&record, self.interval, self.timeout);
            inner.order.remove(&key);
        }
    }

    pub fn update_last_sent(&self, client: Uuid) {
        self.reschedule(client, |record, now| record.last_sent = now);
    }

    pub fn update_last_received(&self, client: Uuid) {
        self.reschedule(client, |record, now| record.last_received = now);
    }

    fn reschedule(&self, client: Uuid, mutate: impl FnOnce(&mut ScheduledClient, Instant)) {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut record) = inner.index.get(&client).copied() else {
            return;
        };
        let old_key = inner.key_for(&record, self.interval, self.timeout);
        inner.order.remove(&old_key);

        mutate(&mut record, Instant::now());
        let new_key = inner.key_for(&record, self.interval, self.timeout);
        inner.index.insert(client, record);
        inner.order.insert(new_key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Jittered resend window used after dispatching a keep-alive, to
    /// avoid thundering-herd synchronization across many idle clients.
    fn jittered_last_sent(&self, now: Instant) -> Instant {
        let jitter_ms = rand::random::<u64>() % 250;
        now + Duration::from_millis(jitter_ms)
    }

    /// Drain every record currently due, dispatching `on_due` for each.
    /// Returns once the minimum is back in the future.
    fn drain_due(&self, on_due: &(dyn Fn(Uuid, DueAction) + Send + Sync)) {
        loop {
            let mut inner = self.inner.lock().unwrap();
            let Some(&min_key) = inner.order.iter().next() else {
                return;
            };
            let now = Instant::now();
            let now_nanos = now.saturating_duration_since(inner.epoch).as_nanos() as u64;
            if min_key.next_event_nanos > now_nanos {
                return;
            }

            inner.order.remove(&min_key);
            let mut record = *inner.index.get(&min_key.client).expect("index/order in sync");

            if now.duration_since(record.last_received) >= self.timeout {
                inner.index.remove(&min_key.client);
                drop(inner);
                on_due(record.client, DueAction::Disconnect);
            } else {
                record.last_sent = self.jittered_last_sent(now);
                let new_key = inner.key_for(&record, self.interval, self.timeout);
                inner.index.insert(record.client, record);
                inner.order.insert(new_key);
                drop(inner);
                on_due(record.client, DueAction::SendKeepAlive);
            }
        }
    }

    /// Spawn the single cooperative scheduling loop. `on_due` is invoked
    /// inline but is expected to dispatch the actual I/O onto its own
    /// task so the loop is never blocked.
    pub fn spawn_loop(
        self: Arc<Self>,
        on_due: Arc<dyn Fn(Uuid, DueAction) + Send + Sync>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let wait_until = {
                    let inner = self.inner.lock().unwrap();
                    inner.order.iter().next().map(|key| {
                        inner.epoch + Duration::from_nanos(key.next_event_nanos)
                    })
                };

                match wait_until {
                    None => tokio::time::sleep(Duration::from_millis(50)).await,
                    Some(at) => {
                        let now = Instant::now();
                        if at > now {
                            tokio::select! {
                                _ = tokio::time::sleep(at - now) => {}
                                _ = self.notify.notified() => continue,
                            }
                        }
                    }
                }

                self.drain_due(on_due.as_ref());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn idle_client_past_timeout_is_disconnected() {
        let scheduler = KeepAliveScheduler::new(Duration::from_millis(30), Duration::from_millis(60));
        let client = Uuid::new_v4();
        scheduler.register(client);

        let disconnects = Arc::new(AtomicUsize::new(0));
        let disconnects2 = disconnects.clone();
        let handle = scheduler.clone().spawn_loop(Arc::new(move |_client, action| {
            if matches!(action, DueAction::Disconnect) {
                disconnects2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.abort();
        assert!(disconnects.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn liveness_updates_prevent_disconnect() {
        let scheduler = KeepAliveScheduler::new(Duration::from_millis(30), Duration::from_millis(80));
        let client = Uuid::new_v4();
        scheduler.register(client);

        let disconnects = Arc::new(AtomicUsize::new(0));
        let disconnects2 = disconnects.clone();
        let sched = scheduler.clone();
        let handle = scheduler.clone().spawn_loop(Arc::new(move |c, action| {
            match action {
                DueAction::Disconnect => {
                    disconnects2.fetch_add(1, Ordering::SeqCst);
                }
                DueAction::SendKeepAlive => {
                    sched.update_last_received(c);
                }
            }
        }));

        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.abort();
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn construction_rejects_interval_not_less_than_timeout() {
        let result = std::panic::catch_unwind(|| {
            KeepAliveScheduler::new(Duration::from_secs(5), Duration::from_secs(5))
        });
        assert!(result.is_err());
    }
}
