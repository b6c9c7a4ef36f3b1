//! Test plan types: suites and the shared stream workers pull them from.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, Notify};

/// One suite of tests: a named instrumentation invocation with its
/// parameters and the test vector files it needs on the device.
#[derive(Debug, Clone)]
pub struct TestSuite {
    pub name: String,
    /// `-e key value` pairs passed to the instrumentation runner.
    pub parameters: Vec<(String, String)>,
    /// (local path, remote path) files pushed before the suite runs and
    /// removed afterwards.
    pub uploadables: Vec<(PathBuf, String)>,
    /// Clear the application's data before running this suite.
    pub clear_data: bool,
}

impl TestSuite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            uploadables: Vec::new(),
            clear_data: true,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((key.into(), value.into()));
        self
    }

    pub fn with_uploadable(
        mut self,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
    ) -> Self {
        self.uploadables.push((local_path.into(), remote_path.into()));
        self
    }

    pub fn keep_data(mut self) -> Self {
        self.clear_data = false;
        self
    }
}

struct StreamInner {
    queue: Mutex<VecDeque<TestSuite>>,
    closed: AtomicBool,
    notify: Notify,
    // Serializes pulls so workers never race inside a single pop.
    pull_lock: AsyncMutex<()>,
}

/// Shared source of test suites, consumed by one worker at a time.
///
/// Suites come out in the order they went in; each suite is delivered to
/// exactly one consumer. The stream ends once it is closed and drained.
#[derive(Clone)]
pub struct SuiteStream {
    inner: Arc<StreamInner>,
}

impl SuiteStream {
    /// A pre-filled, already-closed stream over a fixed plan.
    pub fn from_iter<I: IntoIterator<Item = TestSuite>>(suites: I) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                queue: Mutex::new(suites.into_iter().collect()),
                closed: AtomicBool::new(true),
                notify: Notify::new(),
                pull_lock: AsyncMutex::new(()),
            }),
        }
    }

    /// An open stream fed by the returned sender. The stream ends when the
    /// sender is closed or dropped.
    pub fn channel() -> (SuiteSender, Self) {
        let stream = Self {
            inner: Arc::new(StreamInner {
                queue: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
                pull_lock: AsyncMutex::new(()),
            }),
        };
        let sender = SuiteSender {
            inner: Arc::clone(&stream.inner),
        };
        (sender, stream)
    }

    /// True once the stream is closed and every suite has been taken.
    /// Lets a scheduler skip reserving a device for work that is not
    /// there.
    pub fn is_exhausted(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
            && self.inner.queue.lock().expect("suite queue poisoned").is_empty()
    }

    /// Pull the next suite, waiting for one if the stream is open but
    /// empty. Returns `None` once exhausted.
    pub async fn next(&self) -> Option<TestSuite> {
        let _pull = self.inner.pull_lock.lock().await;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before looking at the queue, so a send
            // landing in between cannot slip past unseen.
            notified.as_mut().enable();
            if let Some(suite) = self
                .inner
                .queue
                .lock()
                .expect("suite queue poisoned")
                .pop_front()
            {
                return Some(suite);
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }
}

/// Producer half of [`SuiteStream::channel`].
pub struct SuiteSender {
    inner: Arc<StreamInner>,
}

impl SuiteSender {
    pub fn send(&self, suite: TestSuite) {
        self.inner
            .queue
            .lock()
            .expect("suite queue poisoned")
            .push_back(suite);
        self.inner.notify.notify_waiters();
    }

    /// Mark the plan complete. Consumers drain what remains, then see the
    /// end of the stream.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }
}

impl Drop for SuiteSender {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fixed_plan_yields_in_order_then_ends() {
        let stream = SuiteStream::from_iter([TestSuite::new("a"), TestSuite::new("b")]);
        assert!(!stream.is_exhausted());
        assert_eq!(stream.next().await.unwrap().name, "a");
        assert_eq!(stream.next().await.unwrap().name, "b");
        assert!(stream.is_exhausted());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_plan_is_exhausted_from_the_start() {
        let stream = SuiteStream::from_iter([]);
        assert!(stream.is_exhausted());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn channel_delivers_late_suites_and_end_of_stream() {
        let (sender, stream) = SuiteStream::channel();
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sender.send(TestSuite::new("late"));
            // sender dropped here, closing the stream
        });
        assert_eq!(stream.next().await.unwrap().name, "late");
        assert!(stream.next().await.is_none());
        producer.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_racing_an_empty_queue_check_is_not_lost() {
        // A send landing between the consumer's empty-queue check and its
        // park must still wake it; otherwise the suite sits in the queue
        // until the stream is closed.
        for _ in 0..200 {
            let (sender, stream) = SuiteStream::channel();
            let consumer = tokio::spawn(async move { stream.next().await });
            sender.send(TestSuite::new("racer"));
            let suite = tokio::time::timeout(Duration::from_secs(5), consumer)
                .await
                .expect("consumer missed the send and never woke up")
                .unwrap();
            assert_eq!(suite.unwrap().name, "racer");
            drop(sender);
        }
    }

    #[tokio::test]
    async fn each_suite_goes_to_exactly_one_consumer() {
        let names = ["s1", "s2", "s3", "s4", "s5"];
        let stream = SuiteStream::from_iter(names.iter().map(|n| TestSuite::new(*n)));
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let stream = stream.clone();
            tasks.push(tokio::spawn(async move {
                let mut taken = Vec::new();
                while let Some(suite) = stream.next().await {
                    taken.push(suite.name);
                    tokio::task::yield_now().await;
                }
                taken
            }));
        }
        let mut all: Vec<String> = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        all.sort();
        let expected: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        assert_eq!(all, expected);
    }
}
