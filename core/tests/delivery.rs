//! Delivery guarantees of `DelayQueue` with real time and many consumers.

use delayq_core::{
    CancelSignal, Deadline, DelayQueue, Drain, PushOptions, Queue, QueueError,
};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_to_end_ordering_with_two_consumers() {
    let queue = Arc::new(DelayQueue::new());
    let now = Instant::now();
    let deadline = Deadline::after(Duration::from_secs(4));
    let (tx, mut rx) = mpsc::unbounded_channel();

    queue.push(5, PushOptions::at(now + Duration::from_secs(3))).await;

    let consumers: Vec<_> = [2, 3]
        .into_iter()
        .map(|pulls| {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            tokio::spawn(async move {
                for _ in 0..pulls {
                    match queue.pull(&deadline).await {
                        Ok(value) => tx.send(value).expect("collector alive"),
                        Err(_) => return,
                    }
                }
            })
        })
        .collect();
    drop(tx);

    sleep(Duration::from_millis(100)).await;
    queue.push(3, PushOptions::at(now + Duration::from_secs(1))).await;
    sleep(Duration::from_millis(100)).await;
    queue.push(4, PushOptions::at(now + Duration::from_secs(2))).await;
    queue.push(1, PushOptions::at(now - Duration::from_secs(1))).await;
    queue.push(2, PushOptions::at(now)).await;

    for consumer in consumers {
        consumer.await.expect("consumer panicked");
    }

    let mut results = Vec::new();
    while let Some(value) = rx.recv().await {
        results.push(value);
    }

    assert_eq!(results.len(), 5, "got {:?}", results);
    // 1 and 2 are both overdue when pushed, so two consumers may report them
    // in either order; everything after is a second apart
    let mut overdue = results[..2].to_vec();
    overdue.sort();
    assert_eq!(overdue, vec![1, 2]);
    assert_eq!(results[2..], [3, 4, 5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_consumer_sees_ready_at_order() {
    let queue = DelayQueue::new();
    let now = Instant::now();
    let mut schedule: Vec<(i32, Instant)> = vec![
        (1, now - Duration::from_secs(1)),
        (2, now),
        (3, now + Duration::from_millis(300)),
        (4, now + Duration::from_millis(600)),
        (5, now + Duration::from_millis(900)),
    ];
    schedule.shuffle(&mut rand::thread_rng());

    for (value, ready_at) in schedule {
        queue.push(value, PushOptions::at(ready_at)).await;
    }

    let deadline = Deadline::after(Duration::from_secs(2));
    let mut results = Vec::new();
    for _ in 0..5 {
        results.push(queue.pull(&deadline).await.expect("pulled before deadline"));
    }
    assert_eq!(results, vec![1, 2, 3, 4, 5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_duplicate_lost_or_early_delivery() {
    const ITEMS: usize = 300;
    const CONSUMERS: usize = 8;

    let queue = Arc::new(DelayQueue::new());
    let stop = CancelSignal::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let stop = stop.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    match queue.pull(&stop).await {
                        Ok((id, ready_at)) => {
                            let pulled_at = Instant::now();
                            tx.send((id, ready_at, pulled_at)).expect("collector alive");
                        }
                        Err(err) => {
                            assert_eq!(err, QueueError::Cancelled);
                            return;
                        }
                    }
                }
            })
        })
        .collect();
    drop(tx);

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for id in (producer..ITEMS).step_by(4) {
                    let delay = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                    let ready_at = Instant::now() + delay;
                    queue.push((id, ready_at), PushOptions::at(ready_at)).await;
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.expect("producer panicked");
    }

    let mut seen = HashSet::new();
    let collect = async {
        while seen.len() < ITEMS {
            let (id, ready_at, pulled_at) = rx.recv().await.expect("consumers alive");
            assert!(pulled_at >= ready_at, "item {} delivered early", id);
            assert!(seen.insert(id), "item {} delivered twice", id);
        }
    };
    tokio::time::timeout(Duration::from_secs(5), collect)
        .await
        .expect("all items delivered");

    stop.cancel();
    for consumer in consumers {
        consumer.await.expect("consumer panicked");
    }
    assert!(rx.recv().await.is_none(), "extra delivery after all items seen");
    assert!(queue.is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_consumer_sees_non_decreasing_ready_at() {
    const ITEMS: u64 = 40;

    let queue = Arc::new(DelayQueue::new());
    let start = Instant::now() + Duration::from_millis(50);
    let mut offsets: Vec<u64> = (0..ITEMS).collect();
    offsets.shuffle(&mut rand::thread_rng());

    let stop = CancelSignal::new();
    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Ok(offset) = queue.pull(&stop).await {
                    seen.push(offset);
                }
                seen
            })
        })
        .collect();

    for offset in offsets {
        let ready_at = start + Duration::from_millis(offset * 10);
        queue.push(offset, PushOptions::at(ready_at)).await;
    }

    let last_ready_at = start + Duration::from_millis((ITEMS - 1) * 10);
    tokio::time::sleep_until(last_ready_at + Duration::from_millis(500)).await;
    stop.cancel();

    let mut total = 0;
    for consumer in consumers {
        let seen = tokio::time::timeout(Duration::from_secs(6), consumer)
            .await
            .expect("consumer finished")
            .expect("consumer panicked");
        assert!(
            seen.windows(2).all(|pair| pair[0] < pair[1]),
            "out of order: {:?}",
            seen
        );
        total += seen.len();
    }
    assert_eq!(total as u64, ITEMS);
}

#[tokio::test]
async fn test_drain_before_anything_is_due() {
    let queue = DelayQueue::new();
    queue.push("second", PushOptions::delay(Duration::from_secs(20))).await;
    queue.push("third", PushOptions::delay(Duration::from_secs(30))).await;
    queue.push("first", PushOptions::delay(Duration::from_secs(10))).await;

    assert_eq!(queue.drain().await, vec!["first", "second", "third"]);

    let start = Instant::now();
    let result = queue.pull(&Deadline::after(Duration::from_millis(100))).await;
    assert_eq!(result, Err(QueueError::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_cancelled_token_on_empty_queue_returns_at_once() {
    let queue: DelayQueue<u32> = DelayQueue::new();
    let signal = CancelSignal::new();
    signal.cancel();

    let start = Instant::now();
    assert_eq!(queue.pull(&signal).await, Err(QueueError::Cancelled));
    assert!(start.elapsed() < Duration::from_millis(50));
}
