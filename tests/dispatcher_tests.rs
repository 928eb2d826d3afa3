
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::seq::SliceRandom;

use jobgrid::cluster::{ClusterNode, NodeId};
use jobgrid::config::DispatcherConfig;
use jobgrid::events::EventKind;
use jobgrid::messaging::{DispatchPolicy, Envelope, MessageListener};
use test_harness::{assert_eventually, detached_dispatcher, ScriptedMembership, TestMessaging};

const TTL: Duration = Duration::from_secs(10);

fn ordered(from: NodeId, to: NodeId, topic: &str, seq: u64) -> Envelope {
    Envelope::ordered(from, vec![to], topic, Bytes::from(seq.to_string()), seq, TTL).unwrap()
}

fn unordered(from: NodeId, to: NodeId, topic: &str) -> Envelope {
    Envelope::unordered(from, vec![to], topic, Bytes::from_static(b"x"), DispatchPolicy::Pooled)
        .unwrap()
}

/// Listener that records sequence ids in delivery order.
fn recorder() -> (Arc<dyn MessageListener>, Arc<Mutex<Vec<u64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener: Arc<dyn MessageListener> = Arc::new(move |_sender: NodeId, env: &Envelope| {
        sink.lock().unwrap().push(env.sequence().unwrap_or(0));
    });
    (listener, seen)
}

fn counter() -> (Arc<dyn MessageListener>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let listener: Arc<dyn MessageListener> = Arc::new(move |_sender: NodeId, _env: &Envelope| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    (listener, count)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ordered_delivery_under_concurrent_shuffled_arrival() {
    let m = TestMessaging::new(2, DispatcherConfig::default()).await;
    let (a, b) = (m.id(0), m.id(1));
    let receiver = m.dispatcher(1).clone();
    let (listener, seen) = recorder();
    receiver.register_listener("orders", listener);

    const N: u64 = 200;
    let mut seqs: Vec<u64> = (1..=N).collect();
    seqs.shuffle(&mut rand::thread_rng());

    let mut handles = Vec::new();
    for chunk in seqs.chunks(20) {
        let chunk = chunk.to_vec();
        let receiver = receiver.clone();
        handles.push(tokio::spawn(async move {
            for seq in chunk {
                receiver.on_message_received(a, ordered(a, b, "orders", seq));
                tokio::task::yield_now().await;
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eventually(
        || async { seen.lock().unwrap().len() == N as usize },
        Duration::from_secs(5),
        "all ordered envelopes should be delivered",
    )
    .await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, (1..=N).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicates_are_delivered_once() {
    let m = TestMessaging::new(2, DispatcherConfig::default()).await;
    let (a, b) = (m.id(0), m.id(1));
    let receiver = m.dispatcher(1);
    let (listener, seen) = recorder();
    receiver.register_listener("dups", listener);

    for seq in [2, 1, 2, 1, 3, 3, 2] {
        receiver.on_message_received(a, ordered(a, b, "dups", seq));
    }

    assert_eventually(
        || async { seen.lock().unwrap().len() >= 3 },
        Duration::from_secs(2),
        "three distinct envelopes should arrive",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_delivery_thread_per_topic() {
    let m = TestMessaging::new(2, DispatcherConfig::default()).await;
    let (a, b) = (m.id(0), m.id(1));
    let receiver = m.dispatcher(1).clone();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(AtomicUsize::new(0));
    let (f, mx, d) = (in_flight.clone(), max_seen.clone(), delivered.clone());
    let listener: Arc<dyn MessageListener> = Arc::new(move |_s: NodeId, _e: &Envelope| {
        let now = f.fetch_add(1, Ordering::SeqCst) + 1;
        mx.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(1));
        f.fetch_sub(1, Ordering::SeqCst);
        d.fetch_add(1, Ordering::SeqCst);
    });
    receiver.register_listener("serial", listener);

    const N: u64 = 64;
    let mut seqs: Vec<u64> = (1..=N).collect();
    seqs.shuffle(&mut rand::thread_rng());
    let handles: Vec<_> = seqs
        .into_iter()
        .map(|seq| {
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.on_message_received(a, ordered(a, b, "serial", seq)) })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }

    assert_eventually(
        || async { delivered.load(Ordering::SeqCst) == N as usize },
        Duration::from_secs(5),
        "every envelope should be delivered",
    )
    .await;
    assert_eq!(max_seen.load(Ordering::SeqCst), 1, "delivery loop ran concurrently");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ordered_delivery_over_transport() {
    let m = TestMessaging::new(2, DispatcherConfig::default()).await;
    let (listener, seen) = recorder();
    m.dispatcher(1).register_listener("wire", listener);

    for i in 0..50 {
        let seq = m
            .dispatcher(0)
            .send_ordered(m.id(1), "wire", Bytes::from(format!("{i}")), TTL)
            .unwrap();
        assert_eq!(seq, i + 1);
    }

    assert_eventually(
        || async { seen.lock().unwrap().len() == 50 },
        Duration::from_secs(5),
        "all envelopes should cross the loopback network",
    )
    .await;
    assert_eq!(*seen.lock().unwrap(), (1..=50).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_undiscovered_sender_delivered_after_join() {
    let config = DispatcherConfig {
        discovery_startup_window: Duration::from_secs(2),
        ..Default::default()
    };
    let m = TestMessaging::new(1, config).await;
    let receiver = m.dispatcher(0);
    let (listener, count) = counter();
    receiver.register_listener("early", listener);

    let stranger = NodeId::new();
    receiver.on_message_received(stranger, unordered(stranger, m.id(0), "early"));
    assert_eq!(receiver.parked(&stranger), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);

    m.membership.join(ClusterNode::new(stranger, "late"));
    assert_eventually(
        || async { count.load(Ordering::SeqCst) == 1 },
        Duration::from_secs(2),
        "parked envelope should be delivered on JOINED",
    )
    .await;
    assert_eq!(receiver.parked(&stranger), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_undiscovered_sender_outside_window_never_delivered() {
    let config = DispatcherConfig {
        discovery_startup_window: Duration::from_millis(50),
        ..Default::default()
    };
    let m = TestMessaging::new(1, config).await;
    let receiver = m.dispatcher(0);
    let (listener, count) = counter();
    receiver.register_listener("early", listener);

    let stranger = NodeId::new();
    receiver.on_message_received(stranger, unordered(stranger, m.id(0), "early"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    m.membership.join(ClusterNode::new(stranger, "too-late"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(receiver.parked(&stranger), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_removed_topic_drops_late_ordered_envelopes() {
    let m = TestMessaging::new(2, DispatcherConfig::default()).await;
    let (a, b) = (m.id(0), m.id(1));
    let receiver = m.dispatcher(1);
    let (listener, seen) = recorder();
    receiver.register_listener("t", listener.clone());

    receiver.on_message_received(a, ordered(a, b, "t", 1));
    assert_eventually(
        || async { seen.lock().unwrap().len() == 1 },
        Duration::from_secs(2),
        "first envelope delivered",
    )
    .await;
    assert!(receiver.has_message_set("t"));

    assert!(receiver.remove_listener("t", Some(&listener)));
    assert!(receiver.is_closed("t"));
    assert!(!receiver.has_message_set("t"));

    receiver.on_message_received(a, ordered(a, b, "t", 2));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec![1]);
    assert!(!receiver.has_message_set("t"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_closed_topics_evict_oldest() {
    let config = DispatcherConfig {
        max_closed_topics: 2,
        ..Default::default()
    };
    let m = TestMessaging::new(1, config).await;
    let d = m.dispatcher(0);

    for topic in ["t1", "t2", "t3"] {
        let (listener, _) = counter();
        d.register_listener(topic, listener);
        d.remove_listener(topic, None);
    }
    assert!(!d.is_closed("t1"));
    assert!(d.is_closed("t2"));
    assert!(d.is_closed("t3"));

    // Registering again reopens the topic.
    let (listener, _) = counter();
    d.register_listener("t3", listener);
    assert!(!d.is_closed("t3"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partial_listener_removal_keeps_topic_open() {
    let m = TestMessaging::new(2, DispatcherConfig::default()).await;
    let (a, b) = (m.id(0), m.id(1));
    let receiver = m.dispatcher(1);
    let (first, first_count) = counter();
    let (second, second_count) = counter();
    receiver.register_listener("shared", first.clone());
    receiver.register_listener("shared", second);

    assert!(receiver.remove_listener("shared", Some(&first)));
    assert!(!receiver.is_closed("shared"));

    receiver.on_message_received(a, unordered(a, b, "shared"));
    assert_eventually(
        || async { second_count.load(Ordering::SeqCst) == 1 },
        Duration::from_secs(2),
        "remaining listener should still receive",
    )
    .await;
    assert_eq!(first_count.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_listener_drains_buffered_set() {
    let m = TestMessaging::new(2, DispatcherConfig::default()).await;
    let (a, b) = (m.id(0), m.id(1));
    let receiver = m.dispatcher(1);

    for seq in [3, 1, 2] {
        receiver.on_message_received(a, ordered(a, b, "late", seq));
    }
    assert!(receiver.has_message_set("late"));

    let (listener, seen) = recorder();
    receiver.register_listener("late", listener);
    assert_eventually(
        || async { seen.lock().unwrap().len() == 3 },
        Duration::from_secs(2),
        "buffered envelopes should drain to the new listener",
    )
    .await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mismatched_destination_or_sender_dropped() {
    let m = TestMessaging::new(3, DispatcherConfig::default()).await;
    let (a, b, c) = (m.id(0), m.id(1), m.id(2));
    let receiver = m.dispatcher(1);
    let (listener, count) = counter();
    receiver.register_listener("strict", listener);

    // Addressed to someone else.
    receiver.on_message_received(a, unordered(a, c, "strict"));
    // Claims to come from c but the transport says a.
    receiver.on_message_received(a, unordered(c, b, "strict"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);

    receiver.on_message_received(a, unordered(a, b, "strict"));
    assert_eventually(
        || async { count.load(Ordering::SeqCst) == 1 },
        Duration::from_secs(2),
        "valid envelope delivered",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dedicated_policy_delivers() {
    let m = TestMessaging::new(2, DispatcherConfig::default()).await;
    let (listener, count) = counter();
    m.dispatcher(1).register_listener("urgent", listener);

    m.dispatcher(0)
        .send(&[m.id(1)], "urgent", Bytes::from_static(b"!"), DispatchPolicy::Dedicated)
        .unwrap();
    assert_eventually(
        || async { count.load(Ordering::SeqCst) == 1 },
        Duration::from_secs(2),
        "dedicated envelope delivered",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_listener_does_not_stop_delivery() {
    let m = TestMessaging::new(2, DispatcherConfig::default()).await;
    let (a, b) = (m.id(0), m.id(1));
    let receiver = m.dispatcher(1);
    let bomb: Arc<dyn MessageListener> = Arc::new(|_s: NodeId, e: &Envelope| {
        if e.sequence() == Some(1) {
            panic!("listener failure");
        }
    });
    let (listener, seen) = recorder();
    receiver.register_listener("fragile", bomb);
    receiver.register_listener("fragile", listener);

    for seq in 1..=3 {
        receiver.on_message_received(a, ordered(a, b, "fragile", seq));
    }
    assert_eventually(
        || async { seen.lock().unwrap().len() == 3 },
        Duration::from_secs(2),
        "delivery should continue past a panicking listener",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_departed_owner_sets_are_discarded() {
    let m = TestMessaging::new(2, DispatcherConfig::default()).await;
    let (a, b) = (m.id(0), m.id(1));
    let receiver = m.dispatcher(1);

    // Gap at 1 keeps the set alive.
    receiver.on_message_received(a, ordered(a, b, "owned", 2));
    assert!(receiver.has_message_set("owned"));

    m.membership.leave(&a);
    assert!(!receiver.has_message_set("owned"));
    assert!(receiver.is_closed("owned"));
    assert_eq!(m.timeouts.pending(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_set_created_after_owner_departed_is_discarded() {
    let m = TestMessaging::new(1, DispatcherConfig::default()).await;
    let membership = ScriptedMembership::wrap(m.membership.provider(NodeId::new()));
    let receiver = detached_dispatcher(&m, membership.clone());
    receiver.start();
    let me = receiver.local_node_id();
    // Never joined, but the receive-time check still sees it as a member.
    let departed = NodeId::new();
    membership.answer_stale(1);

    receiver.on_message_received(departed, ordered(departed, me, "orphan", 2));
    assert!(!receiver.has_message_set("orphan"));
    assert!(receiver.is_closed("orphan"));
    assert_eq!(m.timeouts.pending(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconcile_discards_sets_of_missed_departures() {
    let m = TestMessaging::new(1, DispatcherConfig::default()).await;
    let a = m.id(0);
    let membership = ScriptedMembership::wrap(m.membership.provider(NodeId::new()));
    // Not started, so the departure below goes unobserved.
    let receiver = detached_dispatcher(&m, membership);
    let me = receiver.local_node_id();

    receiver.on_message_received(a, ordered(a, me, "missed", 2));
    assert!(receiver.has_message_set("missed"));

    m.membership.leave(&a);
    assert!(receiver.has_message_set("missed"));

    receiver.reconcile_membership();
    assert!(!receiver.has_message_set("missed"));
    assert!(receiver.is_closed("missed"));
    assert_eq!(m.timeouts.pending(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_message_set_timeout_keeps_topic_open() {
    let m = TestMessaging::new(2, DispatcherConfig::default()).await;
    let (a, b) = (m.id(0), m.id(1));
    let receiver = m.dispatcher(1);
    let mut events = m.events.subscribe();

    let env = Envelope::ordered(a, vec![b], "gappy", Bytes::new(), 2, Duration::from_millis(50))
        .unwrap();
    receiver.on_message_received(a, env);
    assert!(receiver.has_message_set("gappy"));

    assert_eventually(
        || async { !receiver.has_message_set("gappy") },
        Duration::from_secs(2),
        "set should be dropped at its deadline",
    )
    .await;
    assert!(!receiver.is_closed("gappy"));

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("event published")
        .unwrap();
    assert_eq!(event.kind, EventKind::MessageSetTimedOut);
    assert_eq!(event.topic.as_deref(), Some("gappy"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_drains_then_drops() {
    let m = TestMessaging::new(2, DispatcherConfig::default()).await;
    let (a, b) = (m.id(0), m.id(1));
    let receiver = m.dispatcher(1).clone();
    let (listener, count) = counter();
    receiver.register_listener("burst", listener);

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let receiver = receiver.clone();
            tokio::spawn(async move { receiver.on_message_received(a, unordered(a, b, "burst")) })
        })
        .collect();
    receiver.stop().await;
    for h in handles {
        h.await.unwrap();
    }
    assert!(receiver.is_stopping());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let delivered = count.load(Ordering::SeqCst);
    assert!(delivered <= 100);

    for _ in 0..10 {
        receiver.on_message_received(a, unordered(a, b, "burst"));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), delivered);
    assert!(receiver
        .send(&[a], "burst", Bytes::new(), DispatchPolicy::Pooled)
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_waits_for_in_flight_receive() {
    let m = TestMessaging::new(1, DispatcherConfig::default()).await;
    let a = m.id(0);
    let membership = ScriptedMembership::wrap(m.membership.provider(NodeId::new()));
    let receiver = detached_dispatcher(&m, membership.clone());
    receiver.start();
    let me = receiver.local_node_id();
    let (listener, count) = counter();
    receiver.register_listener("held", listener);

    membership.hold();
    let in_flight = {
        let receiver = receiver.clone();
        tokio::task::spawn_blocking(move || receiver.on_message_received(a, unordered(a, me, "held")))
    };
    assert_eventually(
        || async { membership.checks() >= 1 },
        Duration::from_secs(2),
        "receive should reach the membership check",
    )
    .await;

    let stopper = {
        let receiver = receiver.clone();
        tokio::spawn(async move { receiver.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(receiver.is_stopping());
    assert!(!stopper.is_finished());
    assert!(!in_flight.is_finished());

    membership.release();
    tokio::time::timeout(Duration::from_secs(1), stopper)
        .await
        .expect("stop should return once the receive completes")
        .unwrap();
    in_flight.await.unwrap();

    // Admitted before the gate closed, so it is still delivered.
    assert_eventually(
        || async { count.load(Ordering::SeqCst) == 1 },
        Duration::from_secs(2),
        "in-flight envelope should be delivered",
    )
    .await;
}
