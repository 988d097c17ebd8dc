//! End-to-end behaviour of the engine: replay, fan-out and the event log.

use scribble_core::{
    AllowAll, Connection, ConnectionId, ConnectionManager, DrawEvent, EventStore, ManagerConfig,
    MemoryEventStore, PeerHandle, PeerReceiver, Point,
};
use std::sync::Arc;

fn manager(store: Arc<MemoryEventStore>) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(
        store,
        Arc::new(AllowAll),
        ManagerConfig::default(),
    ))
}

async fn join(
    m: &ConnectionManager,
    id: &str,
    board: &str,
    capacity: usize,
) -> (Connection, PeerReceiver, u64) {
    let (peer, rx) = PeerHandle::channel(capacity);
    let joined = m
        .connect(ConnectionId::from(id), board, None, peer)
        .await
        .expect("join");
    (joined.connection, rx, joined.replayed)
}

fn drain(rx: &mut PeerReceiver) -> Vec<Arc<DrawEvent>> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}

fn segment(x1: f64, y1: f64, x2: f64, y2: f64) -> (Point, Point) {
    (Point::new(x1, y1), Point::new(x2, y2))
}

#[tokio::test]
async fn late_joiner_sees_history_then_live() {
    let store = Arc::new(MemoryEventStore::new());
    let m = manager(store.clone());

    // Seed [e1, e2] through a writer that has since left.
    let (seed, _seed_rx, _) = join(&m, "seed", "B1", 8).await;
    let (f, t) = segment(1.0, 1.0, 2.0, 2.0);
    m.publish(&seed, f, t, None).await.unwrap();
    let (f, t) = segment(2.0, 2.0, 3.0, 3.0);
    m.publish(&seed, f, t, None).await.unwrap();
    m.disconnect(&seed);

    let (_c1, mut c1_rx, replayed) = join(&m, "C1", "B1", 8).await;
    assert_eq!(replayed, 2);
    let history = drain(&mut c1_rx);
    assert_eq!(
        history.iter().map(|e| e.from).collect::<Vec<_>>(),
        vec![Point::new(1.0, 1.0), Point::new(2.0, 2.0)]
    );

    let (c2, mut c2_rx, replayed) = join(&m, "C2", "B1", 8).await;
    assert_eq!(replayed, 2);
    drain(&mut c2_rx);

    let (f, t) = segment(0.0, 0.0, 10.0, 10.0);
    let report = m.publish(&c2, f, t, None).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(report.persisted());

    let live = drain(&mut c1_rx);
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].from, Point::new(0.0, 0.0));
    assert_eq!(live[0].to, Point::new(10.0, 10.0));
    assert!(drain(&mut c2_rx).is_empty());

    let logged = store.read_from("B1", 0, 100).await.unwrap();
    assert_eq!(
        logged.iter().map(|e| e.sequence).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(logged[2].to, Point::new(10.0, 10.0));
}

#[tokio::test]
async fn disconnected_peer_is_skipped_without_error() {
    let store = Arc::new(MemoryEventStore::new());
    let m = manager(store.clone());

    let (c1, mut c1_rx, _) = join(&m, "C1", "B1", 8).await;
    let (c2, _c2_rx, _) = join(&m, "C2", "B1", 8).await;

    assert!(m.disconnect(&c1));

    let (f, t) = segment(5.0, 5.0, 6.0, 6.0);
    let report = m.publish(&c2, f, t, None).await.unwrap();

    assert_eq!(report.delivered, 0);
    assert!(report.dropped.is_empty());
    assert!(report.persisted());
    assert!(drain(&mut c1_rx).is_empty());
    assert_eq!(store.len("B1").await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishers_produce_one_order() {
    const PER_WRITER: usize = 200;

    let store = Arc::new(MemoryEventStore::new());
    let m = manager(store.clone());

    let mut readers = Vec::new();
    for i in 0..3 {
        readers.push(join(&m, &format!("reader-{i}"), "B1", 4096).await);
    }
    let mut writers = Vec::new();
    for i in 0..2 {
        writers.push(join(&m, &format!("writer-{i}"), "B1", 4096).await);
    }

    let mut tasks = Vec::new();
    for (w, (conn, _, _)) in writers.iter().enumerate() {
        let m = Arc::clone(&m);
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..PER_WRITER {
                let x = (w * PER_WRITER + i) as f64;
                m.publish(&conn, Point::new(x, -x), Point::new(x + 0.5, -x - 0.5), None)
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let total = 2 * PER_WRITER as u64;
    let expected: Vec<u64> = (0..total).collect();
    for (_, rx, _) in readers.iter_mut() {
        let seqs: Vec<u64> = drain(rx).iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, expected);
    }

    // Writers see everything except their own strokes, still in order.
    for (conn, rx, _) in writers.iter_mut() {
        let events = drain(rx);
        assert_eq!(events.len(), PER_WRITER);
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
        // writer-0 drew x < PER_WRITER, writer-1 the rest.
        let drew_low = conn.id().as_str() == "writer-0";
        assert!(events
            .iter()
            .all(|e| (e.from.x < PER_WRITER as f64) != drew_low));
    }

    let logged: Vec<u64> = store
        .read_from("B1", 0, usize::MAX)
        .await
        .unwrap()
        .iter()
        .map(|e| e.sequence)
        .collect();
    assert_eq!(logged, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joining_mid_stream_never_duplicates() {
    let store = Arc::new(MemoryEventStore::new());
    let m = manager(store.clone());
    let (writer, _w_rx, _) = join(&m, "writer", "B1", 16).await;

    let publisher = {
        let m = Arc::clone(&m);
        tokio::spawn(async move {
            for i in 0..500 {
                let x = i as f64;
                m.publish(&writer, Point::new(x, x), Point::new(x, x + 1.0), None)
                    .await
                    .unwrap();
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    let mut joiners = Vec::new();
    for i in 0..5 {
        tokio::task::yield_now().await;
        joiners.push(join(&m, &format!("late-{i}"), "B1", 8192).await);
    }
    publisher.await.unwrap();

    for (_, rx, _) in joiners.iter_mut() {
        let seqs: Vec<u64> = drain(rx).iter().map(|e| e.sequence).collect();
        assert!(
            seqs.windows(2).all(|w| w[0] < w[1]),
            "received a duplicate or out-of-order event"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_during_fanout_is_silent() {
    let store = Arc::new(MemoryEventStore::new());
    let m = manager(store.clone());

    let (writer, _w, _) = join(&m, "writer", "B1", 8).await;
    let (leaver, leaver_rx, _) = join(&m, "leaver", "B1", 8).await;
    let (_stayer, mut stayer_rx, _) = join(&m, "stayer", "B1", 1024).await;

    let publisher = {
        let m = Arc::clone(&m);
        tokio::spawn(async move {
            for i in 0..300 {
                let x = i as f64;
                m.publish(&writer, Point::new(x, 0.0), Point::new(0.0, x), None)
                    .await
                    .expect("publish must not fail");
            }
        })
    };

    tokio::task::yield_now().await;
    drop(leaver_rx);
    m.disconnect(&leaver);
    publisher.await.unwrap();

    assert_eq!(drain(&mut stayer_rx).len(), 300);
    assert_eq!(store.len("B1").await.unwrap(), 300);
    assert!(!m.registry().contains("B1", &ConnectionId::from("leaver")));
}
