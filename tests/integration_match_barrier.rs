use pubsub_throughput::matching::{EndpointRole, MatchListener, MatchTracker};
use pubsub_throughput::transport::{
    Direction, EndpointSpec, HistoryPolicy, LoopbackBus, ParticipantOptions, Reliability,
    SchemaDescriptor, SchemaKind, Transport,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// Apply deltas from another thread; the waiter must wake exactly when the
/// running total first reaches the threshold
#[test]
fn barrier_releases_when_running_total_reaches_threshold() {
    let patterns: [&[i32]; 4] = [
        &[1, 1, 1],
        &[1, -1, 1, 1, -1, 1, 1],
        &[1, 1, -1, -1, 1, 1, 1],
        &[1, -1, 1, -1, 1, -1, 1, 1, 1],
    ];

    for deltas in patterns {
        let tracker = Arc::new(MatchTracker::new("barrier"));
        let feeder = {
            let tracker = Arc::clone(&tracker);
            let deltas = deltas.to_vec();
            thread::spawn(move || {
                for delta in deltas {
                    thread::sleep(Duration::from_millis(2));
                    tracker.on_match_change(EndpointRole::Data, delta);
                }
            })
        };

        let mut observed = 0;
        let released = tracker.wait_until(
            |counts| {
                observed = counts.get(EndpointRole::Data);
                observed >= 3
            },
            Some(WAIT),
        );
        feeder.join().unwrap();

        assert!(released, "deltas {:?}", deltas);
        assert_eq!(observed, 3, "deltas {:?}", deltas);
    }
}

#[test]
fn barrier_never_releases_below_threshold() {
    let tracker = Arc::new(MatchTracker::new("barrier"));
    let feeder = {
        let tracker = Arc::clone(&tracker);
        thread::spawn(move || {
            for delta in [1, 1, -1, 1, -1, -1] {
                tracker.on_match_change(EndpointRole::Data, delta);
            }
        })
    };
    feeder.join().unwrap();

    assert!(!tracker.wait_until(
        |counts| counts.get(EndpointRole::Data) >= 3,
        Some(Duration::from_millis(50))
    ));
    assert_eq!(tracker.counts().get(EndpointRole::Data), 0);
}

fn open(bus: &LoopbackBus, name: &str) -> pubsub_throughput::transport::LoopbackTransport {
    let transport = bus.participant();
    transport
        .open_participant(&ParticipantOptions {
            name: name.to_string(),
            domain_id: 0,
            profile_path: None,
        })
        .unwrap();
    transport
}

#[test]
fn loopback_matching_drives_tracker() {
    let bus = LoopbackBus::new();
    let reader_side = open(&bus, "reader");
    let writer_side = open(&bus, "writer");
    let descriptor = SchemaDescriptor {
        type_name: "BarrierType".to_string(),
        kind: SchemaKind::Static,
        max_serialized_size: 8,
    };

    let tracker = Arc::new(MatchTracker::new("data"));
    let reader_schema = reader_side.register_schema(&descriptor).unwrap();
    let reader_channel = reader_side.create_channel("Barrier", reader_schema).unwrap();
    reader_side
        .create_endpoint(
            &EndpointSpec {
                channel: reader_channel,
                direction: Direction::Reader,
                reliability: Reliability::Reliable,
                history: HistoryPolicy::KeepAll,
            },
            Arc::new(MatchListener::new(EndpointRole::Data, Arc::clone(&tracker))),
        )
        .unwrap();

    let writer_schema = writer_side.register_schema(&descriptor).unwrap();
    let writer_channel = writer_side.create_channel("Barrier", writer_schema).unwrap();
    let spec = EndpointSpec {
        channel: writer_channel,
        direction: Direction::Writer,
        reliability: Reliability::Reliable,
        history: HistoryPolicy::KeepAll,
    };
    let quiet = Arc::new(MatchListener::new(
        EndpointRole::CommandSend,
        Arc::new(MatchTracker::new("writer")),
    ));
    let first = writer_side.create_endpoint(&spec, quiet.clone()).unwrap();
    let second = writer_side.create_endpoint(&spec, quiet).unwrap();

    assert!(tracker.wait_until(|c| c.get(EndpointRole::Data) == 2, Some(WAIT)));

    writer_side.destroy_endpoint(first).unwrap();
    writer_side.destroy_endpoint(second).unwrap();
    assert!(tracker.wait_until(|c| c.get(EndpointRole::Data) == 0, Some(WAIT)));
}
