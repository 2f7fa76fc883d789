//! Call bridge benchmark suite.
//!
//! Measures outbound calls against an in-memory browser that answers at
//! once:
//! - Blocking round trips at several concurrency levels
//! - Fire-and-forget throughput
//! - Inbound `call_py` dispatch
//!
//! Run with: cargo bench --bench round_trip
//! Results saved to: target/criterion/

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use futures_util::future::join_all;
use serde_json::json;
use tokio::runtime::Runtime;
use tokio::sync::Notify;

use weblink::{Bridge, ChannelPeer, Connection, Invocation, SessionInfo, channel_transport};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const CONCURRENCY: &[usize] = &[1, 16, 128];
const BATCH_SIZE: u64 = 256;

// ============================================================================
// Fixture
// ============================================================================

/// Opens a session whose browser answers every blocking call with its script.
fn echo_session(rt: &Runtime, bridge: &Bridge, id: &str) -> Connection {
    let (transport, peer) = channel_transport();
    let connection = bridge.open(Arc::new(transport), SessionInfo::new("/").with_id(id));
    rt.spawn(echo_browser(bridge.clone(), connection.clone(), peer));
    connection
}

/// Answers `eval_js` frames until the peer channel closes.
async fn echo_browser(bridge: Bridge, connection: Connection, mut peer: ChannelPeer) {
    while let Some(frame) = peer.next_message().await {
        if frame["send_return_value"] != true {
            continue;
        }
        let reply = json!({
            "cmd": "return_py",
            "caller_id": frame["id"],
            "retval": frame["js_code"],
        });
        if bridge.handle_frame(&connection, &reply.to_string()).is_err() {
            break;
        }
    }
}

fn bridge(rt: &Runtime) -> Bridge {
    let _guard = rt.enter();
    Bridge::builder()
        .call_timeout(Duration::from_secs(5))
        .max_pending_calls(10_000)
        .build()
        .expect("bridge should build")
}

// ============================================================================
// Benchmark: Blocking Round Trip
// ============================================================================

fn bench_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let bridge = bridge(&rt);
    let connection = echo_session(&rt, &bridge, "bench");

    let mut group = c.benchmark_group("round_trip");

    for &concurrency in CONCURRENCY {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("eval_js", concurrency),
            &concurrency,
            |b, &n| {
                b.to_async(&rt).iter(|| async {
                    let calls = (0..n).map(|i| connection.eval_js(format!("v{i}")));
                    black_box(join_all(calls).await)
                });
            },
        );
    }

    group.finish();
    bridge.shutdown();
}

// ============================================================================
// Benchmark: Fire-and-Forget
// ============================================================================

fn bench_nowait(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let bridge = bridge(&rt);
    let connection = echo_session(&rt, &bridge, "nowait");

    let mut group = c.benchmark_group("nowait");
    group.throughput(Throughput::Elements(BATCH_SIZE));
    group.bench_function("eval_js_nowait", |b| {
        b.iter(|| {
            for _ in 0..BATCH_SIZE {
                black_box(connection.eval_js_nowait("noop()")).ok();
            }
        });
    });

    group.finish();
    bridge.shutdown();
}

// ============================================================================
// Benchmark: Inbound Dispatch
// ============================================================================

fn bench_inbound(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let done = Arc::new(Notify::new());

    let bridge = {
        let _guard = rt.enter();
        let done = Arc::clone(&done);
        Bridge::builder()
            .procedure("tick", move |_: Connection, _: Invocation| {
                let done = Arc::clone(&done);
                async move {
                    done.notify_one();
                    Ok::<_, weblink::Error>(())
                }
            })
            .build()
            .expect("bridge should build")
    };
    let connection = echo_session(&rt, &bridge, "inbound");
    let frame = json!({ "cmd": "call_py", "py_func_name": "tick", "args": [] }).to_string();

    let mut group = c.benchmark_group("inbound");
    group.bench_function("call_py", |b| {
        b.to_async(&rt).iter(|| async {
            bridge
                .handle_frame(&connection, &frame)
                .expect("frame accepted");
            done.notified().await;
        });
    });

    group.finish();
    bridge.shutdown();
}

criterion_group!(benches, bench_round_trip, bench_nowait, bench_inbound);
criterion_main!(benches);
