//! End-to-end tests for the worker service over real sockets.
//!
//! Both scheduling variants serve the same wire contract, so each scenario
//! runs against whichever variants it exercises.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use bytes::Bytes;

use matrix_worker::config::{SchedulingMode, WorkerConfig};
use matrix_worker::device::DeviceContext;
use matrix_worker::worker::protocol::{
    read_frame_blocking, write_frame_blocking, ComputeKind, ErrorKind, Frame, WorkerRequest,
    WorkerResponse,
};
use matrix_worker::worker::{ServiceState, WorkerService};

fn start_service(scheduling: SchedulingMode, device_budget: usize) -> WorkerService {
    let mut config = WorkerConfig::default();
    config.server.scheduling = scheduling;
    let ctx = Arc::new(DeviceContext::new(device_budget));

    let mut service =
        WorkerService::bind("127.0.0.1:0", Arc::new(config), ctx).expect("bind ephemeral port");
    service.serve().expect("serve");
    service
}

fn f64_payload(values: &[f64]) -> Bytes {
    Bytes::copy_from_slice(bytemuck::cast_slice(values))
}

fn payload_to_f64(payload: &[u8]) -> Vec<f64> {
    let mut values = vec![0.0f64; payload.len() / std::mem::size_of::<f64>()];
    bytemuck::cast_slice_mut::<f64, u8>(&mut values).copy_from_slice(payload);
    values
}

fn roundtrip(
    stream: &mut TcpStream,
    request: &WorkerRequest,
    payload: Bytes,
) -> (WorkerResponse, Bytes) {
    let frame = Frame::new(request, payload).expect("encode request");
    write_frame_blocking(stream, &frame).expect("write frame");
    let reply = read_frame_blocking(stream)
        .expect("read frame")
        .expect("connection open");
    let response: WorkerResponse = reply.decode_header().expect("decode response");
    (response, reply.payload)
}

fn store_fetch_scenario(addr: SocketAddr) {
    let mut stream = TcpStream::connect(addr).expect("connect");

    let (response, _) = roundtrip(
        &mut stream,
        &WorkerRequest::Store {
            id: Some("a".to_string()),
            num_rows: 2,
            num_cols: 2,
        },
        f64_payload(&[1.0, 2.0, 3.0, 4.0]),
    );
    assert!(matches!(response, WorkerResponse::Stored { .. }), "{response:?}");

    let (response, payload) = roundtrip(
        &mut stream,
        &WorkerRequest::Fetch {
            id: "a".to_string(),
        },
        Bytes::new(),
    );
    match response {
        WorkerResponse::Payload {
            num_rows, num_cols, ..
        } => assert_eq!((num_rows, num_cols), (2, 2)),
        other => panic!("expected payload, got {other:?}"),
    }
    assert_eq!(payload_to_f64(&payload), vec![1.0, 2.0, 3.0, 4.0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_store_fetch_synchronous_variant() {
    let service = start_service(SchedulingMode::Synchronous, 1024 * 1024);
    let addr = service.local_addr();

    tokio::task::spawn_blocking(move || store_fetch_scenario(addr))
        .await
        .unwrap();

    service.shutdown();
    service.wait().await;
    assert_eq!(service.state(), ServiceState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_store_fetch_asynchronous_variant() {
    let service = start_service(SchedulingMode::Asynchronous, 1024 * 1024);
    let addr = service.local_addr();

    tokio::task::spawn_blocking(move || store_fetch_scenario(addr))
        .await
        .unwrap();

    service.shutdown();
    service.wait().await;
    assert_eq!(service.state(), ServiceState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compute_and_transpose_over_the_wire() {
    let service = start_service(SchedulingMode::Asynchronous, 1024 * 1024);
    let addr = service.local_addr();

    tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(addr).expect("connect");

        roundtrip(
            &mut stream,
            &WorkerRequest::Store {
                id: Some("x".to_string()),
                num_rows: 1,
                num_cols: 3,
            },
            f64_payload(&[1.0, 2.0, 3.0]),
        );
        roundtrip(
            &mut stream,
            &WorkerRequest::Store {
                id: Some("y".to_string()),
                num_rows: 1,
                num_cols: 3,
            },
            f64_payload(&[4.0, 5.0, 6.0]),
        );

        let (response, _) = roundtrip(
            &mut stream,
            &WorkerRequest::Compute {
                kind: ComputeKind::EwAdd,
                inputs: vec!["x".to_string(), "y".to_string()],
                output: Some("sum".to_string()),
            },
            Bytes::new(),
        );
        assert!(matches!(response, WorkerResponse::Done { .. }), "{response:?}");

        let (_, payload) = roundtrip(
            &mut stream,
            &WorkerRequest::Fetch {
                id: "sum".to_string(),
            },
            Bytes::new(),
        );
        assert_eq!(payload_to_f64(&payload), vec![5.0, 7.0, 9.0]);

        // Transpose view of the sum, then mutate the source and observe
        // the change through the view.
        let (response, _) = roundtrip(
            &mut stream,
            &WorkerRequest::Transpose {
                id: "sum".to_string(),
                output: Some("sum_t".to_string()),
            },
            Bytes::new(),
        );
        assert!(matches!(response, WorkerResponse::Done { .. }));

        roundtrip(
            &mut stream,
            &WorkerRequest::Write {
                id: "sum".to_string(),
            },
            f64_payload(&[0.5, 0.25, 0.125]),
        );

        let (response, payload) = roundtrip(
            &mut stream,
            &WorkerRequest::Fetch {
                id: "sum_t".to_string(),
            },
            Bytes::new(),
        );
        match response {
            WorkerResponse::Payload {
                num_rows, num_cols, ..
            } => assert_eq!((num_rows, num_cols), (3, 1)),
            other => panic!("expected payload, got {other:?}"),
        }
        assert_eq!(payload_to_f64(&payload), vec![0.5, 0.25, 0.125]);
    })
    .await
    .unwrap();

    service.shutdown();
    service.wait().await;
}

fn concurrent_isolation_scenario(addr: SocketAddr) {
    let workers: Vec<_> = (0..4)
        .map(|i| {
            std::thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).expect("connect");
                let id = format!("m{i}");
                let base = i as f64;
                let values = vec![base, base + 1.0, base + 2.0, base + 3.0];

                roundtrip(
                    &mut stream,
                    &WorkerRequest::Store {
                        id: Some(id.clone()),
                        num_rows: 1,
                        num_cols: 4,
                    },
                    f64_payload(&values),
                );
                roundtrip(
                    &mut stream,
                    &WorkerRequest::Promote { id: id.clone() },
                    Bytes::new(),
                );

                let (_, payload) =
                    roundtrip(&mut stream, &WorkerRequest::Fetch { id }, Bytes::new());
                assert_eq!(payload_to_f64(&payload), values);
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("client thread");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_isolation_synchronous_variant() {
    let service = start_service(SchedulingMode::Synchronous, 1024 * 1024);
    let addr = service.local_addr();

    tokio::task::spawn_blocking(move || concurrent_isolation_scenario(addr))
        .await
        .unwrap();

    service.shutdown();
    service.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_isolation_asynchronous_variant() {
    let service = start_service(SchedulingMode::Asynchronous, 1024 * 1024);
    let addr = service.local_addr();

    tokio::task::spawn_blocking(move || concurrent_isolation_scenario(addr))
        .await
        .unwrap();

    service.shutdown();
    service.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_out_of_device_memory_does_not_kill_the_worker() {
    // Budget fits a 1x4 f64 matrix (32 bytes) but not a 4x4 one.
    let service = start_service(SchedulingMode::Asynchronous, 32);
    let addr = service.local_addr();

    tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(addr).expect("connect");

        roundtrip(
            &mut stream,
            &WorkerRequest::Store {
                id: Some("big".to_string()),
                num_rows: 4,
                num_cols: 4,
            },
            f64_payload(&[0.0; 16]),
        );

        let (response, _) = roundtrip(
            &mut stream,
            &WorkerRequest::Promote {
                id: "big".to_string(),
            },
            Bytes::new(),
        );
        assert!(matches!(
            response,
            WorkerResponse::Error {
                kind: ErrorKind::OutOfDeviceMemory,
                ..
            }
        ));

        // The worker keeps serving, and the matrix's host values survived.
        let (_, payload) = roundtrip(
            &mut stream,
            &WorkerRequest::Fetch {
                id: "big".to_string(),
            },
            Bytes::new(),
        );
        assert_eq!(payload_to_f64(&payload), vec![0.0; 16]);

        // A matrix that fits still promotes fine.
        roundtrip(
            &mut stream,
            &WorkerRequest::Store {
                id: Some("small".to_string()),
                num_rows: 1,
                num_cols: 4,
            },
            f64_payload(&[1.0, 2.0, 3.0, 4.0]),
        );
        let (response, _) = roundtrip(
            &mut stream,
            &WorkerRequest::Promote {
                id: "small".to_string(),
            },
            Bytes::new(),
        );
        assert!(matches!(response, WorkerResponse::Done { .. }), "{response:?}");
    })
    .await
    .unwrap();

    service.shutdown();
    service.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_request_reported_not_fatal() {
    let service = start_service(SchedulingMode::Synchronous, 1024);
    let addr = service.local_addr();

    tokio::task::spawn_blocking(move || {
        let mut stream = TcpStream::connect(addr).expect("connect");

        let garbage = Frame {
            header: Bytes::from_static(b"{\"op\":\"no_such_op\"}"),
            payload: Bytes::new(),
        };
        write_frame_blocking(&mut stream, &garbage).expect("write");

        let reply = read_frame_blocking(&mut stream)
            .expect("read")
            .expect("connection open");
        let response: WorkerResponse = reply.decode_header().expect("decode");
        assert!(matches!(
            response,
            WorkerResponse::Error {
                kind: ErrorKind::MalformedRequest,
                ..
            }
        ));

        // Same connection still serves well-formed requests.
        let (response, _) = roundtrip(
            &mut stream,
            &WorkerRequest::Store {
                id: None,
                num_rows: 1,
                num_cols: 1,
            },
            f64_payload(&[1.0]),
        );
        assert!(matches!(response, WorkerResponse::Stored { .. }));
    })
    .await
    .unwrap();

    service.shutdown();
    service.wait().await;
}
