//! Benchmarks for the coherent buffer and frame codec.

use std::sync::Arc;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use matrix_worker::buffer::DenseMatrix;
use matrix_worker::device::DeviceContext;
use matrix_worker::worker::protocol::{Frame, WorkerRequest};

fn bench_materialize_round_trip(c: &mut Criterion) {
    let ctx = Arc::new(DeviceContext::new(256 * 1024 * 1024));

    // 1024x1024 f64 matrix (8 MB per copy).
    let matrix =
        DenseMatrix::from_values(1024, 1024, vec![1.0f64; 1024 * 1024], ctx.clone()).unwrap();

    let update = vec![2.0f64; 1024 * 1024];
    c.bench_function("materialize_device_host_round_trip_8mb", |b| {
        b.iter(|| {
            // Force both copies every iteration.
            matrix.write_device(&update).unwrap();
            let values = matrix.host_values().unwrap();
            black_box(values[0]);
        })
    });
}

fn bench_materialize_noop(c: &mut Criterion) {
    let ctx = Arc::new(DeviceContext::new(256 * 1024 * 1024));
    let matrix = DenseMatrix::from_values(256, 256, vec![1.0f64; 256 * 256], ctx).unwrap();
    matrix.materialize_on_device().unwrap();

    c.bench_function("materialize_device_noop", |b| {
        b.iter(|| {
            matrix.materialize_on_device().unwrap();
        })
    });
}

fn bench_transpose_view(c: &mut Criterion) {
    let ctx = Arc::new(DeviceContext::new(64 * 1024 * 1024));
    let vector = DenseMatrix::from_values(1, 4096, vec![1.0f64; 4096], ctx).unwrap();

    c.bench_function("transpose_view_4096", |b| {
        b.iter(|| {
            let view = vector.transpose_view().unwrap();
            black_box(view.num_rows());
        })
    });
}

fn bench_frame_encode(c: &mut Criterion) {
    let payload = Bytes::from(vec![0u8; 64 * 1024]);
    let request = WorkerRequest::Store {
        id: Some("bench".to_string()),
        num_rows: 64,
        num_cols: 128,
    };

    c.bench_function("frame_encode_64kb", |b| {
        b.iter(|| {
            let frame = Frame::new(&request, payload.clone()).unwrap();
            black_box(frame.encode());
        })
    });
}

criterion_group!(
    benches,
    bench_materialize_round_trip,
    bench_materialize_noop,
    bench_transpose_view,
    bench_frame_encode,
);
criterion_main!(benches);
