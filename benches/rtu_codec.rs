//! RTU codec and server dispatch benchmarks
//!
//! Covers the per-frame work done inside one channel pass: CRC, framing,
//! request decode and serving a read from the register map.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cortex_link::protocol::{ModbusFunction, ModbusRequest};
use cortex_link::register_map::{RegisterKind, RegisterMap};
use cortex_link::rtu;
use cortex_link::server::RtuServer;

fn bench_crc(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc16");
    for size in [8usize, 64, 256] {
        let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| rtu::calculate_crc(black_box(data)))
        });
    }
    group.finish();
}

fn bench_framing(c: &mut Criterion) {
    let request = ModbusRequest::write_multiple_registers(1, 70, &[100; 32]);
    let frame = rtu::encode_request(&request).unwrap();

    c.bench_function("request_frame_len", |b| b.iter(|| rtu::request_frame_len(black_box(&frame))));
    c.bench_function("decode_request", |b| b.iter(|| rtu::decode_request(black_box(&frame)).unwrap()));
    c.bench_function("encode_request", |b| b.iter(|| rtu::encode_request(black_box(&request)).unwrap()));
}

fn bench_server_read(c: &mut Criterion) {
    let map = RegisterMap::new();
    map.insert_range(RegisterKind::InputRegister, 0, 125, None).unwrap();
    let mut server = RtuServer::new(1);

    let mut group = c.benchmark_group("serve_input_registers");
    for count in [1u16, 16, 125] {
        let request = ModbusRequest::new_read(1, ModbusFunction::ReadInputRegisters, 0, count);
        let frame = rtu::encode_request(&request).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(count), &frame, |b, frame| {
            b.iter(|| server.handle_frame(black_box(frame), &map).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_crc, bench_framing, bench_server_read);
criterion_main!(benches);
