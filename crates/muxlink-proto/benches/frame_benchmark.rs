use criterion::{black_box, criterion_group, criterion_main, Criterion};
use muxlink_proto::{FrameOptions, MdpCodec, MfpCodec, PayloadBody};
use serde_json::json;
use std::collections::BTreeMap;

fn frame_codec_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    group.bench_function("encode_data_frame", |b| {
        let codec = MfpCodec::new();
        let frame = muxlink_proto::Frame::message(
            1,
            PayloadBody::with_data(br#"{"endpoint":"calculator","data":{"value1":6}}"#.to_vec()),
        );
        b.iter(|| black_box(codec.encode(black_box(&frame)).unwrap()));
    });

    group.bench_function("decode_data_frame", |b| {
        let codec = MfpCodec::new();
        let frame = muxlink_proto::Frame::message(
            1,
            PayloadBody::with_data(br#"{"endpoint":"calculator","data":{"value1":6}}"#.to_vec()),
        );
        let bytes = codec.encode(&frame).unwrap();
        b.iter(|| black_box(codec.decode(black_box(&bytes)).unwrap()));
    });

    group.bench_function("encode_binaries_frame", |b| {
        let codec = MfpCodec::new();
        let mut binaries = BTreeMap::new();
        for key in 0..8u32 {
            binaries.insert(key, vec![key as u8; 1024]);
        }
        let frame = muxlink_proto::Frame::message(
            1,
            PayloadBody {
                data: Some(b"{}".to_vec()),
                binaries: Some(binaries),
                ..Default::default()
            },
        );
        b.iter(|| black_box(codec.encode(black_box(&frame)).unwrap()));
    });

    group.bench_function("mdp_request_round_trip", |b| {
        let mdp = MdpCodec::new(MfpCodec::new());
        let data = json!({"value1": 6, "value2": 2, "operation": "/"});
        b.iter(|| {
            let (_, bytes) = mdp
                .encode_request("calculator", Some(data.clone()), None, FrameOptions::acked())
                .unwrap();
            black_box(mdp.decode(&bytes).unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, frame_codec_benchmark);
criterion_main!(benches);
