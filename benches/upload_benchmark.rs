//! Upload benchmarks

use async_trait::async_trait;
use bytes::Bytes;
use charmfs::client::{
    ClientError, DispatchRequest, DispatchResponse, RequestBody, RequestDispatcher,
};
use charmfs::crypto::{
    DeterministicPathCipher, Encryptor, KeyMaterial, PassthroughEncryptor, PlainPathCipher,
    StreamEncryptor,
};
use charmfs::upload::{MultipartFramer, StreamingUploader, UploadOptions, DATA_FIELD};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::sync::Arc;

/// Drains the body and answers 200
struct SinkDispatcher;

#[async_trait]
impl RequestDispatcher for SinkDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, ClientError> {
        if let RequestBody::Stream(mut reader) = request.body {
            while let Some(chunk) = reader.next().await {
                black_box(chunk.map_err(|e| ClientError::RequestError(e.to_string()))?);
            }
        }
        Ok(DispatchResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        })
    }
}

fn benchmark_framing(c: &mut Criterion) {
    let framer = MultipartFramer::new();

    c.bench_function("frame_part", |b| {
        b.iter(|| {
            framer
                .frame(DATA_FIELD, black_box("photos/2024/holiday/beach.jpg"), 1 << 30)
                .unwrap()
        });
    });
}

fn benchmark_encryption(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_encrypt");
    let encryptor = StreamEncryptor::from_keys(&KeyMaterial::derive(&[1u8; 32]).unwrap());

    for size in [1024, 100 * 1024, 1024 * 1024].iter() {
        let data = vec![0u8; *size];
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut writer = encryptor.encrypting_writer().unwrap();
                writer.write(black_box(&data)).unwrap();
                writer.finish().unwrap()
            });
        });
    }

    group.finish();
}

fn benchmark_upload_sizes(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("upload_sizes");

    let plain = StreamingUploader::new(
        Arc::new(SinkDispatcher),
        Arc::new(PassthroughEncryptor),
        Arc::new(PlainPathCipher),
        UploadOptions {
            chunk_size: 64 * 1024,
            pipe_capacity: 4,
            file_mode: 0o664,
        },
    );
    let keys = KeyMaterial::derive(&[2u8; 32]).unwrap();
    let encrypted = StreamingUploader::new(
        Arc::new(SinkDispatcher),
        Arc::new(StreamEncryptor::from_keys(&keys)),
        Arc::new(DeterministicPathCipher::from_keys(&keys)),
        UploadOptions {
            chunk_size: 64 * 1024,
            pipe_capacity: 4,
            file_mode: 0o664,
        },
    );

    for size in [1024, 10 * 1024, 100 * 1024, 1024 * 1024].iter() {
        let data = vec![0u8; *size];
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("plain", size), size, |b, _| {
            b.to_async(&runtime)
                .iter(|| async { plain.upload("bench/file.bin", &data[..]).await.unwrap() });
        });
        group.bench_with_input(BenchmarkId::new("encrypted", size), size, |b, _| {
            b.to_async(&runtime)
                .iter(|| async { encrypted.upload("bench/file.bin", &data[..]).await.unwrap() });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_framing,
    benchmark_encryption,
    benchmark_upload_sizes
);
criterion_main!(benches);
