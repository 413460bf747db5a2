//! ClientHello SNI/ALPN extraction benchmarks against the bare TLS
//! Handshake message a QUIC CRYPTO stream carries (no 5-byte record header,
//! unlike the TCP-era TLS record these benchmarks used to build).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sniproxy_core::quic::tls::{extract_alpn, extract_sni};

const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;
const ALPN_EXTENSION: u16 = 0x0010;

fn sni_extension(host: &str) -> Vec<u8> {
    let mut ext = Vec::new();
    ext.extend_from_slice(&SNI_EXTENSION.to_be_bytes());
    let list_len = 3 + host.len();
    let ext_body_len = 2 + list_len;
    ext.extend_from_slice(&(ext_body_len as u16).to_be_bytes());
    ext.extend_from_slice(&(list_len as u16).to_be_bytes());
    ext.push(0x00);
    ext.extend_from_slice(&(host.len() as u16).to_be_bytes());
    ext.extend_from_slice(host.as_bytes());
    ext
}

fn alpn_extension(protocols: &[&[u8]]) -> Vec<u8> {
    let mut list = Vec::new();
    for p in protocols {
        list.push(p.len() as u8);
        list.extend_from_slice(p);
    }
    let mut ext = Vec::new();
    ext.extend_from_slice(&ALPN_EXTENSION.to_be_bytes());
    let ext_body_len = 2 + list.len();
    ext.extend_from_slice(&(ext_body_len as u16).to_be_bytes());
    ext.extend_from_slice(&(list.len() as u16).to_be_bytes());
    ext.extend_from_slice(&list);
    ext
}

fn client_hello_with_extensions(extensions: &[u8]) -> Vec<u8> {
    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0u8; 32]);
    body.push(0x00);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    body.push(0x01);
    body.push(0x00);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(extensions);

    let mut msg = vec![CLIENT_HELLO];
    let len = body.len() as u32;
    msg.push((len >> 16) as u8);
    msg.push((len >> 8) as u8);
    msg.push(len as u8);
    msg.extend_from_slice(&body);
    msg
}

fn bench_sni_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("sni_extraction");

    for domain in &[
        "example.com",
        "subdomain.example.com",
        "very.long.subdomain.example.com",
    ] {
        let msg = client_hello_with_extensions(&sni_extension(domain));
        group.bench_with_input(BenchmarkId::from_parameter(domain), &msg, |b, msg| {
            b.iter(|| extract_sni(black_box(msg)).unwrap());
        });
    }

    group.finish();
}

fn bench_alpn_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("alpn_extraction");

    for protocol in &[b"h2".as_slice(), b"h3".as_slice(), b"http/1.1".as_slice()] {
        let msg = client_hello_with_extensions(&alpn_extension(&[protocol]));
        let protocol_name = std::str::from_utf8(protocol).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(protocol_name), &msg, |b, msg| {
            b.iter(|| extract_alpn(black_box(msg)).unwrap());
        });
    }

    group.finish();
}

fn bench_sni_with_many_extensions(c: &mut Criterion) {
    let domain = "production.api.service.company.example.com";
    let mut extensions = sni_extension(domain);
    extensions.extend_from_slice(&alpn_extension(&[b"h3"]));
    let msg = client_hello_with_extensions(&extensions);

    c.bench_function("sni_with_alpn_present", |b| {
        b.iter(|| extract_sni(black_box(&msg)).unwrap());
    });
}

fn bench_error_cases(c: &mut Criterion) {
    let mut group = c.benchmark_group("error_handling");

    let truncated = vec![CLIENT_HELLO, 0x00, 0x00, 0x10];
    group.bench_function("truncated_message", |b| {
        b.iter(|| {
            let _ = extract_sni(black_box(&truncated));
        });
    });

    let no_sni = client_hello_with_extensions(&alpn_extension(&[b"h3"]));
    group.bench_function("no_sni_present", |b| {
        b.iter(|| {
            let _ = extract_sni(black_box(&no_sni));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_sni_extraction,
    bench_alpn_extraction,
    bench_sni_with_many_extensions,
    bench_error_cases
);
criterion_main!(benches);
