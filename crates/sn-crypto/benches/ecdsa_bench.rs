// SPDX-License-Identifier: AGPL-3.0-only

use criterion::{criterion_group, criterion_main, Criterion};
use sn_crypto::{sha256_32, sign_message, verify_message, OperatorKeypair};

fn bench_sign_verify(c: &mut Criterion) {
    let kp = OperatorKeypair::from_secret_bytes(&sha256_32(b"bench:sk")).expect("seckey");
    let msg = b"127.0.0.1:8884164000000000aabbccddeeff70208";
    let sig = sign_message(msg, &kp);
    let pk = kp.public_bytes();

    c.bench_function("ecdsa_sign_message", |b| {
        b.iter(|| sign_message(msg, &kp));
    });
    c.bench_function("ecdsa_verify_message", |b| {
        b.iter(|| verify_message(&pk, &sig, msg));
    });
}

criterion_group!(benches, bench_sign_verify);
criterion_main!(benches);
