// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use divan::counter::ItemsCount;
use murmur::message::Message;
use murmur::{NodeId, Topology};

fn main() {
    // run registered benchmarks.
    divan::main();
}

fn node_ids(count: usize) -> Vec<NodeId> {
    (0..count).map(|i| NodeId::from(format!("n{i}"))).collect()
}

#[divan::bench(args = [10, 100, 1000])]
fn balanced(bencher: divan::Bencher, count: usize) {
    bencher
        .counter(ItemsCount::new(count))
        .with_inputs(|| node_ids(count))
        .bench_refs(|nodes| Topology::balanced(nodes, 4).unwrap());
}

#[divan::bench(args = [10, 100, 1000])]
fn star(bencher: divan::Bencher, count: usize) {
    bencher
        .counter(ItemsCount::new(count))
        .with_inputs(|| node_ids(count))
        .bench_refs(|nodes| Topology::star(nodes));
}

#[divan::bench(args = [10, 100, 1000])]
fn hops_from_root(bencher: divan::Bencher, count: usize) {
    let nodes = node_ids(count);
    let topology = Topology::balanced(&nodes, 4).unwrap();
    bencher
        .counter(ItemsCount::new(count))
        .bench(|| topology.hops_from(&nodes[0]));
}

#[divan::bench]
fn parse_broadcast(bencher: divan::Bencher) {
    let line = r#"{"src":"n1","dest":"n0","body":{"type":"broadcast","msg_id":17,"message":42}}"#;
    bencher
        .counter(ItemsCount::new(1_usize))
        .bench(|| Message::from_json(divan::black_box(line)).unwrap());
}
