//! Store telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct StoreInstruments {
    inserts: Counter<u64>,
    malformed: Counter<u64>,
    subscriber_drops: Counter<u64>,
    barrels_allocated: Counter<u64>,
    barrels_evicted: Counter<u64>,
    persist_outcomes: Counter<u64>,
    persist_duration_seconds: Histogram<f64>,
    persist_rows: Histogram<u64>,
    control_drops: Counter<u64>,
    spilled: Counter<u64>,
    spill_discarded: Counter<u64>,
}

fn instruments() -> &'static StoreInstruments {
    static INSTRUMENTS: OnceLock<StoreInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("logbarrel.store");
        StoreInstruments {
            inserts: meter
                .u64_counter("logbarrel.store.inserts")
                .with_description("Envelopes accepted by a store")
                .init(),
            malformed: meter
                .u64_counter("logbarrel.store.malformed")
                .with_description("Envelopes dropped for a missing stream key")
                .init(),
            subscriber_drops: meter
                .u64_counter("logbarrel.store.subscriber.drops")
                .with_description("Envelopes dropped because a subscriber queue was full")
                .init(),
            barrels_allocated: meter
                .u64_counter("logbarrel.store.barrels.allocated")
                .with_description("Barrels allocated for new keys")
                .init(),
            barrels_evicted: meter
                .u64_counter("logbarrel.store.barrels.evicted")
                .with_description("Barrels removed by the garbage collection sweep")
                .init(),
            persist_outcomes: meter
                .u64_counter("logbarrel.store.persist.outcomes")
                .with_description("Persistence attempt outcomes")
                .init(),
            persist_duration_seconds: meter
                .f64_histogram("logbarrel.store.persist.duration")
                .with_description("Persistence write duration")
                .with_unit("s")
                .init(),
            persist_rows: meter
                .u64_histogram("logbarrel.store.persist.rows")
                .with_description("Envelopes written per persistence attempt")
                .init(),
            control_drops: meter
                .u64_counter("logbarrel.store.control.drops")
                .with_description("Control operations dropped because the queue was full")
                .init(),
            spilled: meter
                .u64_counter("logbarrel.store.spill.records")
                .with_description("Envelopes written to the spill file")
                .init(),
            spill_discarded: meter
                .u64_counter("logbarrel.store.spill.discarded")
                .with_description("Envelopes discarded from a full garbage buffer")
                .init(),
        }
    })
}

pub fn record_insert(store: &'static str) {
    instruments()
        .inserts
        .add(1, &[KeyValue::new("store", store)]);
}

pub fn record_malformed(store: &'static str) {
    instruments()
        .malformed
        .add(1, &[KeyValue::new("store", store)]);
}

pub fn record_subscriber_drops(store: &'static str, dropped: u64) {
    if dropped > 0 {
        instruments()
            .subscriber_drops
            .add(dropped, &[KeyValue::new("store", store)]);
    }
}

pub fn record_barrel_allocated(store: &'static str) {
    instruments()
        .barrels_allocated
        .add(1, &[KeyValue::new("store", store)]);
}

pub fn record_barrel_evicted(store: &'static str) {
    instruments()
        .barrels_evicted
        .add(1, &[KeyValue::new("store", store)]);
}

pub fn record_persist(store: &'static str, outcome: &'static str, duration_seconds: f64, rows: u64) {
    let i = instruments();
    let attrs = [
        KeyValue::new("store", store),
        KeyValue::new("outcome", outcome),
    ];
    i.persist_outcomes.add(1, &attrs);
    i.persist_duration_seconds.record(duration_seconds, &attrs);
    i.persist_rows.record(rows, &attrs);
}

pub fn record_control_drop(op: &'static str) {
    instruments()
        .control_drops
        .add(1, &[KeyValue::new("op", op)]);
}

pub fn record_spilled(records: u64) {
    instruments().spilled.add(records, &[]);
}

pub fn record_spill_discarded(records: u64) {
    instruments().spill_discarded.add(records, &[]);
}
