// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Composite keys, their entity types, and the 64-bit fingerprints used to
//! index them during conflict detection.

use serde::{Deserialize, Serialize};

/// The tables of the store. Every [Key] belongs to exactly one.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Kv,
    Warehouse,
    District,
    Customer,
    Item,
    Stock,
    History,
    NewOrder,
    Order,
    OrderLine,
}

impl EntityType {
    pub const ALL: [EntityType; 10] = [
        EntityType::Kv,
        EntityType::Warehouse,
        EntityType::District,
        EntityType::Customer,
        EntityType::Item,
        EntityType::Stock,
        EntityType::History,
        EntityType::NewOrder,
        EntityType::Order,
        EntityType::OrderLine,
    ];

    fn keyspace(&self) -> u64 {
        *self as u64 + 1
    }
}

/// A composite key. The variant determines the [EntityType]; the fields are
/// the table's primary key columns in order.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    Kv { shard: u32, key: String },
    Warehouse { w: i64 },
    District { w: i64, d: i64 },
    Customer { w: i64, d: i64, c: i64 },
    Item { i: i64 },
    Stock { w: i64, i: i64 },
    History { w: i64, d: i64, c: i64, date: i64 },
    NewOrder { w: i64, d: i64, o: i64 },
    Order { w: i64, d: i64, o: i64 },
    OrderLine { w: i64, d: i64, o: i64, number: i64 },
}

impl Key {
    pub fn entity(&self) -> EntityType {
        match self {
            Key::Kv { .. } => EntityType::Kv,
            Key::Warehouse { .. } => EntityType::Warehouse,
            Key::District { .. } => EntityType::District,
            Key::Customer { .. } => EntityType::Customer,
            Key::Item { .. } => EntityType::Item,
            Key::Stock { .. } => EntityType::Stock,
            Key::History { .. } => EntityType::History,
            Key::NewOrder { .. } => EntityType::NewOrder,
            Key::Order { .. } => EntityType::Order,
            Key::OrderLine { .. } => EntityType::OrderLine,
        }
    }

    /// Hashes the key into the 64-bit fingerprint used by the conflict
    /// trackers. Fingerprints are only compared within one entity type, but
    /// the entity type seeds the hash anyway so that equal column tuples in
    /// different tables don't collide when mixed into a single index.
    pub fn fingerprint(&self) -> u64 {
        let mut h = KeyHasher::new(self.entity().keyspace());
        match self {
            Key::Kv { shard, key } => {
                h.write_u64(*shard as u64);
                h.write_bytes(key.as_bytes());
            }
            Key::Warehouse { w } => h.write_i64s(&[*w]),
            Key::District { w, d } => h.write_i64s(&[*w, *d]),
            Key::Customer { w, d, c } => h.write_i64s(&[*w, *d, *c]),
            Key::Item { i } => h.write_i64s(&[*i]),
            Key::Stock { w, i } => h.write_i64s(&[*w, *i]),
            Key::History { w, d, c, date } => h.write_i64s(&[*w, *d, *c, *date]),
            Key::NewOrder { w, d, o } => h.write_i64s(&[*w, *d, *o]),
            Key::Order { w, d, o } => h.write_i64s(&[*w, *d, *o]),
            Key::OrderLine { w, d, o, number } => h.write_i64s(&[*w, *d, *o, *number]),
        }
        h.finish()
    }
}

const FNV_OFFSET: u64 = 14695981039346656037;
const FNV_PRIME: u64 = 1099511628211;

// FNV-1a over the key columns, finished with the murmur3 64-bit avalanche so
// that nearby integer keys spread across the whole table.
struct KeyHasher(u64);

impl KeyHasher {
    fn new(keyspace: u64) -> Self {
        let mut h = KeyHasher(FNV_OFFSET);
        h.write_u64(keyspace);
        h
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= *b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes())
    }

    fn write_i64s(&mut self, vs: &[i64]) {
        for v in vs {
            self.write_u64(*v as u64)
        }
    }

    fn finish(&self) -> u64 {
        let mut k = self.0;
        k ^= k >> 33;
        k = k.wrapping_mul(0xff51afd7ed558ccd);
        k ^= k >> 33;
        k = k.wrapping_mul(0xc4ceb9fe1a85ec53);
        k ^= k >> 33;
        k
    }
}
