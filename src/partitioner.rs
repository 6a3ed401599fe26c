//! Choosing a partition for a record.
use std::{
    fmt::Debug,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::error::{Error, KafkaCode, Result};

/// Picks which partition of a topic a record goes to.
///
/// The returned value is an index into the topic's partition ids sorted
/// in ascending order, so it must be in `0..num_partitions`.
pub trait Partitioner: Debug + Send + Sync {
    fn partition(&self, key: Option<&[u8]>, num_partitions: i32) -> Result<i32>;
}

fn no_partitions() -> Error {
    Error::KafkaError(KafkaCode::UnknownTopicOrPartition)
}

/// Same key, same partition. Records without a key go to the first
/// partition.
#[derive(Clone, Copy, Debug, Default)]
pub struct HashPartitioner;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

// 32 bit FNV-1a
fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

impl Partitioner for HashPartitioner {
    fn partition(&self, key: Option<&[u8]>, num_partitions: i32) -> Result<i32> {
        if num_partitions <= 0 {
            return Err(no_partitions());
        }
        match key {
            None => Ok(0),
            Some(key) => Ok((fnv1a(key) % num_partitions as u32) as i32),
        }
    }
}

/// Always the same partition index.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedPartitioner(pub i32);

impl Partitioner for FixedPartitioner {
    fn partition(&self, _key: Option<&[u8]>, num_partitions: i32) -> Result<i32> {
        if self.0 < 0 || self.0 >= num_partitions {
            return Err(no_partitions());
        }
        Ok(self.0)
    }
}

/// Cycles through the partitions, ignoring the key.
#[derive(Debug, Default)]
pub struct RoundRobinPartitioner {
    next: AtomicUsize,
}

impl Partitioner for RoundRobinPartitioner {
    fn partition(&self, _key: Option<&[u8]>, num_partitions: i32) -> Result<i32> {
        if num_partitions <= 0 {
            return Err(no_partitions());
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Ok((n % num_partitions as usize) as i32)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fnv_known_values() {
        assert_eq!(fnv1a(b""), 0x811c9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn hash_is_stable_per_key() {
        let p = HashPartitioner;
        let first = p.partition(Some(b"user-42"), 8).unwrap();
        for _ in 0..10 {
            assert_eq!(p.partition(Some(b"user-42"), 8).unwrap(), first);
        }
        assert!((0..8).contains(&first));
        assert_eq!(p.partition(None, 8).unwrap(), 0);
        assert!(p.partition(Some(b"x"), 0).is_err());
    }

    #[test]
    fn fixed_must_exist() {
        assert_eq!(FixedPartitioner(2).partition(None, 3).unwrap(), 2);
        assert!(FixedPartitioner(3).partition(None, 3).is_err());
    }

    #[test]
    fn round_robin_cycles() {
        let p = RoundRobinPartitioner::default();
        let picked: Vec<i32> = (0..5).map(|_| p.partition(None, 3).unwrap()).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1]);
    }
}
