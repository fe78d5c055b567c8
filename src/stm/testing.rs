use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::stm::codec::{SnapshotHeader, StmSnapshot};
use crate::stm::state_machine::{StateMachineHooks, StateMachineResult};

// Payload version stamped on snapshots produced by the fakes below.
pub const TESTING_PAYLOAD_VERSION: i8 = 1;

// A fake implementation of the StateMachineHooks trait which records hook
// invocations so tests can assert on scheduling behavior.
pub struct RecordingHooks {
    pub payload: Bytes,
    pub snapshots_taken: i64,
    pub snapshots_applied: i64,
    pub last_applied: Option<SnapshotHeader>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        RecordingHooks {
            payload: Bytes::from_static(b"recorded-state"),
            snapshots_taken: 0,
            snapshots_applied: 0,
            last_applied: None,
        }
    }
}

#[async_trait]
impl StateMachineHooks for RecordingHooks {
    async fn take_snapshot(&mut self, covered_offset: i64) -> StmSnapshot {
        self.snapshots_taken += 1;
        StmSnapshot::create(TESTING_PAYLOAD_VERSION, covered_offset, self.payload.clone())
    }

    async fn apply_snapshot(
        &mut self,
        header: &SnapshotHeader,
        _data: Bytes,
    ) -> StateMachineResult {
        self.snapshots_applied += 1;
        self.last_applied = Some(header.clone());
        Ok(())
    }
}

// A minimal derived state: byte keys mapped to byte values, with a
// length-prefixed snapshot payload.
pub struct MapState {
    data: HashMap<Bytes, Bytes>,
}

impl MapState {
    pub fn new() -> Self {
        MapState {
            data: HashMap::new(),
        }
    }

    pub fn get(&self, key: &Bytes) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    pub fn set(&mut self, key: Bytes, value: Bytes) {
        self.data.insert(key, value);
    }

    fn encode_entries(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for (key, value) in &self.data {
            buf.put_u32(key.len() as u32);
            buf.extend_from_slice(key);
            buf.put_u32(value.len() as u32);
            buf.extend_from_slice(value);
        }
        buf.freeze()
    }

    fn decode_entries(mut data: Bytes) -> Result<HashMap<Bytes, Bytes>, String> {
        let mut entries = HashMap::new();
        while data.has_remaining() {
            let key = Self::decode_blob(&mut data)?;
            let value = Self::decode_blob(&mut data)?;
            entries.insert(key, value);
        }
        Ok(entries)
    }

    fn decode_blob(data: &mut Bytes) -> Result<Bytes, String> {
        if data.remaining() < 4 {
            return Err("Truncated map snapshot".to_string());
        }
        let len = data.get_u32() as usize;
        if data.remaining() < len {
            return Err(format!(
                "Map snapshot claims {} bytes, {} left",
                len,
                data.remaining()
            ));
        }
        Ok(data.split_to(len))
    }
}

#[async_trait]
impl StateMachineHooks for MapState {
    async fn take_snapshot(&mut self, covered_offset: i64) -> StmSnapshot {
        StmSnapshot::create(TESTING_PAYLOAD_VERSION, covered_offset, self.encode_entries())
    }

    async fn apply_snapshot(
        &mut self,
        _header: &SnapshotHeader,
        data: Bytes,
    ) -> StateMachineResult {
        self.data = Self::decode_entries(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_map_state_get_set() {
        let mut state = MapState::new();

        let k = Bytes::from("some-key");
        assert!(state.get(&k).is_none());

        let v = Bytes::from("some-value");
        state.set(k.clone(), v.clone());
        assert_eq!(v, state.get(&k).unwrap());
    }

    #[tokio::test]
    async fn test_map_state_snapshot_round_trip() {
        let k1 = Bytes::from("key1");
        let v1 = Bytes::from("value1");
        let k2 = Bytes::from("key2");
        let v2 = Bytes::from("value2");

        let mut state = MapState::new();
        state.set(k1.clone(), v1.clone());
        let snapshot = state.take_snapshot(7).await;
        assert_eq!(7, snapshot.header.offset);

        let mut other = MapState::new();
        other.set(k2.clone(), v2.clone());
        other
            .apply_snapshot(&snapshot.header, snapshot.data)
            .await
            .expect("apply should succeed");

        // Restoring replaces the previous contents wholesale.
        assert_eq!(v1, other.get(&k1).unwrap());
        assert!(other.get(&k2).is_none());
    }

    #[tokio::test]
    async fn test_map_state_rejects_malformed_snapshot() {
        let mut state = MapState::new();
        let header = SnapshotHeader {
            offset: 0,
            version: TESTING_PAYLOAD_VERSION,
            snapshot_size: 3,
        };
        let gibberish = Bytes::from_static(&[1, 2, 3]);
        assert!(state.apply_snapshot(&header, gibberish).await.is_err());
    }
}
