use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::common::info_hash::InfoHash;

use super::store::{SessionStore, SessionStoreError, SessionStoreExt};

const TORRENTS_KEY: &str = "torrents";
const TORRENT_LIST_VERSION: u32 = 2;

/// Where a torrent came from when it was added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentOrigin {
    File,
    Magnet,
}

/// One entry of the persisted torrent index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentListEntry {
    pub info_hash: String,
    pub source: TorrentOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magnet_uri: Option<String>,
    pub added_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TorrentList {
    version: u32,
    torrents: Vec<TorrentListEntry>,
}

/// Persisted per-torrent runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentStateData {
    pub user_state: UserState,
    pub storage_key: String,
    pub queue_position: u32,
    pub bitfield_hex: String,
    pub uploaded: u64,
    pub downloaded: u64,
    pub file_priorities: HashMap<u32, String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserState {
    Active,
    Stopped,
}

/// Persistence facade over the session store for the engine's records.
pub struct SessionPersistence<'a> {
    store: &'a dyn SessionStore,
}

impl<'a> SessionPersistence<'a> {
    pub fn new(store: &'a dyn SessionStore) -> SessionPersistence<'a> {
        SessionPersistence { store }
    }

    /// Loads the torrent index; an absent or unreadable index is an empty one.
    pub fn load_torrent_list(&self) -> Vec<TorrentListEntry> {
        match self.store.get_json::<TorrentList>(TORRENTS_KEY) {
            Ok(Some(list)) => list.torrents,
            _ => Vec::new(),
        }
    }

    /// Adds or replaces an index entry and writes the index back.
    pub fn upsert_torrent_entry(
        &self,
        entry: TorrentListEntry,
    ) -> Result<(), SessionStoreError> {
        let mut torrents = self.load_torrent_list();
        torrents.retain(|t| t.info_hash != entry.info_hash);
        torrents.push(entry);
        self.store.set_json(
            TORRENTS_KEY,
            &TorrentList {
                version: TORRENT_LIST_VERSION,
                torrents,
            },
        )
    }

    /// Removes a torrent's index entry and every per-torrent key.
    pub fn remove_torrent(&self, info_hash: &InfoHash) -> Result<(), SessionStoreError> {
        let hex = info_hash.to_hex();
        let mut torrents = self.load_torrent_list();
        torrents.retain(|t| t.info_hash != hex);
        self.store.set_json(
            TORRENTS_KEY,
            &TorrentList {
                version: TORRENT_LIST_VERSION,
                torrents,
            },
        )?;
        self.store.delete(&Self::state_key(info_hash))?;
        self.store.delete(&Self::torrent_file_key(info_hash))?;
        self.store.delete(&Self::info_dict_key(info_hash))
    }

    pub fn save_state(
        &self,
        info_hash: &InfoHash,
        state: &TorrentStateData,
    ) -> Result<(), SessionStoreError> {
        self.store.set_json(&Self::state_key(info_hash), state)
    }

    pub fn load_state(
        &self,
        info_hash: &InfoHash,
    ) -> Result<Option<TorrentStateData>, SessionStoreError> {
        self.store.get_json(&Self::state_key(info_hash))
    }

    /// Stores the raw `.torrent` bytes, base64-wrapped.
    pub fn save_torrent_file(
        &self,
        info_hash: &InfoHash,
        bytes: &[u8],
    ) -> Result<(), SessionStoreError> {
        self.store
            .set(&Self::torrent_file_key(info_hash), base64::encode(bytes).as_bytes())
    }

    pub fn load_torrent_file(
        &self,
        info_hash: &InfoHash,
    ) -> Result<Option<Vec<u8>>, SessionStoreError> {
        Self::decode_blob(self.store.get(&Self::torrent_file_key(info_hash))?)
    }

    /// Stores the raw bencoded info dict, base64-wrapped.
    pub fn save_info_dict(
        &self,
        info_hash: &InfoHash,
        bytes: &[u8],
    ) -> Result<(), SessionStoreError> {
        self.store
            .set(&Self::info_dict_key(info_hash), base64::encode(bytes).as_bytes())
    }

    pub fn load_info_dict(
        &self,
        info_hash: &InfoHash,
    ) -> Result<Option<Vec<u8>>, SessionStoreError> {
        Self::decode_blob(self.store.get(&Self::info_dict_key(info_hash))?)
    }

    /// Persists the DHT node identity and routing table snapshot.
    pub fn save_dht_state(&self, state: &DhtStateData) -> Result<(), SessionStoreError> {
        self.store.set_json("dht:state", state)
    }

    pub fn load_dht_state(&self) -> Result<Option<DhtStateData>, SessionStoreError> {
        self.store.get_json("dht:state")
    }

    fn decode_blob(raw: Option<Vec<u8>>) -> Result<Option<Vec<u8>>, SessionStoreError> {
        match raw {
            Some(encoded) => {
                let text = String::from_utf8_lossy(&encoded).to_string();
                match base64::decode(text.trim()) {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(_) => Ok(None),
                }
            }
            None => Ok(None),
        }
    }

    fn state_key(info_hash: &InfoHash) -> String {
        format!("torrent:{}:state", info_hash.to_hex())
    }

    fn torrent_file_key(info_hash: &InfoHash) -> String {
        format!("torrent:{}:torrentfile", info_hash.to_hex())
    }

    fn info_dict_key(info_hash: &InfoHash) -> String {
        format!("torrent:{}:infodict", info_hash.to_hex())
    }
}

/// Persisted DHT identity and routing table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhtStateData {
    pub node_id: String,
    pub routing_table: DhtRoutingTableData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtRoutingTableData {
    pub nodes: Vec<DhtNodeData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtNodeData {
    pub id: String,
    pub host: String,
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::MemorySessionStore;

    #[test]
    fn test_empty_store_has_empty_list() {
        let store = MemorySessionStore::new();
        let persistence = SessionPersistence::new(&store);
        assert!(persistence.load_torrent_list().is_empty());
    }

    #[test]
    fn test_torrent_list_roundtrip() {
        let store = MemorySessionStore::new();
        let persistence = SessionPersistence::new(&store);

        persistence.upsert_torrent_entry(sample_entry("aa")).unwrap();
        persistence.upsert_torrent_entry(sample_entry("bb")).unwrap();

        let list = persistence.load_torrent_list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].info_hash, "aa".repeat(20));
    }

    #[test]
    fn test_upsert_replaces_existing_entry() {
        let store = MemorySessionStore::new();
        let persistence = SessionPersistence::new(&store);

        persistence.upsert_torrent_entry(sample_entry("aa")).unwrap();
        let mut replacement = sample_entry("aa");
        replacement.added_at = 99;
        persistence.upsert_torrent_entry(replacement).unwrap();

        let list = persistence.load_torrent_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].added_at, 99);
    }

    #[test]
    fn test_state_roundtrip() {
        let store = MemorySessionStore::new();
        let persistence = SessionPersistence::new(&store);
        let info_hash = InfoHash::new([0xaa; 20]);

        let mut priorities = HashMap::new();
        priorities.insert(1, "skip".to_string());
        let state = TorrentStateData {
            user_state: UserState::Active,
            storage_key: "default".to_string(),
            queue_position: 0,
            bitfield_hex: "f0".to_string(),
            uploaded: 10,
            downloaded: 20,
            file_priorities: priorities,
            updated_at: 1234,
        };

        persistence.save_state(&info_hash, &state).unwrap();
        assert_eq!(persistence.load_state(&info_hash).unwrap(), Some(state));
    }

    #[test]
    fn test_blob_roundtrip() {
        let store = MemorySessionStore::new();
        let persistence = SessionPersistence::new(&store);
        let info_hash = InfoHash::new([0x01; 20]);

        persistence
            .save_torrent_file(&info_hash, &[0, 1, 2, 255])
            .unwrap();
        assert_eq!(
            persistence.load_torrent_file(&info_hash).unwrap(),
            Some(vec![0, 1, 2, 255])
        );

        persistence.save_info_dict(&info_hash, b"d4:spam4:eggse").unwrap();
        assert_eq!(
            persistence.load_info_dict(&info_hash).unwrap(),
            Some(b"d4:spam4:eggse".to_vec())
        );
    }

    #[test]
    fn test_remove_torrent_clears_all_keys() {
        let store = MemorySessionStore::new();
        let persistence = SessionPersistence::new(&store);
        let info_hash = InfoHash::new([0xaa; 20]);

        persistence.upsert_torrent_entry(sample_entry("aa")).unwrap();
        persistence.save_torrent_file(&info_hash, b"x").unwrap();

        persistence.remove_torrent(&info_hash).unwrap();

        assert!(persistence.load_torrent_list().is_empty());
        assert_eq!(persistence.load_torrent_file(&info_hash).unwrap(), None);
    }

    #[test]
    fn test_dht_state_roundtrip() {
        let store = MemorySessionStore::new();
        let persistence = SessionPersistence::new(&store);

        let state = DhtStateData {
            node_id: "ab".repeat(20),
            routing_table: DhtRoutingTableData {
                nodes: vec![DhtNodeData {
                    id: "cd".repeat(20),
                    host: "1.2.3.4".to_string(),
                    port: 6881,
                }],
            },
        };

        persistence.save_dht_state(&state).unwrap();
        assert_eq!(persistence.load_dht_state().unwrap(), Some(state));
    }

    // Auxiliary functions

    fn sample_entry(hex_byte: &str) -> TorrentListEntry {
        TorrentListEntry {
            info_hash: hex_byte.repeat(20),
            source: TorrentOrigin::Magnet,
            magnet_uri: Some(format!("magnet:?xt=urn:btih:{}", hex_byte.repeat(20))),
            added_at: 1,
        }
    }
}
