//! Persistence of the room model.
//!
//! Every room is kept in its own record under `rooms/`, named after a hash of
//! its id, next to an index holding the account, the room ids and the space
//! index. Saving a delta rewrites the records of the rooms it changed and
//! the index, never the other rooms.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use matrix_sdk::ruma::{OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::{
    model::{PersistedModel, Room, RoomModel, SpaceIndex},
    store::{StoreCipher, StoreError, record::RecordFile},
    utils::get_path,
};

const ROOMS_DIR: &str = "rooms";
const INDEX_FILE: &str = "index.enc";

/// Current schema of the room records.
pub const ROOMS_SCHEMA: u32 = 2;

#[derive(Serialize, Deserialize)]
struct RoomIndex {
    user_id: OwnedUserId,
    rooms: BTreeSet<OwnedRoomId>,
    spaces: SpaceIndex,
}

fn record_name(room_id: &OwnedRoomId) -> String {
    format!("{}.enc", hex::encode(Sha256::digest(room_id.as_bytes())))
}

/// Room store.
///
/// The records of the rooms changed by a delta are written before the sync
/// cursor moves past it.
pub struct RoomStore {
    dir: PathBuf,
    cipher: StoreCipher,
    index: RecordFile,
}

impl RoomStore {
    pub fn new(dir: &Path, cipher: StoreCipher) -> Self {
        let dir = get_path(dir, ROOMS_DIR);
        RoomStore {
            index: RecordFile::new(&dir, INDEX_FILE, cipher.clone()),
            dir,
            cipher,
        }
    }

    fn room_file(&self, room_id: &OwnedRoomId) -> RecordFile {
        RecordFile::new(&self.dir, &record_name(room_id), self.cipher.clone())
    }

    fn check_schema(found: u32) -> Result<(), StoreError> {
        if found == ROOMS_SCHEMA {
            return Ok(());
        }
        Err(StoreError::UnsupportedSchema {
            found,
            supported: ROOMS_SCHEMA,
        })
    }

    /// Loads the model saved for `user_id`.
    ///
    /// Returns `None` if nothing was saved or if the records belong to
    /// another account.
    pub async fn load(&self, user_id: &OwnedUserId) -> Result<Option<PersistedModel>, StoreError> {
        let index: RoomIndex = match self.index.read().await? {
            None => {
                debug!("no stored rooms");
                return Ok(None);
            }
            Some((schema, data)) => {
                Self::check_schema(schema)?;
                serde_json::from_value(data)
                    .map_err(|e| StoreError::Corrupted(format!("invalid room index: {}", e)))?
            }
        };

        if index.user_id != *user_id {
            warn!("ignore stored rooms of {}", index.user_id);
            return Ok(None);
        }

        let mut rooms = BTreeMap::new();
        for room_id in index.rooms {
            let file = self.room_file(&room_id);
            let Some((schema, data)) = file.read().await? else {
                return Err(StoreError::Corrupted(format!("missing record of {}", room_id)));
            };
            Self::check_schema(schema)?;
            let room: Room = serde_json::from_value(data)
                .map_err(|e| StoreError::Corrupted(format!("invalid record of {}: {}", room_id, e)))?;
            rooms.insert(room_id, room);
        }

        info!("loaded {} stored rooms", rooms.len());
        Ok(Some(PersistedModel {
            rooms,
            spaces: index.spaces,
        }))
    }

    /// Writes the records of `changed` rooms, then the index.
    ///
    /// A room is listed in the index only once its record exists.
    pub async fn save(
        &self,
        user_id: &OwnedUserId,
        model: &RoomModel,
        changed: &BTreeSet<OwnedRoomId>,
    ) -> Result<(), StoreError> {
        for room_id in changed {
            let Some(room) = model.room(room_id) else {
                continue;
            };
            self.room_file(room_id).write(ROOMS_SCHEMA, room).await?;
        }

        let index = RoomIndex {
            user_id: user_id.clone(),
            rooms: model.room_ids().cloned().collect(),
            spaces: model.spaces().clone(),
        };
        self.index.write(ROOMS_SCHEMA, &index).await?;
        debug!("saved {} changed rooms", changed.len());
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("cleared room store");
        Ok(())
    }
}
