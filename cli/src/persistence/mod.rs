use parking_lot::Mutex;
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{
    crypto::{aes256_gcm_decrypt, aes256_gcm_encrypt, keys::KeyStore, Aes256GcmEncryptedData},
    error::{KeyError, StoreError},
    primitives::{AutoZeroedByteArray, Connection, KeyTag},
    store::ConnectionStore,
    utils::{b64_decode, b64_encode},
};

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, String> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| format!("couldn't parse {}: {}", path.display(), err)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(format!("couldn't read {}: {}", path.display(), err)),
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| format!("couldn't create {}: {}", parent.display(), err))?;
    }

    let json = serde_json::to_vec_pretty(value).map_err(|err| err.to_string())?;
    let staging = path.with_extension("json.tmp");
    private_file(&staging)
        .and_then(|mut file| file.write_all(&json))
        .map_err(|why| format!("couldn't write to {}: {}", staging.display(), why))?;
    fs::rename(&staging, path).map_err(|why| format!("couldn't replace {}: {}", path.display(), why))
}

/// Creates `path` readable by the owner only.
#[cfg(unix)]
fn private_file(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    remove_if_present(path)?;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn private_file(path: &Path) -> io::Result<fs::File> {
    remove_if_present(path)?;
    fs::File::create(path)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Connections kept as one JSON array in `connections.json`.
pub struct FileConnectionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileConnectionStore {
    pub fn new(data_dir: &Path) -> FileConnectionStore {
        FileConnectionStore {
            path: data_dir.join("connections.json"),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<Vec<Connection>, StoreError> {
        read_json(&self.path)
            .map(Option::unwrap_or_default)
            .map_err(StoreError::Unavailable)
    }
}

impl ConnectionStore for FileConnectionStore {
    fn save(&self, connection: &Connection) -> Result<(), StoreError> {
        let _guard = self.lock.lock();

        let mut connections = self.load()?;
        match connections.iter_mut().find(|existing| existing.guid == connection.guid) {
            Some(existing) => *existing = connection.clone(),
            None => connections.push(connection.clone()),
        }
        write_json(&self.path, &connections).map_err(StoreError::Unavailable)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<Connection>, StoreError> {
        if id.is_empty() {
            return Ok(None);
        }
        Ok(self.load()?.into_iter().find(|connection| connection.id == id))
    }

    fn find_by_guid(&self, guid: &str) -> Result<Option<Connection>, StoreError> {
        Ok(self.load()?.into_iter().find(|connection| connection.guid == guid))
    }

    fn all(&self) -> Result<Vec<Connection>, StoreError> {
        let mut connections = self.load()?;
        connections.sort_by_key(|connection| connection.created_at);
        Ok(connections)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StoredKey {
    Plain { der: String },
    Sealed(Aes256GcmEncryptedData),
}

/// One file per key pair under `keys/`, optionally sealed with AES-256-GCM
/// bound to the key tag.
pub struct FileKeyStore {
    dir: PathBuf,
    storage_key: Option<AutoZeroedByteArray>,
}

impl FileKeyStore {
    pub fn new(data_dir: &Path, storage_key: Option<AutoZeroedByteArray>) -> FileKeyStore {
        FileKeyStore {
            dir: data_dir.join("keys"),
            storage_key,
        }
    }

    fn path(&self, tag: &KeyTag) -> PathBuf {
        self.dir.join(format!("{}.json", tag))
    }
}

impl KeyStore for FileKeyStore {
    fn get(&self, tag: &KeyTag) -> Result<Option<AutoZeroedByteArray>, KeyError> {
        let Some(stored) = read_json::<StoredKey>(&self.path(tag)).map_err(KeyError::StoreUnavailable)? else {
            return Ok(None);
        };

        let der = match (stored, &self.storage_key) {
            (StoredKey::Plain { der }, _) => b64_decode(&der)
                .map(AutoZeroedByteArray::new)
                .ok_or_else(|| KeyError::StoreUnavailable(format!("stored key for {} is not base64", tag)))?,
            (StoredKey::Sealed(sealed), Some(storage_key)) => {
                aes256_gcm_decrypt(&sealed, storage_key.as_slice(), tag.as_str().as_bytes())
                    .map_err(|_| KeyError::StoreUnavailable(format!("stored key for {} could not be unsealed", tag)))?
            }
            (StoredKey::Sealed(_), None) => {
                return Err(KeyError::StoreUnavailable(format!(
                    "stored key for {} is sealed and no storage key is configured",
                    tag
                )))
            }
        };
        Ok(Some(der))
    }

    fn put(&self, tag: &KeyTag, private_key_der: AutoZeroedByteArray) -> Result<(), KeyError> {
        let stored = match &self.storage_key {
            Some(storage_key) => StoredKey::Sealed(
                aes256_gcm_encrypt(private_key_der.as_slice(), storage_key.as_slice(), tag.as_str().as_bytes())
                    .map_err(|err| KeyError::StoreUnavailable(err.to_string()))?,
            ),
            None => StoredKey::Plain {
                der: b64_encode(private_key_der.as_slice()),
            },
        };
        write_json(&self.path(tag), &stored).map_err(KeyError::StoreUnavailable)
    }

    fn delete(&self, tag: &KeyTag) -> Result<bool, KeyError> {
        match fs::remove_file(self.path(tag)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(KeyError::StoreUnavailable(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::crypto::keys::KeyManager;
    use tempfile::tempdir;

    #[test]
    fn connections_survive_reopening() {
        let dir = tempdir().unwrap();
        let store = FileConnectionStore::new(dir.path());
        assert!(store.all().unwrap().is_empty());

        let mut connection = Connection::new("demo".into(), "Demo Bank".into(), "https://demo.test".into());
        store.save(&connection).unwrap();
        connection.id = "42".into();
        store.save(&connection).unwrap();

        let reopened = FileConnectionStore::new(dir.path());
        let all = reopened.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(reopened.find_by_id("42").unwrap().unwrap().guid, connection.guid);
        assert!(reopened.find_by_guid("missing").unwrap().is_none());
    }

    #[test]
    fn sealed_keys_need_the_storage_key() {
        let dir = tempdir().unwrap();
        let tag = KeyTag::for_guid("guid-1");
        let storage_key = AutoZeroedByteArray::new(vec![7u8; 32]);

        let keys = KeyManager::with_modulus_bits(FileKeyStore::new(dir.path(), Some(storage_key.clone())), 1024);
        keys.create_key_pair(&tag).unwrap();
        let public_key = keys.public_key(&tag).unwrap();

        let on_disk = fs::read_to_string(dir.path().join("keys").join(format!("{}.json", tag))).unwrap();
        assert!(on_disk.contains("sealed"));

        let reopened = KeyManager::new(FileKeyStore::new(dir.path(), Some(storage_key)));
        assert_eq!(reopened.public_key(&tag).unwrap(), public_key);

        let wrong = FileKeyStore::new(dir.path(), Some(AutoZeroedByteArray::new(vec![8u8; 32])));
        assert!(matches!(wrong.get(&tag), Err(KeyError::StoreUnavailable(_))));
        let missing = FileKeyStore::new(dir.path(), None);
        assert!(matches!(missing.get(&tag), Err(KeyError::StoreUnavailable(_))));

        reopened.delete_key_pair(&tag).unwrap();
        assert!(!reopened.has_key_pair(&tag).unwrap());
    }

    #[test]
    fn plain_keys_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileKeyStore::new(dir.path(), None);
        let tag = KeyTag::for_guid("guid-2");

        assert!(store.get(&tag).unwrap().is_none());
        store.put(&tag, AutoZeroedByteArray::new(vec![1, 2, 3])).unwrap();
        assert_eq!(store.get(&tag).unwrap().unwrap().as_slice(), &[1, 2, 3]);
        assert!(store.delete(&tag).unwrap());
        assert!(!store.delete(&tag).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn files_are_private_to_the_owner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let tag = KeyTag::for_guid("guid-3");
        FileKeyStore::new(dir.path(), None)
            .put(&tag, AutoZeroedByteArray::new(vec![4, 5, 6]))
            .unwrap();
        FileConnectionStore::new(dir.path())
            .save(&Connection::new("demo".into(), "Demo Bank".into(), "https://demo.test".into()))
            .unwrap();

        for path in [
            dir.path().join("keys").join(format!("{}.json", tag)),
            dir.path().join("connections.json"),
        ] {
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{}", path.display());
        }
    }
}
