//! Validation of a candidate master key against known vault records.
//!
//! A key is accepted only if every record below that exists decrypts and
//! parses: the tag list, the album list and the metadata of the first media
//! asset named by `main.index`. Records that do not exist are skipped.

use crate::cipher::VaultCipher;
use crate::credentials::MasterKey;
use crate::error::IoContext;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// How many tag and album names a report keeps
pub const SAMPLE_SIZE: usize = 5;

const TAG_LIST_FILE: &str = "tag_list.pmv";
const ALBUM_LIST_FILE: &str = "albums.pmv";
const MAIN_INDEX_FILE: &str = "main.index";

// Only the fields a report shows; everything else in the records is ignored.
#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: BTreeMap<u64, String>,
}

#[derive(Debug, Deserialize)]
struct Album {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct AlbumList {
    #[serde(default)]
    albums: BTreeMap<u64, Album>,
}

#[derive(Debug, Deserialize)]
struct MediaMetadata {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    title: String,
}

/// A sample of records (id, name) plus the total count
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSample {
    pub total: usize,
    pub items: Vec<(u64, String)>,
}

/// What the candidate key revealed. `None` means the record does not exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub tags: Option<RecordSample>,
    pub albums: Option<RecordSample>,
    pub first_media: Option<(u64, String)>,
}

/// Read the first media id from a main index: `[count: u64 BE][first id: u64 BE]...`
pub fn read_main_index_first_media(path: &Path) -> Result<Option<u64>> {
    let mut file = File::open(path).at(path)?;
    let mut word = [0u8; 8];

    file.read_exact(&mut word).at(path)?;
    if u64::from_be_bytes(word) == 0 {
        return Ok(None);
    }

    file.read_exact(&mut word).at(path)?;
    Ok(Some(u64::from_be_bytes(word)))
}

/// Path of a media asset's metadata record
pub fn media_meta_path(vault: &Path, media_id: u64) -> std::path::PathBuf {
    vault
        .join("media")
        .join(hex::encode([(media_id % 256) as u8]))
        .join(media_id.to_string())
        .join("meta.pmv")
}

fn decrypt_record<T: DeserializeOwned>(path: &Path, key: &MasterKey, cipher: &dyn VaultCipher) -> Result<T> {
    let sealed = fs::read(path).at(path)?;
    let plain = cipher
        .decrypt(&sealed, key.as_bytes())
        .map_err(|e| Error::InvalidKey {
            reason: format!("{} did not decrypt: {}", path.display(), e),
        })?;
    serde_json::from_slice(&plain).map_err(|e| Error::InvalidKey {
        reason: format!("{} did not parse: {}", path.display(), e),
    })
}

fn sample<V>(map: &BTreeMap<u64, V>, name: impl Fn(&V) -> &str) -> RecordSample {
    RecordSample {
        total: map.len(),
        items: map
            .iter()
            .take(SAMPLE_SIZE)
            .map(|(id, v)| (*id, name(v).to_string()))
            .collect(),
    }
}

/// Decrypt the known records of `vault` with `key`
pub fn check_key(vault: &Path, key: &MasterKey, cipher: &dyn VaultCipher) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    let tags_path = vault.join(TAG_LIST_FILE);
    if tags_path.is_file() {
        let tags: TagList = decrypt_record(&tags_path, key, cipher)?;
        report.tags = Some(sample(&tags.tags, |name| name.as_str()));
    } else {
        debug!("No tag list in {}", vault.display());
    }

    let albums_path = vault.join(ALBUM_LIST_FILE);
    if albums_path.is_file() {
        let albums: AlbumList = decrypt_record(&albums_path, key, cipher)?;
        report.albums = Some(sample(&albums.albums, |album| album.name.as_str()));
    } else {
        debug!("No album list in {}", vault.display());
    }

    let index_path = vault.join(MAIN_INDEX_FILE);
    if index_path.is_file() {
        if let Some(media_id) = read_main_index_first_media(&index_path)? {
            let meta: MediaMetadata = decrypt_record(&media_meta_path(vault, media_id), key, cipher)?;
            report.first_media = Some((meta.id, meta.title));
        }
    }

    Ok(report)
}
