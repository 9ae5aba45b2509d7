//! Trust list manager.
//!
//! A candidate list is staged part by part in DYNAMIC (factory provisioning)
//! or TMP (runtime distribution), validated against the signature quorum and
//! promoted into the A/B banked STATIC area. A failed validation discards the
//! staged candidate and leaves STATIC untouched.

use crate::banks::{Bank, BankedStore};
use crate::error::{ProvisionError, ProvisionResult};
use crate::provision::Provision;
use crate::quorum::QuorumPolicy;
use crate::records::{DatedPubkey, KeyType, TrustList, TrustListHeader, TL_HEADER_SIZE};
use crate::storage::{Storage, StorageId};
use crate::update::{window, UpdateFileType, UpdateInterface};
use iotkit_core::config::TrustListConfig;
use iotkit_core::{FileVersion, WireReader};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Staging area for a candidate list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlArea {
    /// Provisioning-time staging used by PRVS
    Dynamic,
    /// Runtime staging used by file distribution
    Tmp,
}

impl TlArea {
    fn storage_id(&self) -> StorageId {
        match self {
            TlArea::Dynamic => StorageId::new("tl/dynamic"),
            TlArea::Tmp => StorageId::new("tl/tmp"),
        }
    }
}

/// Part of a trust list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlPart {
    Header,
    Chunk,
    Footer,
}

#[derive(Debug, Default)]
struct Staging {
    header: Option<TrustListHeader>,
    keys_received: u16,
    len: usize,
    footer: bool,
}

#[derive(Debug, Default)]
struct TlState {
    current: Option<TrustList>,
    staging: HashMap<TlArea, Staging>,
}

/// Owner of the STATIC trust list and its staging areas.
pub struct TrustListManager {
    storage: Arc<dyn Storage>,
    provision: Arc<Provision>,
    policy: QuorumPolicy,
    max_size: usize,
    max_part_size: usize,
    banks: BankedStore,
    state: Mutex<TlState>,
}

impl std::fmt::Debug for TrustListManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustListManager")
            .field("policy", &self.policy)
            .field("max_size", &self.max_size)
            .field("version", &self.version())
            .finish()
    }
}

impl TrustListManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        provision: Arc<Provision>,
        config: &TrustListConfig,
    ) -> ProvisionResult<Self> {
        let policy = QuorumPolicy::from_config(config)?;
        Ok(Self {
            banks: BankedStore::new(storage.clone(), StorageId::new("tl/static")),
            storage,
            provision,
            policy,
            max_size: config.max_size,
            max_part_size: config.max_part_size,
            state: Mutex::new(TlState::default()),
        })
    }

    fn lock(&self) -> ProvisionResult<MutexGuard<'_, TlState>> {
        self.state
            .lock()
            .map_err(|_| ProvisionError::LockPoisoned("trust list state"))
    }

    pub fn provision(&self) -> &Arc<Provision> {
        &self.provision
    }

    /// Load STATIC, falling back to the other bank when the active one does
    /// not verify.
    pub fn init(&self) -> ProvisionResult<FileVersion> {
        let Some(active) = self.banks.active()? else {
            info!("no trust list installed");
            self.lock()?.current = None;
            return Err(ProvisionError::NotInitialized);
        };

        for bank in [active, active.other()] {
            let Some(raw) = self.banks.read(bank)? else {
                continue;
            };
            match self.verify_bytes(raw) {
                Ok(tl) => {
                    if bank != active {
                        warn!(from = ?active, to = ?bank, "active trust list invalid, rolled back");
                        self.banks.set_active(bank)?;
                    }
                    let version = tl.header.version;
                    self.lock()?.current = Some(tl);
                    self.provision.set_initialized(true);
                    info!(%version, ?bank, "trust list loaded");
                    return Ok(version);
                }
                Err(e) => warn!(?bank, error = %e, "stored trust list rejected"),
            }
        }

        self.lock()?.current = None;
        self.provision.set_initialized(false);
        error!("no valid trust list in either bank");
        Err(ProvisionError::NotInitialized)
    }

    fn verify_bytes(&self, raw: Vec<u8>) -> ProvisionResult<TrustList> {
        if raw.len() > self.max_size {
            return Err(ProvisionError::BufferTooSmall {
                needed: raw.len(),
                limit: self.max_size,
            });
        }
        let tl = TrustList::parse(raw)?;
        self.policy.verify(
            self.provision.secmodule(),
            self.provision.as_ref(),
            &tl.signed_bytes(),
            &tl.footer.signatures,
        )?;
        Ok(tl)
    }

    /// Stage one part of a candidate list.
    ///
    /// Parts arrive in order: an 18-byte header, chunks of whole key
    /// records, then the footer once every key has arrived.
    pub fn save_part(&self, area: TlArea, part: TlPart, data: &[u8]) -> ProvisionResult<()> {
        if data.len() > self.max_part_size {
            return Err(ProvisionError::BufferTooSmall {
                needed: data.len(),
                limit: self.max_part_size,
            });
        }
        let id = area.storage_id();
        let mut state = self.lock()?;

        if part == TlPart::Header {
            let header = TrustListHeader::from_bytes(data)?;
            let size = header.tl_size as usize;
            if size > self.max_size || size < TL_HEADER_SIZE {
                return Err(ProvisionError::InvalidArgument(format!(
                    "tl_size {size} outside {TL_HEADER_SIZE}..={}",
                    self.max_size
                )));
            }
            self.storage.replace(&id, data)?;
            debug!(?area, version = %header.version, keys = header.pub_keys_count, "trust list header staged");
            state.staging.insert(
                area,
                Staging {
                    header: Some(header),
                    keys_received: 0,
                    len: data.len(),
                    footer: false,
                },
            );
            return Ok(());
        }

        let staging = state.staging.entry(area).or_default();
        let header = staging
            .header
            .ok_or_else(|| ProvisionError::OutOfSequence(format!("{part:?} before header")))?;
        if staging.footer {
            return Err(ProvisionError::OutOfSequence(format!("{part:?} after footer")));
        }
        if staging.len + data.len() > header.tl_size as usize {
            return Err(ProvisionError::InvalidArgument(format!(
                "{part:?} exceeds tl_size {}",
                header.tl_size
            )));
        }

        if part == TlPart::Chunk {
            let mut r = WireReader::new(data);
            let mut count: u16 = 0;
            while !r.is_empty() {
                DatedPubkey::decode(&mut r)?;
                count += 1;
            }
            if count == 0 || staging.keys_received + count > header.pub_keys_count {
                return Err(ProvisionError::InvalidArgument(format!(
                    "{count} keys in chunk, {} of {} already staged",
                    staging.keys_received, header.pub_keys_count
                )));
            }
            self.storage.write(&id, staging.len, data)?;
            staging.keys_received += count;
            staging.len += data.len();
            debug!(?area, keys = staging.keys_received, "trust list chunk staged");
        } else {
            if staging.keys_received != header.pub_keys_count {
                return Err(ProvisionError::OutOfSequence(format!(
                    "footer after {} of {} keys",
                    staging.keys_received, header.pub_keys_count
                )));
            }
            self.storage.write(&id, staging.len, data)?;
            self.storage.sync(&id)?;
            staging.len += data.len();
            staging.footer = true;
            debug!(?area, len = staging.len, "trust list footer staged");
        }
        Ok(())
    }

    /// Stage raw list bytes at `offset` (absolute within the list).
    ///
    /// Used by file distribution where chunk boundaries need not align with
    /// key records. Writes must be sequential.
    pub fn stage_bytes(&self, area: TlArea, offset: usize, data: &[u8]) -> ProvisionResult<()> {
        let mut state = self.lock()?;
        let staging = state.staging.entry(area).or_default();
        let header = staging
            .header
            .ok_or_else(|| ProvisionError::OutOfSequence("data before header".to_string()))?;
        if offset != staging.len {
            return Err(ProvisionError::OutOfSequence(format!(
                "offset {offset}, expected {}",
                staging.len
            )));
        }
        let end = offset + data.len();
        if end > header.tl_size as usize {
            return Err(ProvisionError::InvalidArgument(format!(
                "data ends at {end}, tl_size {}",
                header.tl_size
            )));
        }
        self.storage.write(&area.storage_id(), offset, data)?;
        staging.len = end;
        Ok(())
    }

    /// Bytes staged so far in `area`
    pub fn staged_len(&self, area: TlArea) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.staging.get(&area).map(|st| st.len))
            .unwrap_or(0)
    }

    /// Drop the candidate staged in `area`
    pub fn discard(&self, area: TlArea) -> ProvisionResult<()> {
        self.lock()?.staging.remove(&area);
        self.storage.remove(&area.storage_id())?;
        debug!(?area, "staged trust list discarded");
        Ok(())
    }

    /// Validate the candidate staged in `area` without promoting it
    pub fn verify_area(&self, area: TlArea) -> ProvisionResult<TrustList> {
        let raw = self
            .storage
            .read_all(&area.storage_id())?
            .ok_or_else(|| ProvisionError::NotFound(format!("no trust list staged in {area:?}")))?;
        self.verify_bytes(raw)
    }

    /// Validate and promote the candidate staged in `area` to STATIC.
    pub fn promote(&self, area: TlArea) -> ProvisionResult<FileVersion> {
        self.promote_checked(area, false)
    }

    /// Like [`promote`](Self::promote) but also requires the candidate to
    /// be newer than the installed list.
    pub fn promote_newer(&self, area: TlArea) -> ProvisionResult<FileVersion> {
        self.promote_checked(area, true)
    }

    fn promote_checked(&self, area: TlArea, require_newer: bool) -> ProvisionResult<FileVersion> {
        let result = self.verify_area(area).and_then(|tl| {
            if require_newer {
                if let Some(current) = self.version() {
                    if !tl.header.version.is_newer_than(&current) {
                        return Err(ProvisionError::NotNewer {
                            candidate: tl.header.version,
                            current,
                        });
                    }
                }
            }
            let bank: Bank = self.banks.commit(tl.as_bytes())?;
            debug!(?bank, "trust list written");
            Ok(tl)
        });

        if let Err(e) = self.discard(area) {
            error!(?area, error = %e, "failed to discard staged trust list");
        }

        match result {
            Ok(tl) => {
                let version = tl.header.version;
                self.lock()?.current = Some(tl);
                self.provision.set_initialized(true);
                info!(%version, "trust list promoted");
                Ok(version)
            }
            Err(e) => {
                warn!(?area, error = %e, "trust list candidate rejected");
                Err(e)
            }
        }
    }

    /// Version of the installed list
    pub fn version(&self) -> Option<FileVersion> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.current.as_ref().map(|tl| tl.header.version))
    }

    /// Installed list, if any
    pub fn current(&self) -> Option<TrustList> {
        self.state.lock().ok().and_then(|s| s.current.clone())
    }

    fn with_current<T>(&self, f: impl FnOnce(&TrustList) -> T) -> ProvisionResult<T> {
        let state = self.lock()?;
        state
            .current
            .as_ref()
            .map(f)
            .ok_or(ProvisionError::NotInitialized)
    }

    /// Raw bytes of one part of STATIC; `Chunk` yields every key record
    pub fn load_part(&self, part: TlPart) -> ProvisionResult<Vec<u8>> {
        self.with_current(|tl| match part {
            TlPart::Header => tl.header_bytes().to_vec(),
            TlPart::Chunk => tl.keys_bytes().to_vec(),
            TlPart::Footer => tl.footer_bytes().to_vec(),
        })
    }

    pub fn key(&self, index: usize) -> ProvisionResult<DatedPubkey> {
        self.with_current(|tl| tl.keys.get(index).cloned())?
            .ok_or_else(|| ProvisionError::NotFound(format!("trust list key {index}")))
    }

    /// First key of `key_type`
    pub fn find_key(&self, key_type: KeyType) -> Option<DatedPubkey> {
        self.with_current(|tl| {
            tl.keys
                .iter()
                .find(|k| k.pubkey.key_type == key_type)
                .cloned()
        })
        .ok()
        .flatten()
    }

    /// Metadata of the first CLOUD key, read as a URL
    pub fn cloud_url(&self) -> Option<String> {
        let key = self.find_key(KeyType::Cloud)?;
        let url = iotkit_core::wire::unpad(&key.pubkey.meta);
        Some(String::from_utf8_lossy(url).into_owned())
    }
}

/// Trust list as a distributable file.
///
/// Header is the 18-byte list header, data the key records and footer the
/// type byte plus signatures. Received lists are staged in TMP and must be
/// newer than the installed one.
#[derive(Debug, Clone)]
pub struct TrustListUpdate {
    manager: Arc<TrustListManager>,
}

impl TrustListUpdate {
    pub fn new(manager: Arc<TrustListManager>) -> Self {
        Self { manager }
    }

    /// File type describing the installed list
    pub fn file_type(&self) -> UpdateFileType {
        UpdateFileType::trust_list(self.manager.version().unwrap_or_default())
    }
}

impl UpdateInterface for TrustListUpdate {
    fn describe(&self, _file_type: &UpdateFileType) -> String {
        "Trust List".to_string()
    }

    fn current_version(&self, _file_type: &UpdateFileType) -> FileVersion {
        self.manager.version().unwrap_or_default()
    }

    fn header(&self, _file_type: &UpdateFileType) -> ProvisionResult<Vec<u8>> {
        self.manager.load_part(TlPart::Header)
    }

    fn file_size(&self, _file_type: &UpdateFileType) -> ProvisionResult<u32> {
        let len = self.manager.load_part(TlPart::Chunk)?.len();
        u32::try_from(len).map_err(|_| ProvisionError::InvalidArgument(format!("size {len}")))
    }

    fn data(&self, _file_type: &UpdateFileType, offset: u32, max: usize) -> ProvisionResult<Vec<u8>> {
        window(&self.manager.load_part(TlPart::Chunk)?, offset, max)
    }

    fn footer(&self, _file_type: &UpdateFileType) -> ProvisionResult<Vec<u8>> {
        self.manager.load_part(TlPart::Footer)
    }

    fn install_prepare_space(
        &self,
        _file_type: &UpdateFileType,
        header: &[u8],
        file_size: u32,
    ) -> ProvisionResult<()> {
        let parsed = TrustListHeader::from_bytes(header)?;
        if TL_HEADER_SIZE + file_size as usize >= parsed.tl_size as usize {
            return Err(ProvisionError::InvalidArgument(format!(
                "data size {file_size} leaves no room for a footer in {}",
                parsed.tl_size
            )));
        }
        self.manager.save_part(TlArea::Tmp, TlPart::Header, header)
    }

    fn install_append_data(
        &self,
        _file_type: &UpdateFileType,
        offset: u32,
        data: &[u8],
    ) -> ProvisionResult<()> {
        self.manager
            .stage_bytes(TlArea::Tmp, TL_HEADER_SIZE + offset as usize, data)
    }

    fn verify_and_activate(
        &self,
        file_type: &UpdateFileType,
        footer: &[u8],
    ) -> ProvisionResult<FileVersion> {
        let offset = self.manager.staged_len(TlArea::Tmp);
        if let Err(e) = self.manager.stage_bytes(TlArea::Tmp, offset, footer) {
            self.abort(file_type);
            return Err(e);
        }
        self.manager.promote_newer(TlArea::Tmp)
    }

    fn abort(&self, _file_type: &UpdateFileType) {
        if let Err(e) = self.manager.discard(TlArea::Tmp) {
            error!(error = %e, "failed to discard trust list download");
        }
    }
}
