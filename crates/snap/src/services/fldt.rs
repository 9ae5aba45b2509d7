//! FLDT: file distribution.
//!
//! A gateway serves files (firmware images, trust lists, user files) through
//! [`FldtServer`]; devices pull newer versions with [`FldtClient`]. Every
//! file type is backed by an [`UpdateInterface`] that reads the installed
//! file on the serving side and stages, verifies and activates it on the
//! receiving side.
//!
//! A download is header, then data chunks, then the optional footer. The
//! client re-sends its last request after `wait_max` ticks without an
//! answer and gives up after `retry_max` re-sends.

use crate::error::{SnapError, SnapResult};
use crate::frame::{tag_str, Tag};
use crate::service::{Incoming, Reply, Service};
use crate::snap::Snap;
use iotkit_core::config::FldtConfig;
use iotkit_core::wire::len_u16;
use iotkit_core::{FileVersion, MacAddr, WireReader, WireWriter};
use iotkit_provision::{UpdateFileType, UpdateInterface};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

pub const FLDT_SERVICE_ID: Tag = *b"FLDT";

pub const FLDT_INFV: Tag = *b"INFV";
pub const FLDT_GFTI: Tag = *b"GFTI";
pub const FLDT_GNFH: Tag = *b"GNFH";
pub const FLDT_GNFD: Tag = *b"GNFD";
pub const FLDT_GNFF: Tag = *b"GNFF";

fn encode_type(file_type: &UpdateFileType) -> Vec<u8> {
    let mut w = WireWriter::new();
    file_type.encode(&mut w);
    w.into_vec()
}

fn decode_type(data: &[u8]) -> SnapResult<UpdateFileType> {
    let mut r = WireReader::new(data);
    let file_type = UpdateFileType::decode(&mut r)?;
    r.finish()?;
    Ok(file_type)
}

/// Same file type and same version
fn same_file(a: &UpdateFileType, b: &UpdateFileType) -> bool {
    a == b && a.version() == b.version()
}

/// INFV notification and GFTI answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfoMsg {
    pub file_type: UpdateFileType,
    /// Device serving the file
    pub gateway: MacAddr,
}

impl FileInfoMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.file_type.encode(&mut w);
        self.gateway.encode(&mut w);
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let msg = Self {
            file_type: UpdateFileType::decode(&mut r)?,
            gateway: MacAddr::decode(&mut r)?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// GNFH answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMsg {
    pub file_type: UpdateFileType,
    /// Size of the data section
    pub file_size: u32,
    pub has_footer: bool,
    pub header: Vec<u8>,
}

impl HeaderMsg {
    pub fn encode(&self) -> SnapResult<Vec<u8>> {
        let mut w = WireWriter::new();
        self.file_type.encode(&mut w);
        w.u32(self.file_size)
            .u8(u8::from(self.has_footer))
            .u16(len_u16(self.header.len(), "header_size")?)
            .bytes(&self.header);
        Ok(w.into_vec())
    }

    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let file_type = UpdateFileType::decode(&mut r)?;
        let file_size = r.u32()?;
        let has_footer = r.u8()? != 0;
        let header_size = r.u16()? as usize;
        let header = r.bytes(header_size)?.to_vec();
        r.finish()?;
        Ok(Self {
            file_type,
            file_size,
            has_footer,
            header,
        })
    }
}

/// GNFD request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRequest {
    pub file_type: UpdateFileType,
    pub offset: u32,
}

impl DataRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.file_type.encode(&mut w);
        w.u32(self.offset);
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let msg = Self {
            file_type: UpdateFileType::decode(&mut r)?,
            offset: r.u32()?,
        };
        r.finish()?;
        Ok(msg)
    }
}

/// GNFD answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMsg {
    pub file_type: UpdateFileType,
    pub offset: u32,
    pub next_offset: u32,
    pub data: Vec<u8>,
}

impl DataMsg {
    pub fn encode(&self) -> SnapResult<Vec<u8>> {
        let mut w = WireWriter::new();
        self.file_type.encode(&mut w);
        w.u32(self.offset)
            .u32(self.next_offset)
            .u16(len_u16(self.data.len(), "data_size")?)
            .bytes(&self.data);
        Ok(w.into_vec())
    }

    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let file_type = UpdateFileType::decode(&mut r)?;
        let offset = r.u32()?;
        let next_offset = r.u32()?;
        let data_size = r.u16()? as usize;
        let data = r.bytes(data_size)?.to_vec();
        r.finish()?;
        Ok(Self {
            file_type,
            offset,
            next_offset,
            data,
        })
    }
}

/// GNFF answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FooterMsg {
    pub file_type: UpdateFileType,
    pub footer: Vec<u8>,
}

impl FooterMsg {
    pub fn encode(&self) -> SnapResult<Vec<u8>> {
        let mut w = WireWriter::new();
        self.file_type.encode(&mut w);
        w.u16(len_u16(self.footer.len(), "footer_size")?)
            .bytes(&self.footer);
        Ok(w.into_vec())
    }

    pub fn decode(data: &[u8]) -> SnapResult<Self> {
        let mut r = WireReader::new(data);
        let file_type = UpdateFileType::decode(&mut r)?;
        let footer_size = r.u16()? as usize;
        let footer = r.bytes(footer_size)?.to_vec();
        r.finish()?;
        Ok(Self { file_type, footer })
    }
}

struct ServedFile {
    file_type: UpdateFileType,
    source: Arc<dyn UpdateInterface>,
}

/// Serving side of FLDT.
pub struct FldtServer {
    files: Mutex<Vec<ServedFile>>,
    chunk_size: usize,
    max_file_types: usize,
    infv_period_ticks: u32,
    ticks: AtomicU32,
}

impl std::fmt::Debug for FldtServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FldtServer")
            .field("chunk_size", &self.chunk_size)
            .field("file_types", &self.served().len())
            .finish()
    }
}

impl FldtServer {
    pub fn new(config: &FldtConfig) -> Self {
        Self {
            files: Mutex::new(Vec::new()),
            chunk_size: config.chunk_size.max(1),
            max_file_types: config.max_file_types,
            infv_period_ticks: config.infv_period_ticks,
            ticks: AtomicU32::new(0),
        }
    }

    fn lock(&self) -> SnapResult<MutexGuard<'_, Vec<ServedFile>>> {
        self.files
            .lock()
            .map_err(|_| SnapError::LockPoisoned("fldt server files"))
    }

    /// Add or replace a served file type; `broadcast` announces it at once
    pub fn update_server_file_type(
        &self,
        snap: &Snap,
        file_type: UpdateFileType,
        source: Arc<dyn UpdateInterface>,
        broadcast: bool,
    ) -> SnapResult<()> {
        let file_type = file_type.with_version(source.current_version(&file_type));
        {
            let mut files = self.lock()?;
            match files.iter_mut().find(|f| f.file_type == file_type) {
                Some(entry) => {
                    entry.file_type = file_type;
                    entry.source = source.clone();
                }
                None => {
                    if files.len() >= self.max_file_types {
                        return Err(SnapError::CapacityExceeded {
                            what: "fldt file types",
                            limit: self.max_file_types,
                        });
                    }
                    files.push(ServedFile {
                        file_type,
                        source: source.clone(),
                    });
                }
            }
        }
        info!(
            file = %source.describe(&file_type),
            version = %file_type.version(),
            "serving file"
        );
        if broadcast {
            self.announce(snap, file_type)?;
        }
        Ok(())
    }

    /// File types currently served, with their installed versions
    pub fn served(&self) -> Vec<UpdateFileType> {
        self.files
            .lock()
            .map(|files| {
                files
                    .iter()
                    .map(|f| f.file_type.with_version(f.source.current_version(&f.file_type)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn announce(&self, snap: &Snap, file_type: UpdateFileType) -> SnapResult<()> {
        let msg = FileInfoMsg {
            file_type,
            gateway: snap.mac_addr(),
        };
        snap.broadcast_request(FLDT_SERVICE_ID, FLDT_INFV, &msg.encode())?;
        debug!(file = %file_type, version = %file_type.version(), "INFV broadcast");
        Ok(())
    }

    /// Find the source for `requested` and its installed version. With
    /// `exact` the requested version must be the one served.
    fn lookup(
        &self,
        requested: &UpdateFileType,
        exact: bool,
    ) -> SnapResult<(UpdateFileType, Arc<dyn UpdateInterface>)> {
        let source = self
            .lock()?
            .iter()
            .find(|f| f.file_type == *requested)
            .map(|f| f.source.clone())
            .ok_or_else(|| SnapError::InvalidArgument(format!("{requested} is not served")))?;
        let current = requested.with_version(source.current_version(requested));
        if exact && current.version() != requested.version() {
            return Err(SnapError::InvalidArgument(format!(
                "{requested} {} is no longer served",
                requested.version()
            )));
        }
        Ok((current, source))
    }

    fn file_info(&self, snap: &Snap, request: &Incoming<'_>) -> SnapResult<Reply> {
        let (file_type, _) = self.lookup(&decode_type(request.payload)?, false)?;
        let msg = FileInfoMsg {
            file_type,
            gateway: snap.netif_mac(request.netif)?,
        };
        Ok(Reply::Data(msg.encode()))
    }

    fn header(&self, payload: &[u8]) -> SnapResult<Reply> {
        let (file_type, source) = self.lookup(&decode_type(payload)?, true)?;
        let msg = HeaderMsg {
            file_type,
            file_size: source.file_size(&file_type)?,
            has_footer: source.has_footer(&file_type),
            header: source.header(&file_type)?,
        };
        Ok(Reply::Data(msg.encode()?))
    }

    fn data(&self, payload: &[u8]) -> SnapResult<Reply> {
        let request = DataRequest::decode(payload)?;
        let (file_type, source) = self.lookup(&request.file_type, true)?;
        let data = source.data(&file_type, request.offset, self.chunk_size)?;
        if data.is_empty() {
            return Err(SnapError::InvalidArgument(format!(
                "offset {} is past the end of {file_type}",
                request.offset
            )));
        }
        let msg = DataMsg {
            file_type,
            offset: request.offset,
            next_offset: request.offset + data.len() as u32,
            data,
        };
        Ok(Reply::Data(msg.encode()?))
    }

    fn footer(&self, payload: &[u8]) -> SnapResult<Reply> {
        let (file_type, source) = self.lookup(&decode_type(payload)?, true)?;
        let msg = FooterMsg {
            file_type,
            footer: source.footer(&file_type)?,
        };
        Ok(Reply::Data(msg.encode()?))
    }
}

impl Service for FldtServer {
    fn id(&self) -> Tag {
        FLDT_SERVICE_ID
    }

    fn request_process(&self, snap: &Snap, request: &Incoming<'_>) -> SnapResult<Reply> {
        match request.element {
            FLDT_GFTI => self.file_info(snap, request),
            FLDT_GNFH => self.header(request.payload),
            FLDT_GNFD => self.data(request.payload),
            FLDT_GNFF => self.footer(request.payload),
            // Another gateway's announcement
            FLDT_INFV => Ok(Reply::NoResponse),
            element => Err(SnapError::UnsupportedElement {
                service: tag_str(&FLDT_SERVICE_ID),
                element: tag_str(&element),
            }),
        }
    }

    fn periodic_process(&self, snap: &Snap) {
        if self.infv_period_ticks == 0 {
            return;
        }
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if ticks % self.infv_period_ticks != 0 {
            return;
        }
        for file_type in self.served() {
            if let Err(e) = self.announce(snap, file_type) {
                warn!(file = %file_type, error = %e, "INFV re-broadcast failed");
            }
        }
    }
}

/// Outcome of a download, reported to the got-file callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GotFile {
    pub file_type: UpdateFileType,
    pub prev_version: FileVersion,
    pub new_version: FileVersion,
    pub gateway: MacAddr,
    pub success: bool,
}

pub type GotFileCallback = Arc<dyn Fn(&GotFile) + Send + Sync>;

/// Last request of a download, kept for re-sending.
#[derive(Debug)]
struct Pending {
    element: Tag,
    payload: Vec<u8>,
    /// Id of the last send; older answers are ignored
    transaction_id: Option<u16>,
    wait_ticks: u32,
    resends: u32,
}

#[derive(Debug)]
struct Download {
    /// File type carrying the version being fetched
    target: UpdateFileType,
    prev: FileVersion,
    gateway: MacAddr,
    file_size: u32,
    has_footer: bool,
    next_offset: u32,
    pending: Pending,
}

enum Action {
    Send {
        file_type: UpdateFileType,
        dst: MacAddr,
        element: Tag,
        payload: Vec<u8>,
    },
    Report(GotFile),
}

struct ReceivedFile {
    file_type: UpdateFileType,
    sink: Arc<dyn UpdateInterface>,
    download: Option<Download>,
}

impl ReceivedFile {
    /// Queue `element` as the next request of the running download
    fn request(&mut self, element: Tag, payload: Vec<u8>) -> Vec<Action> {
        let Some(download) = self.download.as_mut() else {
            return Vec::new();
        };
        download.pending = Pending {
            element,
            payload: payload.clone(),
            transaction_id: None,
            wait_ticks: 0,
            resends: 0,
        };
        vec![Action::Send {
            file_type: self.file_type,
            dst: download.gateway,
            element,
            payload,
        }]
    }

    fn fail(&mut self, reason: &str) -> Vec<Action> {
        let Some(download) = self.download.take() else {
            return Vec::new();
        };
        self.sink.abort(&download.target);
        warn!(
            file = %self.sink.describe(&download.target),
            version = %download.target.version(),
            reason,
            "download failed"
        );
        vec![Action::Report(GotFile {
            file_type: download.target,
            prev_version: download.prev,
            new_version: download.target.version(),
            gateway: download.gateway,
            success: false,
        })]
    }

    /// Start fetching `offer` unless it is not newer or a download runs
    fn offer(&mut self, offer: &FileInfoMsg) -> Vec<Action> {
        let candidate = offer.file_type.version();
        if let Some(download) = &self.download {
            debug!(
                file = %self.file_type,
                running = %download.target.version(),
                offered = %candidate,
                "download in progress, offer ignored"
            );
            return Vec::new();
        }
        let current = self.sink.current_version(&self.file_type);
        if !self.sink.file_is_newer(&self.file_type, &candidate) {
            debug!(file = %self.file_type, %current, offered = %candidate, "offer not newer");
            return Vec::new();
        }
        info!(
            file = %self.sink.describe(&offer.file_type),
            %current,
            offered = %candidate,
            gateway = %offer.gateway,
            "starting download"
        );
        self.download = Some(Download {
            target: offer.file_type,
            prev: current,
            gateway: offer.gateway,
            file_size: 0,
            has_footer: false,
            next_offset: 0,
            pending: Pending {
                element: FLDT_GNFH,
                payload: Vec::new(),
                transaction_id: None,
                wait_ticks: 0,
                resends: 0,
            },
        });
        self.request(FLDT_GNFH, encode_type(&offer.file_type))
    }

    fn on_header(&mut self, payload: &[u8]) -> SnapResult<Vec<Action>> {
        let msg = HeaderMsg::decode(payload)?;
        let Some(download) = self.download.as_mut() else {
            return Ok(Vec::new());
        };
        if !same_file(&msg.file_type, &download.target) {
            debug!(file = %msg.file_type, "stale GNFH ignored");
            return Ok(Vec::new());
        }
        self.sink
            .install_prepare_space(&download.target, &msg.header, msg.file_size)?;
        download.file_size = msg.file_size;
        download.has_footer = msg.has_footer;
        download.next_offset = 0;
        debug!(file = %download.target, size = msg.file_size, has_footer = msg.has_footer, "header received");
        if msg.file_size == 0 {
            return self.data_complete();
        }
        let request = DataRequest {
            file_type: download.target,
            offset: 0,
        };
        Ok(self.request(FLDT_GNFD, request.encode()))
    }

    fn on_data(&mut self, payload: &[u8]) -> SnapResult<Vec<Action>> {
        let msg = DataMsg::decode(payload)?;
        let Some(download) = self.download.as_mut() else {
            return Ok(Vec::new());
        };
        if !same_file(&msg.file_type, &download.target) || msg.offset != download.next_offset {
            debug!(
                offset = msg.offset,
                expected = download.next_offset,
                "stale GNFD ignored"
            );
            return Ok(Vec::new());
        }
        if msg.data.is_empty() || msg.next_offset as usize != msg.offset as usize + msg.data.len() {
            return Err(SnapError::InvalidArgument(format!(
                "chunk at {} carries {} bytes but ends at {}",
                msg.offset,
                msg.data.len(),
                msg.next_offset
            )));
        }
        if msg.next_offset > download.file_size {
            return Err(SnapError::InvalidArgument(format!(
                "chunk ends at {} beyond file size {}",
                msg.next_offset, download.file_size
            )));
        }
        self.sink
            .install_append_data(&download.target, msg.offset, &msg.data)?;
        download.next_offset = msg.next_offset;
        if download.next_offset >= download.file_size {
            return self.data_complete();
        }
        let request = DataRequest {
            file_type: download.target,
            offset: download.next_offset,
        };
        Ok(self.request(FLDT_GNFD, request.encode()))
    }

    fn data_complete(&mut self) -> SnapResult<Vec<Action>> {
        let Some(download) = self.download.as_ref() else {
            return Ok(Vec::new());
        };
        if download.has_footer {
            let payload = encode_type(&download.target);
            return Ok(self.request(FLDT_GNFF, payload));
        }
        Ok(self.activate(&[]))
    }

    fn on_footer(&mut self, payload: &[u8]) -> SnapResult<Vec<Action>> {
        let msg = FooterMsg::decode(payload)?;
        let Some(download) = self.download.as_ref() else {
            return Ok(Vec::new());
        };
        if !same_file(&msg.file_type, &download.target) {
            debug!(file = %msg.file_type, "stale GNFF ignored");
            return Ok(Vec::new());
        }
        Ok(self.activate(&msg.footer))
    }

    fn activate(&mut self, footer: &[u8]) -> Vec<Action> {
        let Some(download) = self.download.as_ref() else {
            return Vec::new();
        };
        let target = download.target;
        match self.sink.verify_and_activate(&target, footer) {
            Ok(version) => {
                let Some(download) = self.download.take() else {
                    return Vec::new();
                };
                self.file_type = target.with_version(version);
                info!(
                    file = %self.sink.describe(&target),
                    prev = %download.prev,
                    new = %version,
                    "file activated"
                );
                vec![Action::Report(GotFile {
                    file_type: self.file_type,
                    prev_version: download.prev,
                    new_version: version,
                    gateway: download.gateway,
                    success: true,
                })]
            }
            Err(e) => {
                error!(file = %target, error = %e, "verification failed, file not activated");
                self.fail("verification failed")
            }
        }
    }

    fn on_response(&mut self, response: &Incoming<'_>) -> Vec<Action> {
        if !response.is_ack() {
            return self.fail("request rejected by gateway");
        }
        let step = match response.element {
            FLDT_GNFH => self.on_header(response.payload),
            FLDT_GNFD => self.on_data(response.payload),
            FLDT_GNFF => self.on_footer(response.payload),
            _ => Ok(Vec::new()),
        };
        match step {
            Ok(actions) => actions,
            Err(e) => {
                warn!(element = %response.element_str(), error = %e, "download step failed");
                self.fail("download step failed")
            }
        }
    }

    fn tick(&mut self, wait_max: u32, retry_max: u32) -> Vec<Action> {
        let Some(download) = self.download.as_mut() else {
            return Vec::new();
        };
        let pending = &mut download.pending;
        pending.wait_ticks += 1;
        if pending.wait_ticks < wait_max {
            return Vec::new();
        }
        pending.wait_ticks = 0;
        pending.resends += 1;
        if pending.resends > retry_max {
            return self.fail("no answer from gateway");
        }
        warn!(
            element = %tag_str(&pending.element),
            attempt = pending.resends,
            "FLDT request timed out, re-sending"
        );
        vec![Action::Send {
            file_type: self.file_type,
            dst: download.gateway,
            element: pending.element,
            payload: pending.payload.clone(),
        }]
    }
}

/// Receiving side of FLDT.
pub struct FldtClient {
    files: Mutex<Vec<ReceivedFile>>,
    wait_max: u32,
    retry_max: u32,
    max_file_types: usize,
    got_file: RwLock<Option<GotFileCallback>>,
}

impl std::fmt::Debug for FldtClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FldtClient")
            .field("wait_max", &self.wait_max)
            .field("retry_max", &self.retry_max)
            .finish()
    }
}

impl FldtClient {
    pub fn new(config: &FldtConfig) -> Self {
        Self {
            files: Mutex::new(Vec::new()),
            wait_max: config.wait_max.max(1),
            retry_max: config.retry_max,
            max_file_types: config.max_file_types,
            got_file: RwLock::new(None),
        }
    }

    pub fn set_got_file_callback(&self, callback: GotFileCallback) {
        if let Ok(mut slot) = self.got_file.write() {
            *slot = Some(callback);
        }
    }

    fn lock(&self) -> SnapResult<MutexGuard<'_, Vec<ReceivedFile>>> {
        self.files
            .lock()
            .map_err(|_| SnapError::LockPoisoned("fldt client files"))
    }

    /// Register or replace a received file type and ask for its current
    /// version on the network
    pub fn update_client_file_type(
        &self,
        snap: &Snap,
        file_type: UpdateFileType,
        sink: Arc<dyn UpdateInterface>,
    ) -> SnapResult<()> {
        let file_type = file_type.with_version(sink.current_version(&file_type));
        {
            let mut files = self.lock()?;
            match files.iter_mut().find(|f| f.file_type == file_type) {
                Some(entry) => {
                    if let Some(download) = entry.download.take() {
                        entry.sink.abort(&download.target);
                    }
                    entry.file_type = file_type;
                    entry.sink = sink.clone();
                }
                None => {
                    if files.len() >= self.max_file_types {
                        return Err(SnapError::CapacityExceeded {
                            what: "fldt file types",
                            limit: self.max_file_types,
                        });
                    }
                    files.push(ReceivedFile {
                        file_type,
                        sink: sink.clone(),
                        download: None,
                    });
                }
            }
        }
        info!(file = %sink.describe(&file_type), version = %file_type.version(), "file type registered");
        self.request_file_info(snap, &file_type)
    }

    /// Broadcast GFTI for one file type
    pub fn request_file_info(&self, snap: &Snap, file_type: &UpdateFileType) -> SnapResult<()> {
        snap.broadcast_request(FLDT_SERVICE_ID, FLDT_GFTI, &encode_type(file_type))?;
        debug!(file = %file_type, "GFTI broadcast");
        Ok(())
    }

    /// Broadcast GFTI for every registered file type
    pub fn request_all_files(&self, snap: &Snap) -> SnapResult<()> {
        let types: Vec<UpdateFileType> = self.lock()?.iter().map(|f| f.file_type).collect();
        for file_type in &types {
            self.request_file_info(snap, file_type)?;
        }
        Ok(())
    }

    /// Installed version as last activated or registered
    pub fn current_version(&self, file_type: &UpdateFileType) -> Option<FileVersion> {
        self.files.lock().ok().and_then(|files| {
            files
                .iter()
                .find(|f| f.file_type == *file_type)
                .map(|f| f.file_type.version())
        })
    }

    pub fn in_progress(&self, file_type: &UpdateFileType) -> bool {
        self.files
            .lock()
            .map(|files| {
                files
                    .iter()
                    .any(|f| f.file_type == *file_type && f.download.is_some())
            })
            .unwrap_or(false)
    }

    fn offer(&self, snap: &Snap, msg: &FileInfoMsg) -> SnapResult<()> {
        let actions = {
            let mut files = self.lock()?;
            match files.iter_mut().find(|f| f.file_type == msg.file_type) {
                Some(entry) => entry.offer(msg),
                None => {
                    debug!(file = %msg.file_type, "offer for unregistered file type");
                    Vec::new()
                }
            }
        };
        self.execute(snap, actions);
        Ok(())
    }

    /// Record the id a download's pending request goes out under
    fn track(&self, file_type: &UpdateFileType, transaction_id: u16) -> SnapResult<()> {
        let mut files = self.lock()?;
        if let Some(download) = files
            .iter_mut()
            .find(|f| f.file_type == *file_type)
            .and_then(|f| f.download.as_mut())
        {
            download.pending.transaction_id = Some(transaction_id);
        }
        Ok(())
    }

    /// Run the actions computed under the lock
    fn execute(&self, snap: &Snap, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send {
                    file_type,
                    dst,
                    element,
                    payload,
                } => {
                    let sent = snap.issue_transaction_id().and_then(|transaction_id| {
                        self.track(&file_type, transaction_id)?;
                        snap.send_request_as(None, dst, transaction_id, FLDT_SERVICE_ID, element, &payload)
                    });
                    if let Err(e) = sent {
                        // The next ticks re-send it
                        warn!(element = %tag_str(&element), error = %e, "FLDT request not sent");
                    }
                }
                Action::Report(got) => {
                    let callback = self.got_file.read().ok().and_then(|c| c.clone());
                    if let Some(callback) = callback {
                        callback(&got);
                    }
                }
            }
        }
    }
}

impl Service for FldtClient {
    fn id(&self) -> Tag {
        FLDT_SERVICE_ID
    }

    fn request_process(&self, snap: &Snap, request: &Incoming<'_>) -> SnapResult<Reply> {
        if request.element == FLDT_INFV {
            let msg = FileInfoMsg::decode(request.payload)?;
            debug!(file = %msg.file_type, version = %msg.file_type.version(), gateway = %msg.gateway, "INFV received");
            self.offer(snap, &msg)?;
        }
        Ok(Reply::NoResponse)
    }

    fn response_process(&self, snap: &Snap, response: &Incoming<'_>) -> SnapResult<()> {
        if response.element == FLDT_GFTI {
            if response.is_ack() {
                return self.offer(snap, &FileInfoMsg::decode(response.payload)?);
            }
            debug!(src = %response.src, "GFTI rejected");
            return Ok(());
        }
        let actions = {
            let mut files = self.lock()?;
            let entry = files.iter_mut().find(|f| {
                f.download.as_ref().is_some_and(|d| {
                    d.gateway == response.src
                        && d.pending.element == response.element
                        && d.pending.transaction_id == Some(response.transaction_id)
                })
            });
            match entry {
                Some(entry) => entry.on_response(response),
                None => {
                    debug!(element = %response.element_str(), src = %response.src, "unexpected FLDT response");
                    Vec::new()
                }
            }
        };
        self.execute(snap, actions);
        Ok(())
    }

    fn periodic_process(&self, snap: &Snap) {
        let actions: Vec<Action> = match self.files.lock() {
            Ok(mut files) => files
                .iter_mut()
                .flat_map(|f| f.tick(self.wait_max, self.retry_max))
                .collect(),
            Err(_) => {
                error!("fldt client lock poisoned");
                return;
            }
        };
        self.execute(snap, actions);
    }
}
