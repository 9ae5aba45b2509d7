//! Test utilities for end-to-end kit tests

use iotkit_core::{fixed, Config, DeviceIdentity, DeviceRoles, FileVersion, MacAddr};
use iotkit_provision::{
    DatedPubkey, FirmwareDescriptor, FirmwareImage, FirmwareManager, FirmwareVersion, HashType,
    HlKeyRecord, HlRole, HlSlot, KeyType, KeypairType, MemoryStorage, Provision, ProvisionError,
    PubkeyRecord, Secmodule, SignRecord, SlotId, SoftSecmodule, Storage, TlArea, TlPart,
    TrustList, TrustListManager,
};
use iotkit_snap::{Frame, FrameHeader, NetIf, RxSink, Snap, SnapResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// Frame rewrite hook; returning false drops the frame
pub type Tamper = Box<dyn FnMut(&FrameHeader, &mut Vec<u8>) -> bool + Send>;

#[derive(Default)]
struct Shared {
    ports: RwLock<Vec<Option<RxSink>>>,
    pending: AtomicUsize,
    log: Mutex<Vec<FrameHeader>>,
    tamper: Mutex<Option<Tamper>>,
}

impl Shared {
    fn deliver(&self, from: usize, mut frame: Vec<u8>) {
        let Ok((header, _)) = Frame::parse(&frame) else {
            return;
        };
        self.log.lock().unwrap().push(header);
        let keep = match self.tamper.lock().unwrap().as_mut() {
            Some(tamper) => tamper(&header, &mut frame),
            None => true,
        };
        if !keep {
            return;
        }
        let sinks: Vec<RxSink> = self
            .ports
            .read()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != from)
            .filter_map(|(_, sink)| sink.clone())
            .collect();
        for sink in sinks {
            sink.deliver(&frame);
        }
    }
}

/// Shared medium with its own delivery thread, like a radio channel.
///
/// Every frame reaches every other port. [`Bus::settle`] waits until no
/// frame is queued or being delivered.
pub struct Bus {
    shared: Arc<Shared>,
    tx: Sender<(usize, Vec<u8>)>,
}

impl Bus {
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        let (tx, rx) = mpsc::channel::<(usize, Vec<u8>)>();
        let worker = shared.clone();
        thread::Builder::new()
            .name("bus".to_string())
            .spawn(move || {
                for (from, frame) in rx {
                    worker.deliver(from, frame);
                    worker.pending.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .expect("Failed to spawn bus thread");
        Self { shared, tx }
    }

    pub fn port(&self, mac: MacAddr) -> Arc<BusPort> {
        let mut ports = self.shared.ports.write().unwrap();
        ports.push(None);
        Arc::new(BusPort {
            shared: self.shared.clone(),
            tx: Mutex::new(self.tx.clone()),
            index: ports.len() - 1,
            mac,
        })
    }

    pub fn set_tamper(&self, tamper: Tamper) {
        *self.shared.tamper.lock().unwrap() = Some(tamper);
    }

    /// Wait for the bus to go quiet
    pub fn settle(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.shared.pending.load(Ordering::SeqCst) != 0 {
            assert!(Instant::now() < deadline, "bus did not settle");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Requests seen on the bus for `service`/`element`
    pub fn requests(&self, service: &[u8; 4], element: &[u8; 4]) -> usize {
        self.shared
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|h| &h.service_id == service && &h.element_id == element && h.flags.is_request())
            .count()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BusPort {
    shared: Arc<Shared>,
    tx: Mutex<Sender<(usize, Vec<u8>)>>,
    index: usize,
    mac: MacAddr,
}

impl NetIf for BusPort {
    fn init(&self, sink: RxSink) -> SnapResult<()> {
        self.shared.ports.write().unwrap()[self.index] = Some(sink);
        Ok(())
    }

    fn deinit(&self) -> SnapResult<()> {
        self.shared.ports.write().unwrap()[self.index] = None;
        Ok(())
    }

    fn tx(&self, data: &[u8]) -> SnapResult<()> {
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.lock().unwrap().send((self.index, data.to_vec())).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn mac_addr(&self) -> MacAddr {
        self.mac
    }
}

/// One device on the bus with its secmodule, storage and trust list.
pub struct Node {
    pub snap: Arc<Snap>,
    pub secmodule: Arc<SoftSecmodule>,
    pub storage: Arc<MemoryStorage>,
    pub provision: Arc<Provision>,
    pub trust_list: Arc<TrustListManager>,
}

impl Node {
    pub fn new(bus: &Bus, last: u8, roles: DeviceRoles) -> Self {
        let config = Config::default_config();
        let secmodule = Arc::new(SoftSecmodule::new());
        let storage = Arc::new(MemoryStorage::new());
        let provision = Arc::new(Provision::new(secmodule.clone()));
        let trust_list = Arc::new(
            TrustListManager::new(storage.clone(), provision.clone(), &config.trust_list)
                .expect("Failed to create trust list manager"),
        );
        let identity = DeviceIdentity::new("ACME", "LAMP", &format!("SN-{last:04}"), roles).unwrap();
        let mac = MacAddr::new([0x02, 0x00, 0x5E, 0x00, 0x00, last]);
        let snap = Snap::init(bus.port(mac), identity, config.snap).expect("Failed to init SNAP");
        Self {
            snap,
            secmodule,
            storage,
            provision,
            trust_list,
        }
    }

    pub fn mac(&self) -> MacAddr {
        self.snap.mac_addr()
    }

    pub fn firmware_manager(&self) -> Arc<FirmwareManager> {
        let storage: Arc<dyn Storage> = self.storage.clone();
        Arc::new(FirmwareManager::new(storage, self.provision.clone()))
    }

    /// Install a trust list locally, as the factory does for gateways
    pub fn install_trust_list(&self, tl: &TrustList) -> Result<FileVersion, ProvisionError> {
        self.trust_list
            .save_part(TlArea::Dynamic, TlPart::Header, tl.header_bytes())?;
        self.trust_list
            .save_part(TlArea::Dynamic, TlPart::Chunk, tl.keys_bytes())?;
        self.trust_list
            .save_part(TlArea::Dynamic, TlPart::Footer, tl.footer_bytes())?;
        self.trust_list.promote(TlArea::Dynamic)
    }
}

/// Key material held by the factory; never present on the device.
pub struct FactoryKeys {
    sm: SoftSecmodule,
}

impl FactoryKeys {
    pub const RECOVERY: SlotId = SlotId::Tmp(1);
    pub const AUTH: SlotId = SlotId::Tmp(2);
    pub const AUTH_SPARE: SlotId = SlotId::Tmp(3);
    pub const TRUST_LIST: SlotId = SlotId::Tmp(4);
    pub const FIRMWARE: SlotId = SlotId::Tmp(5);

    pub fn new() -> Self {
        let sm = SoftSecmodule::new();
        for slot in [
            Self::RECOVERY,
            Self::AUTH,
            Self::AUTH_SPARE,
            Self::TRUST_LIST,
            Self::FIRMWARE,
        ] {
            sm.keypair_create(slot, KeypairType::Secp256r1)
                .expect("Failed to create factory key");
        }
        Self { sm }
    }

    pub fn sign(&self, slot: SlotId, signer_type: KeyType, data: &[u8]) -> SignRecord {
        let (ec_type, signer_key) = self.sm.keypair_get_pubkey(slot).unwrap();
        let hash = self.sm.hash_create(HashType::Sha256, data).unwrap();
        SignRecord {
            signer_type,
            ec_type,
            hash_type: HashType::Sha256,
            signature: self.sm.ecdsa_sign(slot, HashType::Sha256, &hash).unwrap(),
            signer_key,
        }
    }

    pub fn pubkey(&self, slot: SlotId, key_type: KeyType) -> PubkeyRecord {
        let (ec, key) = self.sm.keypair_get_pubkey(slot).unwrap();
        PubkeyRecord::new(key_type, ec, key)
    }

    /// Encoded high-level key record, signed by RECOVERY unless it is one
    pub fn hl_record(&self, slot: SlotId, key_type: KeyType) -> Vec<u8> {
        let dated = DatedPubkey::new(self.pubkey(slot, key_type));
        let sign = (key_type != KeyType::Recovery)
            .then(|| self.sign(Self::RECOVERY, KeyType::Recovery, &dated.to_bytes().unwrap()));
        HlKeyRecord { dated, sign }.to_bytes().unwrap()
    }

    /// Every high-level key a device receives, in push order
    pub fn hl_pushes(&self) -> Vec<(HlSlot, Vec<u8>)> {
        [
            (HlRole::Recovery, 1, Self::RECOVERY),
            (HlRole::Auth, 1, Self::AUTH),
            (HlRole::Auth, 2, Self::AUTH_SPARE),
            (HlRole::TrustList, 1, Self::TRUST_LIST),
            (HlRole::Firmware, 1, Self::FIRMWARE),
        ]
        .into_iter()
        .map(|(role, index, slot)| {
            (
                HlSlot::new(role, index).unwrap(),
                self.hl_record(slot, role.key_type()),
            )
        })
        .collect()
    }

    /// Push the high-level keys directly, bypassing the network
    pub fn provision_locally(&self, device: &Provision) {
        for (slot, record) in self.hl_pushes() {
            device
                .save_hl_key(slot, &record)
                .unwrap_or_else(|e| panic!("Failed to push {slot}: {e}"));
        }
    }

    pub fn trust_list_signed_by(
        &self,
        version: FileVersion,
        signers: &[(SlotId, KeyType)],
    ) -> TrustList {
        let keys = vec![
            DatedPubkey::new(
                self.pubkey(Self::AUTH, KeyType::Cloud)
                    .with_meta(b"https://cloud.example".to_vec()),
            ),
            DatedPubkey::new(self.pubkey(Self::FIRMWARE, KeyType::FirmwareInternal)),
        ];
        let types = vec![KeypairType::Secp256r1; signers.len()];
        TrustList::build_signed::<ProvisionError, _>(version, keys, 0, &types, |i, data| {
            let (slot, signer_type) = signers[i];
            Ok(self.sign(slot, signer_type, data))
        })
        .expect("Failed to build trust list")
    }

    /// Trust list meeting the device quorum
    pub fn trust_list(&self, version: FileVersion) -> TrustList {
        self.trust_list_signed_by(
            version,
            &[
                (Self::AUTH, KeyType::Auth),
                (Self::TRUST_LIST, KeyType::TrustList),
            ],
        )
    }

    /// Signed ACME/LAMP firmware with `len` bytes of code
    pub fn firmware(&self, major: u8, build: u8, len: u32) -> FirmwareImage {
        let descriptor = FirmwareDescriptor {
            manufacture_id: fixed(b"ACME"),
            device_type: fixed(b"LAMP"),
            version: FirmwareVersion {
                app_type: *b"MAIN",
                major,
                minor: 0,
                patch: 0,
                dev_milestone: 0,
                dev_build: build,
                timestamp: 1_000,
            },
            padding: 0,
            chunk_size: 512,
            firmware_length: 0,
            app_size: 64 * 1024,
        };
        let code: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        FirmwareImage::build_signed::<ProvisionError, _>(
            descriptor,
            code,
            &[KeypairType::Secp256r1, KeypairType::Secp256r1],
            |i, data| {
                Ok(if i == 0 {
                    self.sign(Self::AUTH, KeyType::Auth, data)
                } else {
                    self.sign(Self::FIRMWARE, KeyType::Firmware, data)
                })
            },
        )
        .expect("Failed to build firmware image")
    }
}

impl Default for FactoryKeys {
    fn default() -> Self {
        Self::new()
    }
}

/// Route kit logs to the test harness output
pub fn init_logging() {
    iotkit_core::logging::init_for_tests();
}

/// Short fingerprint for assertion messages
pub fn short_hex(data: &[u8]) -> String {
    hex::encode(&data[..data.len().min(8)])
}
