//! Integration tests for device provisioning.
//!
//! These tests drive the public API the way a factory station and a device
//! would:
//! - High-level key push into both slots of a role
//! - Trust list quorum and promotion across a simulated reboot
//! - Signed firmware installation through the update interface
//! - Signing with the device's own key pair

use iotkit_core::{fixed, Config, FileVersion};
use iotkit_provision::{
    verify_sign, DatedPubkey, FirmwareDescriptor, FirmwareImage, FirmwareManager,
    FirmwareVersion, HashType, HlKeyRecord, HlRole, HlSlot, KeyType, KeypairType, MemoryStorage,
    Provision, ProvisionError, PubkeyRecord, Secmodule, SignRecord, SlotId, SoftSecmodule,
    Storage, TlArea, TlPart, TrustList, TrustListManager, UpdateInterface,
};
use std::sync::Arc;

/// Key material held by the factory; never present on the device.
struct FactoryKeys {
    sm: SoftSecmodule,
}

impl FactoryKeys {
    const RECOVERY: SlotId = SlotId::Tmp(1);
    const AUTH: SlotId = SlotId::Tmp(2);
    const AUTH_SPARE: SlotId = SlotId::Tmp(3);
    const TRUST_LIST: SlotId = SlotId::Tmp(4);
    const FIRMWARE: SlotId = SlotId::Tmp(5);

    fn new() -> Self {
        iotkit_core::logging::init_for_tests();
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

    fn sign(&self, slot: SlotId, signer_type: KeyType, data: &[u8]) -> SignRecord {
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

    fn pubkey(&self, slot: SlotId, key_type: KeyType) -> PubkeyRecord {
        let (ec, key) = self.sm.keypair_get_pubkey(slot).unwrap();
        PubkeyRecord::new(key_type, ec, key)
    }

    /// Encoded high-level key record, signed by RECOVERY unless it is one
    fn hl_record(&self, slot: SlotId, key_type: KeyType) -> Vec<u8> {
        let dated = DatedPubkey::new(self.pubkey(slot, key_type));
        let sign = (key_type != KeyType::Recovery)
            .then(|| self.sign(Self::RECOVERY, KeyType::Recovery, &dated.to_bytes().unwrap()));
        HlKeyRecord { dated, sign }.to_bytes().unwrap()
    }

    fn provision(&self, device: &Provision) {
        let pushes = [
            (HlRole::Recovery, 1, Self::RECOVERY),
            (HlRole::Auth, 1, Self::AUTH),
            (HlRole::Auth, 2, Self::AUTH_SPARE),
            (HlRole::TrustList, 1, Self::TRUST_LIST),
            (HlRole::Firmware, 1, Self::FIRMWARE),
        ];
        for (role, index, slot) in pushes {
            let slot_ref = HlSlot::new(role, index).unwrap();
            device
                .save_hl_key(slot_ref, &self.hl_record(slot, role.key_type()))
                .unwrap_or_else(|e| panic!("Failed to push {slot_ref}: {e}"));
        }
    }

    fn trust_list(&self, version: FileVersion, signers: &[(SlotId, KeyType)]) -> TrustList {
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
}

struct Device {
    storage: Arc<MemoryStorage>,
    provision: Arc<Provision>,
    trust_list: Arc<TrustListManager>,
}

impl Device {
    fn boot(sm: Arc<SoftSecmodule>, storage: Arc<MemoryStorage>) -> Self {
        iotkit_core::logging::init_for_tests();
        let provision = Arc::new(Provision::new(sm));
        let config = Config::default_config().trust_list;
        let trust_list = Arc::new(
            TrustListManager::new(storage.clone(), provision.clone(), &config)
                .expect("Failed to create trust list manager"),
        );
        Self {
            storage,
            provision,
            trust_list,
        }
    }

    fn push_trust_list(&self, tl: &TrustList) -> Result<FileVersion, ProvisionError> {
        self.trust_list
            .save_part(TlArea::Dynamic, TlPart::Header, tl.header_bytes())?;
        self.trust_list
            .save_part(TlArea::Dynamic, TlPart::Chunk, tl.keys_bytes())?;
        self.trust_list
            .save_part(TlArea::Dynamic, TlPart::Footer, tl.footer_bytes())?;
        self.trust_list.promote(TlArea::Dynamic)
    }
}

#[test]
fn test_search_finds_keys_in_either_slot() {
    let factory = FactoryKeys::new();
    let device = Device::boot(Arc::new(SoftSecmodule::new()), Arc::new(MemoryStorage::new()));
    factory.provision(&device.provision);

    let auth = factory.pubkey(FactoryKeys::AUTH, KeyType::Auth);
    let spare = factory.pubkey(FactoryKeys::AUTH_SPARE, KeyType::Auth);
    assert!(device
        .provision
        .search_hl_pubkey(KeyType::Auth, auth.ec_type, &auth.key));
    assert!(device
        .provision
        .search_hl_pubkey(KeyType::Auth, spare.ec_type, &spare.key));

    // Same key under a different role is not a match
    assert!(!device
        .provision
        .search_hl_pubkey(KeyType::Firmware, auth.ec_type, &auth.key));
}

#[test]
fn test_trust_list_quorum_and_reboot() {
    let factory = FactoryKeys::new();
    let sm = Arc::new(SoftSecmodule::new());
    let storage = Arc::new(MemoryStorage::new());
    let device = Device::boot(sm.clone(), storage.clone());
    factory.provision(&device.provision);

    let v1 = FileVersion::new(0, 1, 0, 1);
    let single = factory.trust_list(v1, &[(FactoryKeys::AUTH, KeyType::Auth)]);
    assert!(matches!(
        device.push_trust_list(&single),
        Err(ProvisionError::Quorum(_))
    ));

    let both = factory.trust_list(
        v1,
        &[
            (FactoryKeys::AUTH, KeyType::Auth),
            (FactoryKeys::AUTH_SPARE, KeyType::Auth),
        ],
    );
    assert!(matches!(
        device.push_trust_list(&both),
        Err(ProvisionError::Quorum(_))
    ));
    assert!(!device.provision.is_initialized());

    let good = factory.trust_list(
        v1,
        &[
            (FactoryKeys::AUTH, KeyType::Auth),
            (FactoryKeys::TRUST_LIST, KeyType::TrustList),
        ],
    );
    assert_eq!(device.push_trust_list(&good).expect("promotion failed"), v1);
    assert!(device.provision.is_initialized());
    assert_eq!(
        device.trust_list.cloud_url().as_deref(),
        Some("https://cloud.example")
    );

    // Secmodule slots and storage survive the reboot
    let rebooted = Device::boot(sm, device.storage.clone());
    assert_eq!(rebooted.trust_list.init().expect("init failed"), v1);
    assert!(rebooted.provision.is_initialized());
    assert!(rebooted.trust_list.find_key(KeyType::FirmwareInternal).is_some());
}

#[test]
fn test_failed_promotion_leaves_static_untouched() {
    let factory = FactoryKeys::new();
    let storage = Arc::new(MemoryStorage::new());
    let device = Device::boot(Arc::new(SoftSecmodule::new()), storage.clone());
    factory.provision(&device.provision);
    let signers = [
        (FactoryKeys::AUTH, KeyType::Auth),
        (FactoryKeys::TRUST_LIST, KeyType::TrustList),
    ];

    let v1 = FileVersion::new(0, 1, 0, 1);
    device
        .push_trust_list(&factory.trust_list(v1, &signers))
        .expect("promotion failed");
    let before = device.trust_list.load_part(TlPart::Chunk).unwrap();

    storage.fail_writes(Some("tl/static"));
    let v2 = FileVersion::new(0, 2, 0, 1);
    assert!(matches!(
        device.push_trust_list(&factory.trust_list(v2, &signers)),
        Err(ProvisionError::Storage(_))
    ));
    storage.fail_writes(None);

    assert_eq!(device.trust_list.version(), Some(v1));
    assert_eq!(device.trust_list.load_part(TlPart::Chunk).unwrap(), before);
    let rebooted = Device::boot(Arc::new(SoftSecmodule::new()), storage);
    factory.provision(&rebooted.provision);
    assert_eq!(rebooted.trust_list.init().unwrap(), v1);
}

#[test]
fn test_firmware_install_through_update_interface() {
    let factory = FactoryKeys::new();
    let device = Device::boot(Arc::new(SoftSecmodule::new()), Arc::new(MemoryStorage::new()));
    factory.provision(&device.provision);
    let storage: Arc<dyn Storage> = device.storage.clone();
    let firmware = FirmwareManager::new(storage, device.provision.clone());

    let descriptor = FirmwareDescriptor {
        manufacture_id: fixed(b"ACME"),
        device_type: fixed(b"LAMP"),
        version: FirmwareVersion {
            app_type: *b"MAIN",
            major: 2,
            minor: 0,
            patch: 1,
            dev_milestone: 0,
            dev_build: 7,
            timestamp: 1_000,
        },
        padding: 0,
        chunk_size: 512,
        firmware_length: 0,
        app_size: 8192,
    };
    let code: Vec<u8> = (0..3000u32).map(|i| (i * 7 % 256) as u8).collect();
    let image = FirmwareImage::build_signed::<ProvisionError, _>(
        descriptor,
        code,
        &[KeypairType::Secp256r1, KeypairType::Secp256r1],
        |i, data| {
            Ok(if i == 0 {
                factory.sign(FactoryKeys::AUTH, KeyType::Auth, data)
            } else {
                factory.sign(FactoryKeys::FIRMWARE, KeyType::Firmware, data)
            })
        },
    )
    .expect("Failed to build firmware image");

    let ft = image.file_type();
    assert!(firmware.file_is_newer(&ft, &ft.version()));
    firmware
        .install_prepare_space(&ft, &image.header.to_bytes(), 3000)
        .unwrap();
    for (i, chunk) in image.firmware.chunks(512).enumerate() {
        firmware
            .install_append_data(&ft, (i * 512) as u32, chunk)
            .unwrap();
    }
    let version = firmware
        .verify_and_activate(&ft, image.footer_bytes())
        .expect("activation failed");
    assert_eq!(version.build, 7);
    assert_eq!(firmware.current_version(&ft), version);
    assert!(!firmware.file_is_newer(&ft, &version));
}

#[test]
fn test_device_signature_verifies() {
    let device = Device::boot(Arc::new(SoftSecmodule::new()), Arc::new(MemoryStorage::new()));
    let own = device
        .provision
        .ensure_own_keypair()
        .expect("Failed to create device key");
    assert_eq!(own.key_type, KeyType::IotDevice);

    let sign = device
        .provision
        .sign(HashType::Sha256, b"proof of possession")
        .unwrap();
    assert_eq!(sign.signer_key, own.key);
    verify_sign(
        device.provision.secmodule(),
        &sign,
        b"proof of possession",
    )
    .expect("signature should verify");
    assert!(verify_sign(device.provision.secmodule(), &sign, b"tampered").is_err());

    // Second call keeps the existing pair
    assert_eq!(device.provision.ensure_own_keypair().unwrap(), own);
}
