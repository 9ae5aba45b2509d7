//! Factory station provisioning a fresh device over PRVS.

use crate::test_utils::{init_logging, short_hex, Bus, FactoryKeys, Node};
use iotkit_core::{Config, DeviceRoles, FileVersion};
use iotkit_provision::{verify_sign, HashType, KeyType, SoftSecmodule};
use iotkit_snap::services::prvs::{PRVS_DNID, PRVS_SERVICE_ID};
use iotkit_snap::services::{PrvsClient, PrvsServer};
use iotkit_snap::SnapError;
use std::sync::Arc;

const WAIT_MS: u64 = 500;
const DNID_MS: u64 = 100;

struct Station {
    bus: Bus,
    factory: Node,
    client: Arc<PrvsClient>,
    device: Node,
    keys: FactoryKeys,
}

fn station() -> Station {
    init_logging();
    let bus = Bus::new();
    let factory = Node::new(&bus, 1, DeviceRoles::INITIALIZER);
    let client = Arc::new(PrvsClient::new(&Config::default_config().prvs));
    factory.snap.register_service(client.clone()).unwrap();

    let device = Node::new(&bus, 2, DeviceRoles::THING);
    device
        .snap
        .register_service(Arc::new(PrvsServer::new(
            device.provision.clone(),
            device.trust_list.clone(),
        )))
        .unwrap();

    Station {
        bus,
        factory,
        client,
        device,
        keys: FactoryKeys::new(),
    }
}

impl Station {
    fn push_keys(&self) {
        let mac = self.device.mac();
        for (slot, record) in self.keys.hl_pushes() {
            self.client
                .push_hl_key(&self.factory.snap, mac, slot, &record, WAIT_MS)
                .unwrap_or_else(|e| panic!("Failed to push {slot}: {e}"));
        }
    }

    fn push_trust_list(&self, tl: &iotkit_provision::TrustList) {
        let snap = &self.factory.snap;
        let mac = self.device.mac();
        self.client
            .set_tl_header(snap, mac, tl.header_bytes(), WAIT_MS)
            .expect("TL header rejected");
        self.client
            .set_tl_chunk(snap, mac, tl.keys_bytes(), WAIT_MS)
            .expect("TL keys rejected");
        self.client
            .set_tl_footer(snap, mac, tl.footer_bytes(), WAIT_MS)
            .expect("TL footer rejected");
    }
}

#[test]
fn test_full_factory_provisioning() {
    let st = station();
    let snap = &st.factory.snap;

    let found = st.client.enum_devices(snap, DNID_MS).expect("DNID failed");
    assert_eq!(found.len(), 1);
    let mac = found[0].mac;
    assert_eq!(mac, st.device.mac());
    assert!(found[0].roles.contains(DeviceRoles::THING));

    let info = st.client.device_info(snap, mac, WAIT_MS).expect("DEVI failed");
    assert_eq!(info.own_key.key_type, KeyType::IotDevice);
    verify_sign(&SoftSecmodule::new(), &info.sign, &info.signed)
        .expect("DEVI self-signature should verify");

    st.push_keys();
    let v1 = FileVersion::new(1, 0, 0, 1);
    st.push_trust_list(&st.keys.trust_list(v1));

    let saved = st.client.save_provision(snap, mac, WAIT_MS).expect("ASAV failed");
    assert_eq!(
        saved.pubkey,
        info.own_key,
        "ASAV key {} differs from DEVI key {}",
        short_hex(&saved.pubkey.key),
        short_hex(&info.own_key.key)
    );
    verify_sign(&SoftSecmodule::new(), &saved.sign, &saved.pubkey.to_bytes().unwrap())
        .expect("ASAV signature should verify");

    assert!(st.device.provision.is_initialized());
    assert_eq!(st.device.trust_list.version(), Some(v1));
    assert_eq!(
        st.device.trust_list.cloud_url().as_deref(),
        Some("https://cloud.example")
    );

    // Provisioned devices stay quiet on DNID
    assert!(st.client.enum_devices(snap, DNID_MS).unwrap().is_empty());
    st.bus.settle();
    assert_eq!(st.bus.requests(&PRVS_SERVICE_ID, &PRVS_DNID), 2);
}

#[test]
fn test_resave_replaces_newer_trust_list() {
    let st = station();
    let snap = &st.factory.snap;
    let mac = st.device.mac();
    st.push_keys();

    let v2 = FileVersion::new(2, 0, 0, 1);
    st.push_trust_list(&st.keys.trust_list(v2));
    st.client.save_provision(snap, mac, WAIT_MS).expect("first ASAV failed");
    assert_eq!(st.device.trust_list.version(), Some(v2));

    // Factory re-save skips the version check that FLDT applies
    let v1 = FileVersion::new(1, 0, 0, 1);
    st.push_trust_list(&st.keys.trust_list(v1));
    st.client.save_provision(snap, mac, WAIT_MS).expect("second ASAV failed");
    assert_eq!(st.device.trust_list.version(), Some(v1));
    assert!(st.device.provision.is_initialized());
}

#[test]
fn test_trust_list_without_quorum_fails_save() {
    let st = station();
    let snap = &st.factory.snap;
    let mac = st.device.mac();
    st.push_keys();

    // Two AUTH signatures, no TRUST_LIST signature
    let tl = st.keys.trust_list_signed_by(
        FileVersion::new(1, 0, 0, 1),
        &[
            (FactoryKeys::AUTH, KeyType::Auth),
            (FactoryKeys::AUTH_SPARE, KeyType::Auth),
        ],
    );
    st.push_trust_list(&tl);
    assert!(matches!(
        st.client.save_provision(snap, mac, WAIT_MS),
        Err(SnapError::Nack { .. })
    ));
    assert!(!st.device.provision.is_initialized());
    assert_eq!(st.device.trust_list.version(), None);
    assert_eq!(st.client.enum_devices(snap, DNID_MS).unwrap().len(), 1);
}

#[test]
fn test_unsigned_auth_key_rejected() {
    let st = station();
    let snap = &st.factory.snap;
    let mac = st.device.mac();
    let pushes = st.keys.hl_pushes();

    // AUTH before RECOVERY: nothing to verify its signature against
    let (auth_slot, auth_record) = &pushes[1];
    assert!(matches!(
        st.client
            .push_hl_key(snap, mac, *auth_slot, auth_record, WAIT_MS),
        Err(SnapError::Nack { .. })
    ));
    let key = st.keys.pubkey(FactoryKeys::AUTH, KeyType::Auth);
    assert!(!st
        .device
        .provision
        .search_hl_pubkey(KeyType::Auth, key.ec_type, &key.key));

    let (recovery_slot, recovery_record) = &pushes[0];
    st.client
        .push_hl_key(snap, mac, *recovery_slot, recovery_record, WAIT_MS)
        .unwrap();
    st.client
        .push_hl_key(snap, mac, *auth_slot, auth_record, WAIT_MS)
        .unwrap();
    assert!(st
        .device
        .provision
        .search_hl_pubkey(KeyType::Auth, key.ec_type, &key.key));
}

#[test]
fn test_device_signs_for_the_factory() {
    let st = station();
    let snap = &st.factory.snap;
    let mac = st.device.mac();

    let sign = st
        .client
        .sign_data(snap, mac, HashType::Sha256, b"batch 42 passed QA", WAIT_MS)
        .expect("ASGN failed");
    let verifier = SoftSecmodule::new();
    verify_sign(&verifier, &sign, b"batch 42 passed QA").expect("ASGN signature should verify");
    assert!(verify_sign(&verifier, &sign, b"batch 43 passed QA").is_err());

    // Empty SGNP proves possession of the device key
    let proof = st
        .client
        .sign_pubkey(snap, mac, HashType::Sha256, &[], WAIT_MS)
        .expect("SGNP failed");
    let own = st.device.provision.own_pubkey().unwrap();
    assert_eq!(proof.signer_key, own.key);
    verify_sign(&verifier, &proof, &own.to_bytes().unwrap()).expect("SGNP proof should verify");
}

#[test]
fn test_unreachable_device_times_out() {
    let st = station();
    let mut unknown = st.device.mac().as_bytes().to_owned();
    unknown[5] = 0x77;
    let result = st.client.device_info(
        &st.factory.snap,
        iotkit_core::MacAddr::new(unknown),
        20,
    );
    assert!(matches!(result, Err(SnapError::Timeout { .. })));
}
