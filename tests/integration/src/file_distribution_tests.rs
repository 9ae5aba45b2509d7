//! Gateway distributing trust lists and firmware to things over FLDT.

use crate::test_utils::{init_logging, Bus, FactoryKeys, Node};
use iotkit_core::{Config, DeviceRoles, FileVersion};
use iotkit_provision::{TrustListUpdate, UpdateFileType, UpdateInterface, UPDATE_FILE_TYPE_SIZE};
use iotkit_snap::services::fldt::{FLDT_GNFD, FLDT_SERVICE_ID};
use iotkit_snap::services::{start_notification, FldtClient, FldtServer, GotFile, InfoServer};
use iotkit_snap::FRAME_HEADER_SIZE;
use std::sync::{Arc, Mutex};
use tracing::info;

struct Field {
    bus: Bus,
    keys: FactoryKeys,
    gateway: Node,
    server: Arc<FldtServer>,
    thing: Node,
    client: Arc<FldtClient>,
    reports: Arc<Mutex<Vec<GotFile>>>,
}

/// Gateway and thing, both provisioned with trust list 1.0
fn field() -> Field {
    init_logging();
    let bus = Bus::new();
    let keys = FactoryKeys::new();
    let config = Config::default_config().fldt;
    let v1 = FileVersion::new(1, 0, 0, 1);

    let gateway = Node::new(&bus, 1, DeviceRoles::GATEWAY);
    keys.provision_locally(&gateway.provision);
    gateway.install_trust_list(&keys.trust_list(v1)).unwrap();
    let server = Arc::new(FldtServer::new(&config));
    gateway.snap.register_service(server.clone()).unwrap();

    let thing = Node::new(&bus, 2, DeviceRoles::THING);
    keys.provision_locally(&thing.provision);
    thing.install_trust_list(&keys.trust_list(v1)).unwrap();
    let client = Arc::new(FldtClient::new(&config));
    thing.snap.register_service(client.clone()).unwrap();

    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    client.set_got_file_callback(Arc::new(move |got: &GotFile| {
        sink.lock().unwrap().push(*got);
    }));

    Field {
        bus,
        keys,
        gateway,
        server,
        thing,
        client,
        reports,
    }
}

impl Field {
    fn serve_trust_list(&self, version: FileVersion, broadcast: bool) {
        self.gateway
            .install_trust_list(&self.keys.trust_list(version))
            .unwrap();
        let source = Arc::new(TrustListUpdate::new(self.gateway.trust_list.clone()));
        self.server
            .update_server_file_type(&self.gateway.snap, source.file_type(), source, broadcast)
            .unwrap();
    }

    fn receive_trust_list(&self) {
        let sink = Arc::new(TrustListUpdate::new(self.thing.trust_list.clone()));
        self.client
            .update_client_file_type(&self.thing.snap, sink.file_type(), sink)
            .unwrap();
    }

    fn reports(&self) -> Vec<GotFile> {
        self.reports.lock().unwrap().clone()
    }
}

#[test]
fn test_trust_list_pulled_from_gateway() {
    let f = field();
    let v2 = FileVersion::new(1, 1, 0, 1);
    f.serve_trust_list(v2, false);
    f.receive_trust_list();
    f.bus.settle();

    assert_eq!(f.thing.trust_list.version(), Some(v2));
    assert_eq!(
        f.thing.trust_list.load_part(iotkit_provision::TlPart::Chunk).unwrap(),
        f.gateway.trust_list.load_part(iotkit_provision::TlPart::Chunk).unwrap()
    );
    let reports = f.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].success);
    assert_eq!(reports[0].gateway, f.gateway.mac());
    assert_eq!(reports[0].prev_version, FileVersion::new(1, 0, 0, 1));
    assert_eq!(reports[0].new_version, v2);
}

#[test]
fn test_same_version_not_downloaded() {
    let f = field();
    let source = Arc::new(TrustListUpdate::new(f.gateway.trust_list.clone()));
    f.server
        .update_server_file_type(&f.gateway.snap, source.file_type(), source, false)
        .unwrap();
    f.receive_trust_list();
    f.bus.settle();

    assert!(f.reports().is_empty());
    assert_eq!(f.bus.requests(&FLDT_SERVICE_ID, &FLDT_GNFD), 0);
}

#[test]
fn test_infv_announcement_starts_download() {
    let f = field();
    // Registered first: the GFTI broadcast finds nothing served
    f.receive_trust_list();
    f.bus.settle();
    assert!(f.reports().is_empty());

    let v2 = FileVersion::new(2, 0, 0, 1);
    f.serve_trust_list(v2, true);
    f.bus.settle();
    assert_eq!(f.thing.trust_list.version(), Some(v2));
    assert!(f.reports()[0].success);
}

#[test]
fn test_start_notification_triggers_update() {
    let f = field();
    f.thing
        .snap
        .register_service(Arc::new(
            InfoServer::new()
                .with_trust_list(f.thing.trust_list.clone())
                .with_fldt_client(f.client.clone()),
        ))
        .unwrap();
    f.receive_trust_list();
    f.bus.settle();

    let v2 = FileVersion::new(1, 2, 0, 1);
    f.serve_trust_list(v2, false);
    f.bus.settle();
    assert_eq!(f.thing.trust_list.version(), Some(FileVersion::new(1, 0, 0, 1)));

    start_notification(&f.gateway.snap).unwrap();
    f.bus.settle();
    assert_eq!(f.thing.trust_list.version(), Some(v2));
}

#[test]
fn test_corrupted_trust_list_keeps_installed_one() {
    let f = field();
    let v2 = FileVersion::new(1, 1, 0, 1);
    f.serve_trust_list(v2, false);
    f.bus.set_tamper(Box::new(|header, frame| {
        if header.element_id == FLDT_GNFD && header.flags.is_ack() {
            let data = FRAME_HEADER_SIZE + UPDATE_FILE_TYPE_SIZE + 10;
            if frame.len() > data {
                frame[data] ^= 0x01;
            }
        }
        true
    }));
    f.receive_trust_list();
    f.bus.settle();

    let reports = f.reports();
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].success);
    assert_eq!(f.thing.trust_list.version(), Some(FileVersion::new(1, 0, 0, 1)));
    assert!(f.thing.provision.is_initialized());
}

#[test]
fn test_firmware_pulled_from_gateway() {
    let f = field();
    let image = f.keys.firmware(2, 7, 3000);
    let gateway_fw = f.gateway.firmware_manager();
    let installed = gateway_fw.store_image(&image).expect("gateway firmware rejected");
    let file_type = image.file_type();
    f.server
        .update_server_file_type(&f.gateway.snap, file_type, gateway_fw, false)
        .unwrap();

    let thing_fw = f.thing.firmware_manager();
    assert_eq!(thing_fw.current_version(&file_type), FileVersion::default());
    f.client
        .update_client_file_type(&f.thing.snap, file_type, thing_fw.clone())
        .unwrap();
    f.bus.settle();

    let chunk = Config::default_config().fldt.chunk_size as usize;
    assert_eq!(
        f.bus.requests(&FLDT_SERVICE_ID, &FLDT_GNFD),
        3000usize.div_ceil(chunk)
    );
    assert_eq!(thing_fw.current_version(&file_type), installed);
    let received = thing_fw.load_image(&file_type).unwrap().expect("no image installed");
    assert_eq!(received.to_bytes(), image.to_bytes());
    info!(version = %installed, "firmware distributed");
}

#[test]
fn test_trust_list_and_firmware_in_one_session() {
    let f = field();
    let v2 = FileVersion::new(1, 1, 0, 1);
    f.serve_trust_list(v2, false);
    let image = f.keys.firmware(3, 1, 1200);
    let gateway_fw = f.gateway.firmware_manager();
    gateway_fw.store_image(&image).unwrap();
    f.server
        .update_server_file_type(&f.gateway.snap, image.file_type(), gateway_fw, false)
        .unwrap();
    assert_eq!(f.server.served().len(), 2);

    let thing_fw = f.thing.firmware_manager();
    f.client
        .update_client_file_type(&f.thing.snap, image.file_type(), thing_fw.clone())
        .unwrap();
    f.receive_trust_list();
    f.bus.settle();

    let reports = f.reports();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.success));
    assert!(reports
        .iter()
        .any(|r| r.file_type == UpdateFileType::trust_list(v2)));
    assert_eq!(f.thing.trust_list.version(), Some(v2));
    assert_eq!(
        thing_fw.current_version(&image.file_type()),
        image.file_type().version()
    );
}
