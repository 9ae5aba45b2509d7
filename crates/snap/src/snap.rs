//! SNAP context: netifs, service registry, transaction window and dispatch.

use crate::error::{SnapError, SnapResult};
use crate::frame::{tag_str, Flags, Frame, Tag, FRAME_HEADER_SIZE};
use crate::netif::{Framing, NetIf, RxSink, StreamBuffer};
use crate::service::{Incoming, Reply, Service};
use iotkit_core::config::SnapConfig;
use iotkit_core::{DeviceIdentity, MacAddr};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, error, info, warn};

/// Frame counters reported by INFO STAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapStats {
    pub sent: u32,
    pub received: u32,
    pub dropped: u32,
}

struct NetIfSlot {
    netif: Arc<dyn NetIf>,
    stream: Mutex<StreamBuffer>,
}

/// Ids of the most recently issued requests.
#[derive(Debug)]
struct TransactionWindow {
    next: u16,
    recent: VecDeque<u16>,
    capacity: usize,
}

impl TransactionWindow {
    fn new(capacity: usize) -> Self {
        Self {
            next: 0,
            recent: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn issue(&mut self) -> u16 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        if self.recent.len() >= self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(id);
        id
    }

    fn contains(&self, id: u16) -> bool {
        self.recent.contains(&id)
    }
}

/// Protocol context of one device.
///
/// Created once per device and shared as `Arc<Snap>`; netifs hold a weak
/// reference through their [`RxSink`].
pub struct Snap {
    identity: DeviceIdentity,
    config: SnapConfig,
    me: Weak<Snap>,
    netifs: RwLock<Vec<Arc<NetIfSlot>>>,
    services: RwLock<Vec<Arc<dyn Service>>>,
    window: Mutex<TransactionWindow>,
    sent: AtomicU32,
    received: AtomicU32,
    dropped: AtomicU32,
}

impl std::fmt::Debug for Snap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snap")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Snap {
    pub fn new(identity: DeviceIdentity, config: SnapConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            window: Mutex::new(TransactionWindow::new(config.outstanding_window)),
            identity,
            config,
            me: me.clone(),
            netifs: RwLock::new(Vec::new()),
            services: RwLock::new(Vec::new()),
            sent: AtomicU32::new(0),
            received: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
        })
    }

    /// Create a context and attach its default netif
    pub fn init(
        netif: Arc<dyn NetIf>,
        identity: DeviceIdentity,
        config: SnapConfig,
    ) -> SnapResult<Arc<Self>> {
        let snap = Self::new(identity, config);
        snap.attach_netif(netif)?;
        info!(mac = %snap.mac_addr(), roles = snap.identity.roles.bits(), "snap initialized");
        Ok(snap)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &SnapConfig {
        &self.config
    }

    pub fn stats(&self) -> SnapStats {
        SnapStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Attach a netif and start receiving on it; returns its index
    pub fn attach_netif(&self, netif: Arc<dyn NetIf>) -> SnapResult<usize> {
        let index = {
            let mut netifs = self
                .netifs
                .write()
                .map_err(|_| SnapError::LockPoisoned("netifs"))?;
            if netifs.len() >= self.config.max_netifs {
                return Err(SnapError::CapacityExceeded {
                    what: "netifs",
                    limit: self.config.max_netifs,
                });
            }
            netifs.push(Arc::new(NetIfSlot {
                netif: netif.clone(),
                stream: Mutex::new(StreamBuffer::default()),
            }));
            netifs.len() - 1
        };
        if let Err(e) = netif.init(RxSink::new(self.me.clone(), index)) {
            error!(netif = index, error = %e, "netif init failed");
            if let Ok(mut netifs) = self.netifs.write() {
                netifs.truncate(index);
            }
            return Err(e);
        }
        debug!(netif = index, mac = %netif.mac_addr(), "netif attached");
        Ok(index)
    }

    /// Deinit every netif
    pub fn shutdown(&self) -> SnapResult<()> {
        let netifs = self
            .netifs
            .read()
            .map_err(|_| SnapError::LockPoisoned("netifs"))?
            .clone();
        for slot in netifs {
            slot.netif.deinit()?;
        }
        info!("snap shut down");
        Ok(())
    }

    pub fn netif_count(&self) -> usize {
        self.netifs.read().map(|n| n.len()).unwrap_or(0)
    }

    fn slot(&self, index: usize) -> SnapResult<Arc<NetIfSlot>> {
        self.netifs
            .read()
            .map_err(|_| SnapError::LockPoisoned("netifs"))?
            .get(index)
            .cloned()
            .ok_or(SnapError::NoNetif(index))
    }

    /// MAC of netif `index`
    pub fn netif_mac(&self, index: usize) -> SnapResult<MacAddr> {
        Ok(self.slot(index)?.netif.mac_addr())
    }

    /// MAC of the default netif, zero when none is attached
    pub fn mac_addr(&self) -> MacAddr {
        self.netif_mac(0).unwrap_or_default()
    }

    /// Register a service; ids must be unique
    pub fn register_service(&self, service: Arc<dyn Service>) -> SnapResult<()> {
        let mut services = self
            .services
            .write()
            .map_err(|_| SnapError::LockPoisoned("services"))?;
        let id = service.id();
        if services.iter().any(|s| s.id() == id) {
            return Err(SnapError::DuplicateService(tag_str(&id)));
        }
        if services.len() >= self.config.max_services {
            return Err(SnapError::CapacityExceeded {
                what: "services",
                limit: self.config.max_services,
            });
        }
        services.push(service);
        debug!(service = %tag_str(&id), "service registered");
        Ok(())
    }

    fn services(&self) -> Vec<Arc<dyn Service>> {
        match self.services.read() {
            Ok(services) => services.clone(),
            Err(_) => {
                error!("service registry lock poisoned");
                Vec::new()
            }
        }
    }

    fn find_service(&self, id: &Tag) -> Option<Arc<dyn Service>> {
        self.services().into_iter().find(|s| &s.id() == id)
    }

    /// Reserve a transaction id and accept responses carrying it
    pub fn issue_transaction_id(&self) -> SnapResult<u16> {
        Ok(self
            .window
            .lock()
            .map_err(|_| SnapError::LockPoisoned("transaction window"))?
            .issue())
    }

    fn is_outstanding(&self, id: u16) -> bool {
        self.window.lock().map(|w| w.contains(id)).unwrap_or(false)
    }

    /// Send a request with a fresh transaction id; `None` uses the default netif
    pub fn send_request(
        &self,
        netif: Option<usize>,
        dst: MacAddr,
        service: Tag,
        element: Tag,
        payload: &[u8],
    ) -> SnapResult<u16> {
        let transaction_id = self.issue_transaction_id()?;
        self.send_request_as(netif, dst, transaction_id, service, element, payload)?;
        Ok(transaction_id)
    }

    /// Send a request under an id obtained from [`Snap::issue_transaction_id`]
    pub fn send_request_as(
        &self,
        netif: Option<usize>,
        dst: MacAddr,
        transaction_id: u16,
        service: Tag,
        element: Tag,
        payload: &[u8],
    ) -> SnapResult<()> {
        self.send(
            netif.unwrap_or(0),
            dst,
            transaction_id,
            service,
            element,
            Flags::REQUEST,
            payload.to_vec(),
        )
    }

    pub fn broadcast_request(&self, service: Tag, element: Tag, payload: &[u8]) -> SnapResult<u16> {
        self.send_request(None, MacAddr::BROADCAST, service, element, payload)
    }

    #[allow(clippy::too_many_arguments)]
    fn send(
        &self,
        netif: usize,
        dst: MacAddr,
        transaction_id: u16,
        service: Tag,
        element: Tag,
        flags: Flags,
        payload: Vec<u8>,
    ) -> SnapResult<()> {
        let slot = self.slot(netif)?;
        let frame = Frame::new(
            dst,
            slot.netif.mac_addr(),
            transaction_id,
            service,
            element,
            flags,
            payload,
        )?;
        let bytes = frame.encode(self.config.max_packet_size)?;
        slot.netif.tx(&bytes)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        debug!(
            netif,
            %dst,
            tid = transaction_id,
            service = %tag_str(&service),
            element = %tag_str(&element),
            %flags,
            size = bytes.len(),
            "frame sent"
        );
        Ok(())
    }

    /// Receive path entry used by [`RxSink`]
    pub(crate) fn receive(&self, netif: usize, data: &[u8]) {
        let slot = match self.slot(netif) {
            Ok(slot) => slot,
            Err(e) => {
                warn!(netif, error = %e, "frame from unknown netif");
                return;
            }
        };
        match slot.netif.framing() {
            Framing::Datagram => self.process_frame(netif, &slot, data),
            Framing::Stream => {
                let frames = match slot.stream.lock() {
                    Ok(mut stream) => stream.push(data, self.config.max_packet_size),
                    Err(_) => {
                        error!(netif, "stream buffer lock poisoned");
                        return;
                    }
                };
                for frame in frames {
                    self.process_frame(netif, &slot, &frame);
                }
            }
        }
    }

    fn drop_frame(&self, netif: usize, reason: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(netif, reason, "frame dropped");
    }

    fn process_frame(&self, netif: usize, slot: &NetIfSlot, data: &[u8]) {
        if data.len() > self.config.max_packet_size {
            return self.drop_frame(netif, "oversized");
        }
        let (header, payload) = match Frame::parse(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(netif, size = data.len(), error = %e, "malformed frame");
                return self.drop_frame(netif, "malformed");
            }
        };
        self.received.fetch_add(1, Ordering::Relaxed);

        let own = slot.netif.mac_addr();
        if header.src == own {
            return self.drop_frame(netif, "own frame");
        }
        if header.dst != own && !header.dst.is_broadcast() {
            return self.drop_frame(netif, "not addressed to us");
        }
        if header.dst.is_broadcast() && self.config.route_broadcast {
            self.forward(netif, &data[..FRAME_HEADER_SIZE + payload.len()]);
        }

        let Some(service) = self.find_service(&header.service_id) else {
            return self.drop_frame(netif, "unknown service");
        };
        let incoming = Incoming {
            netif,
            src: header.src,
            dst: header.dst,
            transaction_id: header.transaction_id,
            element: header.element_id,
            flags: header.flags,
            payload,
        };
        debug!(
            netif,
            src = %header.src,
            tid = header.transaction_id,
            service = %tag_str(&header.service_id),
            element = %incoming.element_str(),
            flags = %header.flags,
            size = payload.len(),
            "frame received"
        );

        if header.flags.is_request() {
            self.answer(&*service, &incoming, header.service_id);
        } else if self.is_outstanding(header.transaction_id) {
            if let Err(e) = service.response_process(self, &incoming) {
                warn!(
                    service = %tag_str(&header.service_id),
                    element = %incoming.element_str(),
                    error = %e,
                    "response processing failed"
                );
            }
        } else {
            self.drop_frame(netif, "unexpected response");
        }
    }

    fn answer(&self, service: &dyn Service, request: &Incoming<'_>, service_id: Tag) {
        let reply = service.request_process(self, request);
        let (flags, payload) = match reply {
            Ok(Reply::Data(payload)) => (Flags::ACK, payload),
            Ok(Reply::NoResponse) => return,
            Err(e) => {
                warn!(
                    service = %tag_str(&service_id),
                    element = %request.element_str(),
                    error = %e,
                    "request rejected"
                );
                (Flags::NACK, Vec::new())
            }
        };
        let sent = self.send(
            request.netif,
            request.src,
            request.transaction_id,
            service_id,
            request.element,
            flags,
            payload,
        );
        if let Err(e) = sent {
            warn!(element = %request.element_str(), error = %e, "response not sent, answering NACK");
            if let Err(e) = self.send(
                request.netif,
                request.src,
                request.transaction_id,
                service_id,
                request.element,
                Flags::NACK,
                Vec::new(),
            ) {
                error!(error = %e, "NACK not sent");
            }
        }
    }

    fn forward(&self, from: usize, frame: &[u8]) {
        let netifs = match self.netifs.read() {
            Ok(netifs) => netifs.clone(),
            Err(_) => return,
        };
        for (index, slot) in netifs.iter().enumerate() {
            if index == from {
                continue;
            }
            match slot.netif.tx(frame) {
                Ok(()) => {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                    debug!(from, to = index, "broadcast forwarded");
                }
                Err(e) => warn!(from, to = index, error = %e, "broadcast forward failed"),
            }
        }
    }

    /// Run one scheduler tick on every service
    pub fn tick(&self) {
        for service in self.services() {
            service.periodic_process(self);
        }
    }
}
