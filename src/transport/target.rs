// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The TCP transport target: ports, the acceptor, and qpair placement.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    subsystem::Registry,
    transport::{
        ACCEPTS_PER_TICK, ListenerInfo, PlacementPolicy, TransportOpts,
        poll_group::PollGroup,
        port::{Port, trid_key},
    },
};

/// Shared state every qpair can see: the subsystem registry, the transport
/// options, and the listener snapshot for the discovery log.
pub struct TargetCtx {
    pub registry: Arc<Registry>,
    pub opts: Arc<TransportOpts>,
    pub num_poll_groups: usize,
    listeners: Mutex<Vec<ListenerInfo>>,
}

impl TargetCtx {
    pub fn listeners(&self) -> Vec<ListenerInfo> {
        self.listeners.lock().expect("listeners poisoned").clone()
    }
}

struct HostPin {
    group: usize,
    refs: Arc<AtomicUsize>,
}

pub struct TcpTarget {
    ctx: Arc<TargetCtx>,
    groups: Vec<Arc<PollGroup>>,
    policy: PlacementPolicy,
    rr_next: AtomicUsize,
    host_pins: Arc<DashMap<IpAddr, HostPin>>,
    ports: DashMap<String, Arc<Port>>,
    next_portid: AtomicUsize,
    pub cancel: CancellationToken,
}

impl TcpTarget {
    pub fn new(
        registry: Arc<Registry>,
        opts: TransportOpts,
        num_poll_groups: usize,
        policy: PlacementPolicy,
    ) -> Result<Arc<Self>> {
        opts.validate()?;
        let cancel = CancellationToken::new();
        let ctx = Arc::new(TargetCtx {
            registry,
            opts: Arc::new(opts),
            num_poll_groups: num_poll_groups.max(1),
            listeners: Mutex::new(Vec::new()),
        });
        let groups = (0..num_poll_groups.max(1))
            .map(|id| PollGroup::new(id, &ctx, cancel.child_token()))
            .collect();
        Ok(Arc::new(Self {
            ctx,
            groups,
            policy,
            rr_next: AtomicUsize::new(0),
            host_pins: Arc::new(DashMap::new()),
            ports: DashMap::new(),
            next_portid: AtomicUsize::new(1),
            cancel,
        }))
    }

    pub fn ctx(&self) -> Arc<TargetCtx> {
        Arc::clone(&self.ctx)
    }

    /// Bind a listening socket and start accepting. Listening twice on the
    /// same trid just bumps the port's reference count. Returns the bound
    /// address (which resolves service 0 to the ephemeral port).
    pub async fn listen(self: &Arc<Self>, traddr: &str, trsvcid: &str) -> Result<SocketAddr> {
        let key = trid_key(traddr, trsvcid);
        if let Some(port) = self.ports.get(&key) {
            port.acquire();
            let addr = format!("{}:{}", port.info.traddr, port.info.trsvcid)
                .parse()
                .context("stored listener address")?;
            return Ok(addr);
        }

        let addr: SocketAddr = format!("{traddr}:{trsvcid}")
            .parse()
            .with_context(|| format!("invalid listen address {traddr}:{trsvcid}"))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let bound = listener.local_addr().context("local_addr")?;

        let info = ListenerInfo {
            adrfam: if addr.is_ipv6() { 2 } else { 1 },
            traddr: traddr.to_string(),
            trsvcid: bound.port().to_string(),
            portid: self.next_portid.fetch_add(1, Ordering::SeqCst) as u16,
        };
        let port_cancel = self.cancel.child_token();
        let port = Arc::new(Port::new(info.clone(), port_cancel.clone()));
        // Key by the resolved service so stop_listen finds ephemeral binds.
        self.ports.insert(trid_key(traddr, &info.trsvcid), port);
        self.ctx.listeners.lock().expect("listeners poisoned").push(info);

        info!(%bound, "listening");
        let target = Arc::clone(self);
        tokio::spawn(async move {
            target.accept_loop(listener, port_cancel).await;
        });
        Ok(bound)
    }

    pub fn stop_listen(&self, traddr: &str, trsvcid: &str) -> Result<()> {
        let key = trid_key(traddr, trsvcid);
        let Some(port) = self.ports.get(&key).map(|e| Arc::clone(e.value())) else {
            bail!("no listener at {traddr}:{trsvcid}");
        };
        if port.release() {
            self.ports.remove(&key);
            port.cancel.cancel();
            let mut listeners = self.ctx.listeners.lock().expect("listeners poisoned");
            listeners.retain(|l| trid_key(&l.traddr, &l.trsvcid) != key);
            info!(traddr, trsvcid, "stopped listening");
        }
        Ok(())
    }

    /// The acceptor: drain up to a fixed number of connections per wakeup so
    /// one hot port cannot monopolize the task.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            for _ in 0..ACCEPTS_PER_TICK {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => self.place_qpair(stream, peer),
                            Err(e) => {
                                warn!("accept failed: {e}");
                                break;
                            },
                        }
                    },
                }
            }
            tokio::task::yield_now().await;
        }
    }

    fn place_qpair(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {e}");
        }

        let (group_idx, pin_refs) = self.pick_group(peer.ip());
        let group = &self.groups[group_idx];
        let pins = Arc::clone(&self.host_pins);
        let peer_ip = peer.ip();
        group.add_qpair(stream, peer, self.ctx(), move || {
            if let Some(refs) = pin_refs {
                if refs.fetch_sub(1, Ordering::SeqCst) == 1 {
                    pins.remove(&peer_ip);
                }
            }
        });
    }

    /// Apply the placement policy. Returns the chosen group and, for
    /// host-IP pinning, the reference count the qpair must drop on exit.
    fn pick_group(&self, ip: IpAddr) -> (usize, Option<Arc<AtomicUsize>>) {
        match self.policy {
            PlacementPolicy::RoundRobin => (self.round_robin(), None),
            PlacementPolicy::HostIp => {
                let entry = self.host_pins.entry(ip).or_insert_with(|| HostPin {
                    group: self.round_robin(),
                    refs: Arc::new(AtomicUsize::new(0)),
                });
                entry.refs.fetch_add(1, Ordering::SeqCst);
                (entry.group, Some(Arc::clone(&entry.refs)))
            },
            // The socket layer here has no epoll-affinity hint to consult;
            // fall through to the ring like the reference target does when
            // the hint comes back empty.
            PlacementPolicy::TransportOptimal => (self.round_robin(), None),
        }
    }

    fn round_robin(&self) -> usize {
        self.rr_next.fetch_add(1, Ordering::SeqCst) % self.groups.len()
    }

    pub fn poll_groups(&self) -> &[Arc<PollGroup>] {
        &self.groups
    }

    /// Stop accepting, close every port, and tear down all qpairs.
    pub async fn shutdown(&self) {
        info!("transport shutting down");
        for entry in self.ports.iter() {
            entry.value().cancel.cancel();
        }
        self.ports.clear();
        self.ctx.listeners.lock().expect("listeners poisoned").clear();
        self.cancel.cancel();

        // Give qpair tasks a moment to run their teardown paths.
        for _ in 0..50 {
            if self.groups.iter().all(|g| g.qpair_count() == 0) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}
