// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Fabrics Connect processing: controller creation on qid 0, I/O qpair
//! binding on qid > 0.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};
use zerocopy::FromBytes;

use crate::{
    ctrlr::controller::Controller,
    nvme::{
        fabrics::{CNTLID_DYNAMIC, ConnectCmd, ConnectData, nqn_str},
        types::{self, NvmeCmd, NvmeCpl, NVMF_NQN_MAX_LEN, Sct},
    },
    subsystem::{Registry, SubsystemState, SubsystemType},
    transport::TransportOpts,
};

/// Connect keeps retrying a transiently unavailable subsystem at this
/// cadence before giving up with CONTROLLER_BUSY.
const CONNECT_RETRY_MS: u64 = 100;
const CONNECT_RETRY_COUNT: u32 = 10;

/// Invalid-parameter connect failure with the offending field location
/// (iattr: 0 = command, 1 = data; ipo: byte offset).
fn connect_invalid_param(rsp: &mut NvmeCpl, iattr: u8, ipo: u16) {
    rsp.set_status(Sct::CommandSpecific, types::fabrics::INVALID_PARAM);
    rsp.set_dnr();
    rsp.cdw0.set(((iattr as u32) << 16) | ipo as u32);
}

fn connect_fail(rsp: &mut NvmeCpl, sc: u8) {
    rsp.set_status(Sct::CommandSpecific, sc);
    rsp.set_dnr();
}

/// Field offsets used in invalid-parameter diagnostics.
const IPO_CMD_RECFMT: u16 = 40;
const IPO_CMD_QID: u16 = 42;
const IPO_CMD_SQSIZE: u16 = 44;
const IPO_DATA_CNTLID: u16 = 16;
const IPO_DATA_SUBNQN: u16 = 256;
const IPO_DATA_HOSTNQN: u16 = 512;

/// Handle a Fabrics Connect capsule. On success returns the controller and
/// the qid this qpair now serves; on failure the response is already
/// populated.
pub async fn handle_connect(
    registry: &Registry,
    opts: &Arc<TransportOpts>,
    cmd: &NvmeCmd,
    data: &[u8],
    local_addr: &str,
    rsp: &mut NvmeCpl,
) -> Option<(Arc<Controller>, u16)> {
    let connect = ConnectCmd::from_cmd(cmd).ok()?;
    let Ok(cdata) = ConnectData::read_from_bytes(data) else {
        connect_invalid_param(rsp, 1, 0);
        return None;
    };

    if connect.recfmt.get() != 0 {
        warn!(recfmt = connect.recfmt.get(), "connect with unsupported record format");
        connect_fail(rsp, types::fabrics::INCOMPATIBLE_FORMAT);
        return None;
    }

    let Some(subnqn) = nqn_str(&cdata.subnqn).filter(|n| n.len() <= NVMF_NQN_MAX_LEN) else {
        connect_invalid_param(rsp, 1, IPO_DATA_SUBNQN);
        return None;
    };
    let Some(hostnqn) = nqn_str(&cdata.hostnqn).filter(|n| n.len() <= NVMF_NQN_MAX_LEN) else {
        connect_invalid_param(rsp, 1, IPO_DATA_HOSTNQN);
        return None;
    };

    let Some(subsys) = registry.find(subnqn) else {
        warn!(%subnqn, "connect to unknown subsystem");
        connect_invalid_param(rsp, 1, IPO_DATA_SUBNQN);
        return None;
    };

    // Transient subsystem states are worth a bounded retry window.
    let mut state = subsys.state();
    let mut retries = CONNECT_RETRY_COUNT;
    while state != SubsystemState::Active && state.is_transient() && retries > 0 {
        tokio::time::sleep(Duration::from_millis(CONNECT_RETRY_MS)).await;
        state = subsys.state();
        retries -= 1;
    }
    if state != SubsystemState::Active {
        connect_fail(rsp, types::fabrics::CONTROLLER_BUSY);
        return None;
    }

    if !subsys.host_allowed(hostnqn) {
        info!(%hostnqn, %subnqn, "host denied by subsystem policy");
        connect_fail(rsp, types::fabrics::INVALID_HOST);
        return None;
    }
    if !subsys.listener_allowed(local_addr) {
        info!(%local_addr, %subnqn, "listener denied by subsystem policy");
        connect_fail(rsp, types::fabrics::INVALID_HOST);
        return None;
    }

    let qid = connect.qid.get();
    let sqsize = connect.sqsize.get();

    if qid == 0 {
        connect_admin(registry, opts, &connect, &cdata, subsys, hostnqn, sqsize, local_addr, rsp)
            .await
    } else {
        connect_io(&connect, &cdata, subsys, qid, sqsize, local_addr, rsp)
    }
}

#[allow(clippy::too_many_arguments)]
async fn connect_admin(
    _registry: &Registry,
    opts: &Arc<TransportOpts>,
    connect: &ConnectCmd,
    cdata: &ConnectData,
    subsys: Arc<crate::subsystem::Subsystem>,
    hostnqn: &str,
    sqsize: u16,
    local_addr: &str,
    rsp: &mut NvmeCpl,
) -> Option<(Arc<Controller>, u16)> {
    if sqsize == 0 || sqsize >= opts.max_aq_depth {
        connect_invalid_param(rsp, 0, IPO_CMD_SQSIZE);
        return None;
    }

    // Fabrics controllers are dynamic; a concrete cntlid cannot be asked for.
    if cdata.cntlid.get() != CNTLID_DYNAMIC {
        connect_invalid_param(rsp, 1, IPO_DATA_CNTLID);
        return None;
    }

    let Some(cntlid) = subsys.alloc_cntlid() else {
        rsp.set_status(Sct::Generic, types::generic::INTERNAL_DEVICE_ERROR);
        return None;
    };

    let kato = if subsys.subtype == SubsystemType::Discovery && connect.kato.get() == 0 {
        0 // Controller::new substitutes the discovery default
    } else {
        connect.kato.get()
    };

    let ctrlr = Controller::new(
        cntlid,
        Arc::clone(&subsys),
        hostnqn.to_string(),
        cdata.hostid,
        kato,
        Arc::clone(opts),
    );
    {
        let mut inner = ctrlr.lock();
        inner.feat.host_identifier = cdata.hostid;
    }
    ctrlr.bind_listener(local_addr);
    if let Err(e) = subsys.add_ctrlr(Arc::clone(&ctrlr)) {
        warn!("add_ctrlr failed: {e}");
        rsp.set_status(Sct::Generic, types::generic::INTERNAL_DEVICE_ERROR);
        return None;
    }
    if !ctrlr.claim_qid(0) {
        subsys.remove_ctrlr(cntlid);
        connect_invalid_param(rsp, 0, IPO_CMD_QID);
        return None;
    }
    ctrlr.arm_keep_alive();

    info!(cntlid, %hostnqn, subnqn = %subsys.nqn, "admin qpair connected");
    rsp.cdw0.set(cntlid as u32);
    rsp.set_status(Sct::Generic, types::generic::SUCCESS);
    Some((ctrlr, 0))
}

fn connect_io(
    _connect: &ConnectCmd,
    cdata: &ConnectData,
    subsys: Arc<crate::subsystem::Subsystem>,
    qid: u16,
    sqsize: u16,
    local_addr: &str,
    rsp: &mut NvmeCpl,
) -> Option<(Arc<Controller>, u16)> {
    let Some(ctrlr) = subsys.get_ctrlr(cdata.cntlid.get()) else {
        debug!(cntlid = cdata.cntlid.get(), "io connect to unknown controller");
        connect_invalid_param(rsp, 1, IPO_DATA_CNTLID);
        return None;
    };

    if sqsize == 0 || sqsize >= ctrlr.opts.max_queue_depth {
        connect_invalid_param(rsp, 0, IPO_CMD_SQSIZE);
        return None;
    }
    if ctrlr.hostnqn != nqn_str(&cdata.hostnqn).unwrap_or_default() {
        connect_fail(rsp, types::fabrics::INVALID_HOST);
        return None;
    }
    // With ANA reporting the association is bound to one path: an I/O qpair
    // arriving on a different listener than the admin qpair is rejected.
    if subsys.ana_reporting && ctrlr.listener() != Some(local_addr) {
        warn!(
            %local_addr,
            admin_listener = ctrlr.listener().unwrap_or(""),
            "io connect on a different listener while ana reporting is on"
        );
        connect_invalid_param(rsp, 0, IPO_CMD_QID);
        return None;
    }

    {
        let inner = ctrlr.lock();
        if ctrlr.cancel.is_cancelled() {
            connect_invalid_param(rsp, 1, IPO_DATA_CNTLID);
            return None;
        }
        // The admin queue must be live and the controller enabled with the
        // entry sizes this transport mandates.
        if !inner.vcprop.cc_en() || !inner.vcprop.csts_rdy() {
            connect_invalid_param(rsp, 0, IPO_CMD_QID);
            return None;
        }
        if inner.vcprop.cc_iosqes() != 6 || inner.vcprop.cc_iocqes() != 4 {
            warn!(
                iosqes = inner.vcprop.cc_iosqes(),
                iocqes = inner.vcprop.cc_iocqes(),
                "io connect with bad entry sizes"
            );
            connect_invalid_param(rsp, 0, IPO_CMD_RECFMT);
            return None;
        }
    }
    if ctrlr.admin_qpair().is_none() {
        connect_invalid_param(rsp, 0, IPO_CMD_QID);
        return None;
    }

    if !ctrlr.claim_qid(qid) {
        debug!(qid, "duplicate or out-of-range io qid");
        connect_invalid_param(rsp, 0, IPO_CMD_QID);
        return None;
    }

    info!(cntlid = ctrlr.cntlid, qid, "io qpair connected");
    rsp.cdw0.set(ctrlr.cntlid as u32);
    rsp.set_status(Sct::Generic, types::generic::SUCCESS);
    Some((ctrlr, qid))
}
