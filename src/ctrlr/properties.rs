// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Fabrics Property Get/Set against the virtual register bar.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    ctrlr::controller::Controller,
    nvme::{
        fabrics::{CC_EN, PropOffset, PropertyGetCmd, PropertySetCmd, SHST_OCCURRING},
        types::{self, NvmeCpl, Sct},
    },
};

const ATTRIB_SIZE_4: u8 = 0;
const ATTRIB_SIZE_8: u8 = 1;

fn invalid_param(rsp: &mut NvmeCpl) {
    rsp.set_status(Sct::CommandSpecific, types::fabrics::INVALID_PARAM);
    rsp.set_dnr();
}

pub fn handle_property_get(ctrlr: &Arc<Controller>, cmd: &PropertyGetCmd, rsp: &mut NvmeCpl) {
    let Some(prop) = PropOffset::from_u32(cmd.ofst.get()) else {
        debug!(ofst = cmd.ofst.get(), "property get for unknown offset");
        invalid_param(rsp);
        return;
    };
    let want_size = match cmd.attrib & 0x7 {
        ATTRIB_SIZE_4 => 4,
        ATTRIB_SIZE_8 => 8,
        _ => {
            invalid_param(rsp);
            return;
        },
    };
    if want_size != prop.size() {
        invalid_param(rsp);
        return;
    }

    let value = ctrlr.lock().vcprop.read(prop);
    // The 8-byte value travels in CDW0/CDW1 of the response.
    rsp.cdw0.set(value as u32);
    rsp.cdw1.set((value >> 32) as u32);
    rsp.set_status(Sct::Generic, types::generic::SUCCESS);
}

pub fn handle_property_set(ctrlr: &Arc<Controller>, cmd: &PropertySetCmd, rsp: &mut NvmeCpl) {
    let Some(prop) = PropOffset::from_u32(cmd.ofst.get()) else {
        debug!(ofst = cmd.ofst.get(), "property set for unknown offset");
        invalid_param(rsp);
        return;
    };
    let want_size = match cmd.attrib & 0x7 {
        ATTRIB_SIZE_4 => 4,
        ATTRIB_SIZE_8 => 8,
        _ => {
            invalid_param(rsp);
            return;
        },
    };
    if want_size != prop.size() || !prop.writable() {
        invalid_param(rsp);
        return;
    }

    let value = cmd.value.get();
    match prop {
        PropOffset::Cc => {
            if !set_cc(ctrlr, value as u32) {
                invalid_param(rsp);
                return;
            }
        },
        PropOffset::Aqa => ctrlr.lock().vcprop.aqa = value as u32,
        PropOffset::Asq => ctrlr.lock().vcprop.asq = value,
        PropOffset::Acq => ctrlr.lock().vcprop.acq = value,
        _ => {
            invalid_param(rsp);
            return;
        },
    }
    rsp.set_status(Sct::Generic, types::generic::SUCCESS);
}

/// Decode a CC write bit by bit. Returns `false` when the host asked for
/// something this controller does not implement.
fn set_cc(ctrlr: &Arc<Controller>, new_cc: u32) -> bool {
    let (old_en, old_shn) = {
        let inner = ctrlr.lock();
        (inner.vcprop.cc_en(), inner.vcprop.cc_shn())
    };

    let new_en = new_cc & CC_EN != 0;
    let new_shn = (new_cc >> 14) & 0x3;
    let ams = (new_cc >> 11) & 0x7;
    let mps = (new_cc >> 7) & 0xF;
    let css = (new_cc >> 4) & 0x7;

    if ams != 0 || mps != 0 || css != 0 {
        warn!(ams, mps, css, "cc write with unsupported arbitration/page/command set");
        return false;
    }

    match (old_en, new_en) {
        (false, true) => {
            ctrlr.stop_association_timer();
            let mut inner = ctrlr.lock();
            inner.vcprop.cc = new_cc;
            inner.vcprop.set_csts_rdy(true);
            debug!(cntlid = ctrlr.cntlid, "controller enabled");
        },
        (true, false) => {
            {
                let mut inner = ctrlr.lock();
                inner.vcprop.cc = new_cc;
            }
            debug!(cntlid = ctrlr.cntlid, "controller reset requested");
            ctrlr.begin_reset(false);
        },
        _ => {
            // EN unchanged: store IOSQES/IOCQES for the I/O connect gate.
            let mut inner = ctrlr.lock();
            inner.vcprop.cc = new_cc;
        },
    }

    if old_shn == 0 && new_shn != 0 {
        debug!(cntlid = ctrlr.cntlid, shn = new_shn, "controller shutdown requested");
        ctrlr.lock().vcprop.set_csts_shst(SHST_OCCURRING);
        ctrlr.begin_reset(true);
    }

    true
}
