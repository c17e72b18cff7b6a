// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nvmf_tcp_rs::nvme::types::{
    SGL_SUBTYPE_TRANSPORT, SGL_TYPE_TRANSPORT_DATA_BLOCK,
};

use nvmf_tcp_rs::transport::TransportOpts;

use crate::integration_tests::common::{TestHost, TestTarget, start_target, start_target_with};

/// Bring up an enabled controller plus one I/O qpair.
async fn io_session(tgt: &TestTarget) -> Result<(TestHost, TestHost)> {
    let mut admin = TestHost::connect(tgt.addr).await?;
    let cntlid = admin.admin_session(120_000).await?;
    admin.enable_ctrlr().await?;

    let mut io = TestHost::connect(tgt.addr).await?;
    io.ic_handshake(false, false).await?;
    let rsp = io.connect_qpair(1, 63, 0, cntlid).await?;
    assert!(rsp.success());
    Ok((admin, io))
}

#[tokio::test]
async fn write_8k_flows_through_r2t() -> Result<()> {
    let tgt = start_target().await?;
    let (_admin, mut io) = io_session(&tgt).await?;

    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();

    // 16 blocks of 512 bytes starting at LBA 0, data out of capsule.
    let mut sqe = io.rw_sqe(0x01, 1, 0, 15);
    let cid = sqe.cid.get();
    sqe.dptr.length.set(8192);
    sqe.dptr.set_type(SGL_TYPE_TRANSPORT_DATA_BLOCK, SGL_SUBTYPE_TRANSPORT);
    io.send_capsule(sqe, &[]).await?;

    // Single full-length R2T grant.
    let r2t = io.expect_r2t().await?;
    assert_eq!(r2t.cccid.get(), cid);
    assert_eq!(r2t.r2to.get(), 0);
    assert_eq!(r2t.r2tl.get(), 8192);
    let ttag = r2t.ttag.get();

    // Two in-order chunks cover the window exactly.
    io.send_h2c_data(cid, ttag, 0, &payload[..4096], false).await?;
    io.send_h2c_data(cid, ttag, 4096, &payload[4096..], true).await?;

    let rsp = io.expect_capsule_resp().await?;
    assert!(rsp.success(), "write failed: sct={} sc={:#x}", rsp.sct(), rsp.sc());
    assert_eq!(rsp.cid.get(), cid);

    // The data actually landed on the namespace's device.
    let ns = tgt.sub.find_ns(1).expect("ns");
    let done = ns
        .bdev
        .submit(nvmf_tcp_rs::bdev::IoRequest::Read {
            offset_blocks: 0,
            num_blocks: 16,
            bufs: vec![bytes::BytesMut::zeroed(8192)],
        })
        .await;
    assert_eq!(done.bufs[0].as_ref(), &payload[..]);
    Ok(())
}

#[tokio::test]
async fn read_8k_uses_c2h_success() -> Result<()> {
    let tgt = start_target().await?;
    let (_admin, mut io) = io_session(&tgt).await?;

    // Seed the device directly, then read over the wire.
    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 241) as u8).collect();
    let ns = tgt.sub.find_ns(1).expect("ns");
    let mut seed = bytes::BytesMut::zeroed(8192);
    seed.copy_from_slice(&payload);
    ns.bdev
        .submit(nvmf_tcp_rs::bdev::IoRequest::Write {
            offset_blocks: 0,
            num_blocks: 16,
            bufs: vec![seed],
        })
        .await;

    let sqe = io.rw_sqe(0x02, 1, 0, 15);
    let (data, rsp) = io.read_command(sqe, 8192).await?;
    // SUCCESS rode on the last C2H_DATA PDU; no capsule response follows.
    assert!(rsp.is_none());
    assert_eq!(data, payload);
    Ok(())
}

#[tokio::test]
async fn small_write_rides_in_capsule() -> Result<()> {
    let tgt = start_target().await?;
    let (_admin, mut io) = io_session(&tgt).await?;

    let payload = vec![0x5Au8; 512];
    let mut sqe = io.rw_sqe(0x01, 1, 4, 0);
    sqe.dptr.address.set(0);
    sqe.dptr.length.set(512);
    sqe.dptr.set_type(
        nvmf_tcp_rs::nvme::types::SGL_TYPE_DATA_BLOCK,
        nvmf_tcp_rs::nvme::types::SGL_SUBTYPE_OFFSET,
    );
    io.send_capsule(sqe, &payload).await?;

    // In-capsule data needs no R2T round trip.
    let rsp = io.expect_capsule_resp().await?;
    assert!(rsp.success());

    let ns = tgt.sub.find_ns(1).expect("ns");
    let done = ns
        .bdev
        .submit(nvmf_tcp_rs::bdev::IoRequest::Read {
            offset_blocks: 4,
            num_blocks: 1,
            bufs: vec![bytes::BytesMut::zeroed(512)],
        })
        .await;
    assert!(done.bufs[0].iter().all(|&b| b == 0x5A));
    Ok(())
}

#[tokio::test]
async fn read_splits_into_maxh2cdata_chunks() -> Result<()> {
    // A small I/O unit caps MAXH2CDATA at 4 KiB, so an 8 KiB read leaves
    // as two C2H_DATA PDUs with increasing offsets; only the last carries
    // LAST_PDU + SUCCESS.
    let opts = TransportOpts { io_unit_size: 4096, ..Default::default() };
    let tgt = start_target_with(opts).await?;
    let (_admin, mut io) = io_session(&tgt).await?;

    let payload: Vec<u8> = (0..8192u32).map(|i| (i % 239) as u8).collect();
    let ns = tgt.sub.find_ns(1).expect("ns");
    let mut seed = bytes::BytesMut::zeroed(8192);
    seed.copy_from_slice(&payload);
    ns.bdev
        .submit(nvmf_tcp_rs::bdev::IoRequest::Write {
            offset_blocks: 0,
            num_blocks: 16,
            bufs: vec![seed],
        })
        .await;

    let mut sqe = io.rw_sqe(0x02, 1, 0, 15);
    sqe.dptr.length.set(8192);
    sqe.dptr.set_type(SGL_TYPE_TRANSPORT_DATA_BLOCK, SGL_SUBTYPE_TRANSPORT);
    io.send_capsule(sqe, &[]).await?;

    let (first, chunk1) = io.expect_c2h_data().await?;
    assert_eq!(first.datao.get(), 0);
    assert_eq!(first.datal.get(), 4096);
    assert!(!first.common.flags.c2h_last());

    let (second, chunk2) = io.expect_c2h_data().await?;
    assert_eq!(second.datao.get(), 4096);
    assert_eq!(second.datal.get(), 4096);
    assert!(second.common.flags.c2h_last());
    assert!(second.common.flags.c2h_success());

    let mut data = chunk1;
    data.extend_from_slice(&chunk2);
    assert_eq!(data, payload);
    Ok(())
}

#[tokio::test]
async fn io_to_unknown_namespace_fails() -> Result<()> {
    let tgt = start_target().await?;
    let (_admin, mut io) = io_session(&tgt).await?;

    let mut sqe = io.rw_sqe(0x02, 9, 0, 0);
    sqe.dptr.length.set(512);
    sqe.dptr.set_type(SGL_TYPE_TRANSPORT_DATA_BLOCK, SGL_SUBTYPE_TRANSPORT);
    io.send_capsule(sqe, &[]).await?;

    let rsp = io.expect_capsule_resp().await?;
    assert_eq!(rsp.sc(), nvmf_tcp_rs::nvme::types::generic::INVALID_NAMESPACE_OR_FORMAT);
    Ok(())
}

#[tokio::test]
async fn flush_completes_without_data() -> Result<()> {
    let tgt = start_target().await?;
    let (_admin, mut io) = io_session(&tgt).await?;

    let sqe = io.rw_sqe(0x00, 1, 0, 0);
    io.send_capsule(sqe, &[]).await?;
    let rsp = io.expect_capsule_resp().await?;
    assert!(rsp.success());
    Ok(())
}

#[tokio::test]
async fn reads_on_inaccessible_ana_path_fail() -> Result<()> {
    let tgt = start_target().await?;
    let (_admin, mut io) = io_session(&tgt).await?;

    let ns = tgt.sub.find_ns(1).expect("ns");
    ns.set_ana_state(nvmf_tcp_rs::subsystem::AnaState::Inaccessible);

    let mut sqe = io.rw_sqe(0x02, 1, 0, 0);
    sqe.dptr.length.set(512);
    sqe.dptr.set_type(SGL_TYPE_TRANSPORT_DATA_BLOCK, SGL_SUBTYPE_TRANSPORT);
    io.send_capsule(sqe, &[]).await?;

    let rsp = io.expect_capsule_resp().await?;
    assert_eq!(rsp.sct(), nvmf_tcp_rs::nvme::types::Sct::Path as u8);
    assert_eq!(rsp.sc(), nvmf_tcp_rs::nvme::types::path::ANA_INACCESSIBLE);
    Ok(())
}
