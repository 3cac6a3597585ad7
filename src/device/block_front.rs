// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! virtio-blk request framing over the queue engine.
//!
//! Wire format: a 16-byte read-only header `{type, reserved, sector}`,
//! payload buffers, then one write-only status byte at the very end of the
//! chain.  Requests whose header or status segment is missing or
//! misdirected fail without a status write; everything else gets a status
//! even when the operation itself is refused.

use std::sync::Arc;

use slog::warn;

use super::{DeviceHandle, DeviceQueue};
use crate::block;
use crate::mem::MemCtx;
use crate::request_queue::{Bio, RequestKind};
use crate::virtio::Chain;

const SECTOR_SZ: u64 = 512;

/// Length of the GET_ID identifier payload.
pub const VIRTIO_BLK_ID_BYTES: usize = 20;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;
const VIRTIO_BLK_T_GET_ID: u32 = 8;

const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

#[usdt::provider(provider = "vhostd")]
mod probes {
    fn vioblk_read_enqueue(qid: u16, offset: u64, len: u64) {}
    fn vioblk_write_enqueue(qid: u16, offset: u64, len: u64) {}
    fn vioblk_flush_enqueue(qid: u16) {}
    fn vioblk_complete(qid: u16, status: u8) {}
}

#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
struct VbReq {
    rtype: u32,
    reserved: u32,
    sector: u64,
}

pub(crate) struct BlockState {
    pub(crate) info: block::DeviceInfo,
    serial: [u8; VIRTIO_BLK_ID_BYTES],
    pub(crate) backend: Arc<dyn block::Backend>,
}

impl BlockState {
    pub(crate) fn new(
        info: block::DeviceInfo,
        serial: &str,
        backend: Arc<dyn block::Backend>,
    ) -> Self {
        let mut id = [0u8; VIRTIO_BLK_ID_BYTES];
        let bytes = serial.as_bytes();
        let n = usize::min(bytes.len(), VIRTIO_BLK_ID_BYTES);
        id[..n].copy_from_slice(&bytes[..n]);
        Self { info, serial: id, backend }
    }
}

/// Skip to the final writable byte and deposit the status code there.
/// Returns the write-side bytes consumed, which is the used-ring length.
pub(crate) fn write_status(
    chain: &mut Chain,
    mem: &MemCtx,
    res: block::Result,
) -> u32 {
    let code = match res {
        block::Result::Success => VIRTIO_BLK_S_OK,
        block::Result::Failure | block::Result::Canceled => VIRTIO_BLK_S_IOERR,
        block::Result::Unsupported => VIRTIO_BLK_S_UNSUPP,
    };
    let remain = chain.remain_write_bytes();
    if remain >= 1 {
        if remain > 1 {
            chain.write_skip(remain - 1);
        }
        chain.write(&code, mem);
    }
    probes::vioblk_complete!(|| (0, code));
    chain.write_consumed()
}

fn finish_no_status(dq: &Arc<DeviceQueue>, mut chain: Chain, mem: &MemCtx) {
    let _ = dq.vq.push_used(&mut chain, 0, mem);
}

fn finish_with_status(
    dq: &Arc<DeviceQueue>,
    mut chain: Chain,
    mem: &MemCtx,
    res: block::Result,
) {
    let len = write_status(&mut chain, mem, res);
    let _ = dq.vq.push_used(&mut chain, len, mem);
}

/// Parse one chain into a block request.
///
/// Returns the request to enqueue, or `None` when the chain was completed
/// inline (GET_ID, malformed framing, out-of-range or refused operations).
pub(crate) fn parse(
    dev: &Arc<DeviceHandle>,
    state: &BlockState,
    dq: &Arc<DeviceQueue>,
    mut chain: Chain,
    mem: &Arc<MemCtx>,
) -> Option<Bio> {
    let mut req = VbReq::default();
    if !chain.read(&mut req, mem) {
        warn!(dev.log, "block request without readable header";
            "queue" => dq.vq.id);
        finish_no_status(dq, chain, mem);
        return None;
    }
    if chain.remain_write_bytes() < 1 {
        warn!(dev.log, "block request without status segment";
            "queue" => dq.vq.id);
        finish_no_status(dq, chain, mem);
        return None;
    }

    let info = &state.info;
    let Some(offset) = req.sector.checked_mul(SECTOR_SZ) else {
        finish_with_status(dq, chain, mem, block::Result::Failure);
        return None;
    };

    match req.rtype {
        VIRTIO_BLK_T_IN => {
            let len = chain.remain_write_bytes() - 1;
            if len == 0 || len % info.block_size as usize != 0 {
                finish_with_status(dq, chain, mem, block::Result::Unsupported);
                return None;
            }
            if offset + len as u64 > info.capacity_bytes() {
                finish_with_status(dq, chain, mem, block::Result::Failure);
                return None;
            }
            let Some(regions) = chain.writable_bufs(len) else {
                finish_with_status(dq, chain, mem, block::Result::Failure);
                return None;
            };
            probes::vioblk_read_enqueue!(|| (dq.vq.id, offset, len as u64));
            Some(Bio::new(
                RequestKind::Block {
                    op: block::Operation::Read(offset, len),
                    regions,
                },
                dq.clone(),
                chain,
                mem.clone(),
            ))
        }
        VIRTIO_BLK_T_OUT => {
            if info.read_only {
                finish_with_status(dq, chain, mem, block::Result::Failure);
                return None;
            }
            let len = chain.remain_read_bytes();
            if len == 0 || len % info.block_size as usize != 0 {
                finish_with_status(dq, chain, mem, block::Result::Unsupported);
                return None;
            }
            if offset + len as u64 > info.capacity_bytes() {
                finish_with_status(dq, chain, mem, block::Result::Failure);
                return None;
            }
            let Some(regions) = chain.readable_bufs(len) else {
                finish_with_status(dq, chain, mem, block::Result::Failure);
                return None;
            };
            probes::vioblk_write_enqueue!(|| (dq.vq.id, offset, len as u64));
            Some(Bio::new(
                RequestKind::Block {
                    op: block::Operation::Write(offset, len),
                    regions,
                },
                dq.clone(),
                chain,
                mem.clone(),
            ))
        }
        VIRTIO_BLK_T_FLUSH => {
            probes::vioblk_flush_enqueue!(|| (dq.vq.id));
            Some(Bio::new(
                RequestKind::Block {
                    op: block::Operation::Flush,
                    regions: Vec::new(),
                },
                dq.clone(),
                chain,
                mem.clone(),
            ))
        }
        VIRTIO_BLK_T_GET_ID => {
            if chain.remain_write_bytes() - 1 >= VIRTIO_BLK_ID_BYTES
                && chain.write(&state.serial, mem)
            {
                finish_with_status(dq, chain, mem, block::Result::Success);
            } else {
                finish_with_status(dq, chain, mem, block::Result::Unsupported);
            }
            None
        }
        other => {
            warn!(dev.log, "unsupported block request type";
                "queue" => dq.vq.id, "type" => other);
            finish_with_status(dq, chain, mem, block::Result::Unsupported);
            None
        }
    }
}
