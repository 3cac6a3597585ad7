// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! virtio-fs pass-through frontend.
//!
//! The FUSE framing inside the buffers is deliberately not parsed here;
//! each chain is delivered to the worker as its raw readable and writable
//! region runs, and the handler reports how many bytes it produced via
//! [`crate::request_queue::Bio::complete_with_len`].

use std::sync::Arc;

use slog::warn;

use super::{DeviceHandle, DeviceQueue};
use crate::mem::MemCtx;
use crate::request_queue::{Bio, RequestKind};
use crate::virtio::Chain;

pub(crate) struct FsState {
    pub(crate) tag: String,
}

pub(crate) fn parse(
    dev: &Arc<DeviceHandle>,
    _state: &FsState,
    dq: &Arc<DeviceQueue>,
    mut chain: Chain,
    mem: &Arc<MemCtx>,
) -> Option<Bio> {
    let read_len = chain.remain_read_bytes();
    let write_len = chain.remain_write_bytes();
    if read_len == 0 && write_len == 0 {
        warn!(dev.log, "fs request with no buffers"; "queue" => dq.vq.id);
        let _ = dq.vq.push_used(&mut chain, 0, mem);
        return None;
    }

    let read = if read_len > 0 {
        chain.readable_bufs(read_len).unwrap_or_default()
    } else {
        Vec::new()
    };
    let write = if write_len > 0 {
        chain.writable_bufs(write_len).unwrap_or_default()
    } else {
        Vec::new()
    };
    Some(Bio::new(
        RequestKind::Fs { read, write },
        dq.clone(),
        chain,
        mem.clone(),
    ))
}
