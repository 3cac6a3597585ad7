// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-side library for the vhost-user wire protocol.
//!
//! A user-space process serves virtio devices (block and filesystem) to a
//! hypervisor which has offloaded its virtqueue handling over a Unix domain
//! socket.  The hypervisor owns guest memory and the split-virtqueue rings;
//! this crate consumes descriptor chains from those rings, dispatches them to
//! backends through a request queue, and commits completions back to the
//! guest.  A shared-memory inflight table makes the commit path crash-safe:
//! a restarted server discovers which descriptors were outstanding and
//! resubmits them in original arrival order without losing or
//! double-completing any.
//!
//! The vhost-user control protocol itself (feature negotiation, memory-table
//! and ring-address messages, fd passing) is left to surrounding code.  That
//! code drives [`mem::AddressSpace::update`] and [`virtio::VirtQueue::attach`]
//! with whatever the hypervisor sent.

pub extern crate usdt;
#[macro_use]
extern crate bitflags;

pub mod block;
pub mod common;
pub mod device;
pub mod event_loop;
pub mod mem;
pub mod request_queue;
pub mod virtio;

pub use device::VhostServer;
pub use request_queue::{Bio, RequestKind, RequestQueue, RunStatus};
