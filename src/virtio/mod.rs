// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Split-virtqueue handling: descriptor chain walking, the avail/used
//! publish-consume protocol, and the crash-persistent inflight side table.

pub mod bits;
pub mod inflight;
pub mod queue;

#[cfg(test)]
pub(crate) mod testutil;

pub use inflight::InflightRegion;
pub use queue::{Chain, ChainBuf, DequeueStop, QueueError, VirtQueue};
