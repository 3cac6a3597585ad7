// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Size of one descriptor table entry.
pub const VIRTQ_DESC_SIZE: usize = 16;

/// Size of one used ring element.
pub const VIRTQ_USED_ELEM_SIZE: usize = 8;

/// Upper bound on split virtqueue sizes, per the virtio spec.
pub const VIRTQ_MAX_SIZE: u16 = 32768;
