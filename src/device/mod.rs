// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device lifecycle: the server context, registration of block and fs
//! devices against a request queue, and teardown that waits out in-flight
//! requests.
//!
//! Registering a device binds a Unix listener at its socket path
//! immediately; the first connected hypervisor negotiates memory tables and
//! ring addresses (that protocol lives outside this crate) and drives
//! [`DeviceHandle::update_memory`] / [`DeviceHandle::attach_queue`].
//! Unregistration is asynchronous: new avail consumption stops at once,
//! completions keep flowing, and the caller's `on_done` fires only after
//! the last in-flight request has committed and the queues are detached.

use std::io::ErrorKind;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use slog::{error, info, o, warn, Logger};

use crate::block;
use crate::block::Backend;
use crate::common::GuestAddr;
use crate::event_loop::{EventLoop, Events, LoopStatus};
use crate::mem::{AddressSpace, MapRegion, MemCtx};
use crate::request_queue::{Bio, RequestQueue};
use crate::virtio::bits::VIRTQ_MAX_SIZE;
use crate::virtio::{Chain, InflightRegion, QueueError, VirtQueue};

mod block_front;
mod fs_front;

pub use block_front::VIRTIO_BLK_ID_BYTES;

/// Callback invoked when a guest memory region is mapped or unmapped, so
/// backends can register the ranges with external machinery (RDMA, io_uring
/// fixed buffers).
pub type MemEventFn = Arc<dyn Fn(&MapRegion) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("logical block size {0} is unusable")]
    BadBlockSize(u32),
    #[error("device geometry exceeds backend capacity")]
    BadGeometry,
    #[error("queue count/size out of range")]
    BadQueueConfig,
    #[error("fs tag must be 1..=36 bytes")]
    BadTag,
    #[error("queue index {0} out of range")]
    BadQueueIndex(u16),
    #[error("no guest memory table installed")]
    NoMemoryTable,
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Configuration for a virtio-blk device.
pub struct BlockParams {
    pub socket_path: PathBuf,
    /// Identifier returned for GET_ID requests (truncated to 20 bytes)
    pub serial: String,
    /// Logical block size exposed to the guest; a power of two and a
    /// multiple of the backend's native block size
    pub block_size: u32,
    /// Device size in logical blocks; 0 derives it from the backend
    pub total_blocks: u64,
    pub num_queues: u16,
    pub queue_size: u16,
    pub read_only: bool,
    pub map_cb: Option<MemEventFn>,
    pub unmap_cb: Option<MemEventFn>,
}

/// Configuration for a virtio-fs device.
pub struct FsParams {
    pub socket_path: PathBuf,
    /// Mount tag presented to the guest (1..=36 bytes)
    pub tag: String,
    pub num_queues: u16,
    pub queue_size: u16,
}

pub(crate) enum DeviceKind {
    Block(block_front::BlockState),
    Fs(fs_front::FsState),
}

/// Count of requests handed to the worker but not yet committed, with a
/// deferred action to run at quiescence.  All transitions happen on the
/// device's event-loop thread.
pub(crate) struct Tracking {
    inner: Mutex<TrackInner>,
}

struct TrackInner {
    outstanding: usize,
    on_zero: Option<Box<dyn FnOnce() + Send>>,
}

impl Tracking {
    fn new() -> Self {
        Self { inner: Mutex::new(TrackInner { outstanding: 0, on_zero: None }) }
    }

    pub(crate) fn track(&self) {
        self.inner.lock().unwrap().outstanding += 1;
    }

    pub(crate) fn complete(&self) {
        let fire = {
            let mut guard = self.inner.lock().unwrap();
            guard.outstanding -= 1;
            if guard.outstanding == 0 {
                guard.on_zero.take()
            } else {
                None
            }
        };
        if let Some(f) = fire {
            f();
        }
    }

    pub(crate) fn on_zero(&self, f: Box<dyn FnOnce() + Send>) {
        let fire = {
            let mut guard = self.inner.lock().unwrap();
            if guard.outstanding == 0 {
                Some(f)
            } else {
                guard.on_zero = Some(f);
                None
            }
        };
        if let Some(f) = fire {
            f();
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.inner.lock().unwrap().outstanding
    }
}

/// One virtqueue bound to its owning device.
///
/// Kicks and completions both land on the device's event loop, so ring and
/// inflight writes stay on the thread that owns them.
pub(crate) struct DeviceQueue {
    pub(crate) vq: Arc<VirtQueue>,
    dev: Weak<DeviceHandle>,
    kick_fd: Mutex<Option<OwnedFd>>,
}

impl DeviceQueue {
    /// Drain pending avail entries: parse each chain and hand it to the
    /// request queue.  Runs on the event-loop thread.
    pub(crate) fn kick(self: &Arc<Self>) {
        let Some(dev) = self.dev.upgrade() else {
            return;
        };
        if !dev.accepting.load(Ordering::Acquire) {
            return;
        }
        let Some(mem) = dev.space.access() else {
            warn!(dev.log, "kick with no guest memory table";
                "queue" => self.vq.id);
            return;
        };
        let res = self.vq.dequeue_many(&mem, |chain| {
            dev.dispatch(self, chain, &mem);
            std::ops::ControlFlow::Continue(())
        });
        if let Err(e) = res {
            error!(dev.log, "virtqueue processing failed";
                "queue" => self.vq.id, "error" => %e);
        }
    }

    /// Entry point for [`Bio`] completions from arbitrary threads: the
    /// commit is marshaled onto the loop thread.
    pub(crate) fn complete_bio(
        self: &Arc<Self>,
        chain: Chain,
        mem: Arc<MemCtx>,
        res: block::Result,
        len: Option<u32>,
    ) {
        let Some(dev) = self.dev.upgrade() else {
            return;
        };
        let dq = self.clone();
        dev.loop_.schedule(move || dq.finish(chain, mem, res, len));
    }

    fn finish(
        &self,
        mut chain: Chain,
        mem: Arc<MemCtx>,
        res: block::Result,
        len: Option<u32>,
    ) {
        let Some(dev) = self.dev.upgrade() else {
            return;
        };
        let used_len = match &dev.kind {
            DeviceKind::Block(_) => {
                block_front::write_status(&mut chain, &mem, res)
            }
            DeviceKind::Fs(_) => len.unwrap_or(0),
        };
        if let Err(e) = self.vq.push_used(&mut chain, used_len, &mem) {
            error!(dev.log, "completion commit failed";
                "queue" => self.vq.id, "error" => %e);
        }
        dev.tracking.complete();
    }
}

/// A registered device, alive from `register_*` until its unregistration
/// completes.
pub struct DeviceHandle {
    name: String,
    log: Logger,
    kind: DeviceKind,
    space: Arc<AddressSpace>,
    loop_: Arc<EventLoop>,
    rq: Arc<RequestQueue<Bio>>,
    queues: Vec<Arc<DeviceQueue>>,
    socket_path: PathBuf,
    listener: Mutex<Option<UnixListener>>,
    listener_fd: RawFd,
    accepting: AtomicBool,
    tracking: Tracking,
    conns: Mutex<Vec<UnixStream>>,
    cur_regions: Mutex<Vec<MapRegion>>,
    map_cb: Option<MemEventFn>,
    unmap_cb: Option<MemEventFn>,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.name)
            .field("socket_path", &self.socket_path)
            .field("listener_fd", &self.listener_fd)
            .finish_non_exhaustive()
    }
}

impl DeviceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    pub fn queue_count(&self) -> u16 {
        self.queues.len() as u16
    }

    /// Connections accepted on the device socket and not yet claimed by
    /// protocol code.
    pub fn take_connections(&self) -> Vec<UnixStream> {
        std::mem::take(&mut *self.conns.lock().unwrap())
    }

    /// Install a new guest memory table, firing the map/unmap callbacks
    /// for regions leaving and entering the table.  In-flight requests
    /// keep the table they pinned at dequeue.
    pub fn update_memory(
        &self,
        regions: Vec<MapRegion>,
    ) -> Result<(), DeviceError> {
        let ctx = MemCtx::new(regions.clone())?;
        let old = std::mem::replace(&mut *self.cur_regions.lock().unwrap(), regions.clone());
        if let Some(cb) = self.unmap_cb.as_ref() {
            for region in &old {
                cb(region);
            }
        }
        if let Some(cb) = self.map_cb.as_ref() {
            for region in &regions {
                cb(region);
            }
        }
        self.space.update(ctx);
        Ok(())
    }

    /// Attach queue `idx` to rings in guest memory, recovering any
    /// inflight requests from `inflight`.
    pub fn attach_queue(
        &self,
        idx: u16,
        desc: GuestAddr,
        avail: GuestAddr,
        used: GuestAddr,
        inflight: Arc<InflightRegion>,
    ) -> Result<(), DeviceError> {
        let dq = self
            .queues
            .get(usize::from(idx))
            .ok_or(DeviceError::BadQueueIndex(idx))?;
        let mem = self.space.access().ok_or(DeviceError::NoMemoryTable)?;
        dq.vq.attach(&mem, desc, avail, used, inflight)?;
        info!(self.log, "virtqueue attached"; "queue" => idx);
        Ok(())
    }

    /// Process pending avail entries on queue `idx` (scheduled onto the
    /// device's event loop; the software analogue of a kick eventfd).
    pub fn notify_queue(&self, idx: u16) -> Result<(), DeviceError> {
        let dq = self
            .queues
            .get(usize::from(idx))
            .ok_or(DeviceError::BadQueueIndex(idx))?
            .clone();
        self.loop_.schedule(move || dq.kick());
        Ok(())
    }

    /// Wire a kick eventfd (from SET_VRING_KICK) to queue `idx`.
    pub fn set_kick_fd(&self, idx: u16, fd: OwnedFd) -> Result<(), DeviceError> {
        let dq = self
            .queues
            .get(usize::from(idx))
            .ok_or(DeviceError::BadQueueIndex(idx))?
            .clone();
        let raw = fd.as_raw_fd();
        *dq.kick_fd.lock().unwrap() = Some(fd);
        let handler_dq = dq.clone();
        self.loop_.register_fd(
            raw,
            Events::READABLE,
            Box::new(move |_| {
                if let Some(fd) = handler_dq.kick_fd.lock().unwrap().as_ref() {
                    let mut val = 0u64;
                    unsafe {
                        libc::read(
                            fd.as_raw_fd(),
                            &mut val as *mut u64 as *mut libc::c_void,
                            std::mem::size_of::<u64>(),
                        );
                    }
                }
                handler_dq.kick();
            }),
        )?;
        Ok(())
    }

    /// Wire a call eventfd (from SET_VRING_CALL) as queue `idx`'s guest
    /// notification hook.
    pub fn set_call_fd(&self, idx: u16, fd: OwnedFd) -> Result<(), DeviceError> {
        let dq = self
            .queues
            .get(usize::from(idx))
            .ok_or(DeviceError::BadQueueIndex(idx))?;
        dq.vq.set_notify(Box::new(move || {
            let val = 1u64;
            unsafe {
                libc::write(
                    fd.as_raw_fd(),
                    &val as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                );
            }
        }));
        Ok(())
    }

    /// Requests handed to the worker and not yet committed.
    pub fn inflight_requests(&self) -> usize {
        self.tracking.outstanding()
    }

    /// Resolved geometry of a block device, for config-space synthesis.
    pub fn block_info(&self) -> Option<block::DeviceInfo> {
        match &self.kind {
            DeviceKind::Block(state) => Some(state.info),
            DeviceKind::Fs(_) => None,
        }
    }

    /// The backend bound at registration, for the worker driving this
    /// device's request queue.
    pub fn block_backend(&self) -> Option<&Arc<dyn block::Backend>> {
        match &self.kind {
            DeviceKind::Block(state) => Some(&state.backend),
            DeviceKind::Fs(_) => None,
        }
    }

    /// Mount tag of a virtio-fs device, for config-space synthesis.
    pub fn fs_tag(&self) -> Option<&str> {
        match &self.kind {
            DeviceKind::Fs(state) => Some(&state.tag),
            DeviceKind::Block(_) => None,
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        dq: &Arc<DeviceQueue>,
        chain: Chain,
        mem: &Arc<MemCtx>,
    ) {
        let bio = match &self.kind {
            DeviceKind::Block(state) => {
                block_front::parse(self, state, dq, chain, mem)
            }
            DeviceKind::Fs(state) => fs_front::parse(self, state, dq, chain, mem),
        };
        if let Some(bio) = bio {
            self.tracking.track();
            if let Err(refused) = self.rq.enqueue(bio) {
                // Queue already stopped; Drop completes it as canceled.
                drop(refused);
            }
        }
    }

    fn accept_pending(&self) {
        let guard = self.listener.lock().unwrap();
        let Some(listener) = guard.as_ref() else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    info!(self.log, "hypervisor connected");
                    self.conns.lock().unwrap().push(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(self.log, "accept failed"; "error" => %e);
                    break;
                }
            }
        }
    }

    fn detach_listener(&self) {
        self.loop_.deregister_fd(self.listener_fd);
        if self.listener.lock().unwrap().take().is_some() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        for dq in &self.queues {
            if let Some(fd) = dq.kick_fd.lock().unwrap().take() {
                self.loop_.deregister_fd(fd.as_raw_fd());
            }
        }
    }
}

/// Process-wide vhost server context: owns the event-loop thread all
/// devices share.
pub struct VhostServer {
    log: Logger,
    loop_: Arc<EventLoop>,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
    devices: Mutex<Vec<Arc<DeviceHandle>>>,
}

impl VhostServer {
    pub fn new(log: Logger) -> Result<Arc<Self>, DeviceError> {
        if let Err(e) = usdt::register_probes() {
            warn!(log, "failed to register tracing probes"; "error" => %e);
        }
        let loop_ = EventLoop::new(log.new(o!("thread" => "event-loop")))?;
        let thread_loop = loop_.clone();
        let thread_log = log.clone();
        let handle = std::thread::Builder::new()
            .name("vhostd-event-loop".to_string())
            .spawn(move || loop {
                match thread_loop.run(None) {
                    Ok(LoopStatus::Again) => continue,
                    Ok(LoopStatus::Done) => break,
                    Err(e) => {
                        error!(thread_log, "event loop failed"; "error" => %e);
                        break;
                    }
                }
            })
            .map_err(DeviceError::Io)?;

        Ok(Arc::new(Self {
            log,
            loop_,
            loop_thread: Mutex::new(Some(handle)),
            devices: Mutex::new(Vec::new()),
        }))
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.loop_
    }

    /// Register a virtio-blk device backed by `backend`, serving requests
    /// through `rq`.
    pub fn register_block(
        &self,
        params: BlockParams,
        rq: &Arc<RequestQueue<Bio>>,
        backend: Arc<dyn block::Backend>,
    ) -> Result<Arc<DeviceHandle>, DeviceError> {
        let native = backend.info();
        let lbs = params.block_size;
        if !lbs.is_power_of_two()
            || lbs < native.block_size
            || native.block_size == 0
            || lbs % native.block_size != 0
        {
            return Err(DeviceError::BadBlockSize(lbs));
        }
        let total_blocks = if params.total_blocks == 0 {
            native.capacity_bytes() / u64::from(lbs)
        } else {
            params.total_blocks
        };
        if total_blocks == 0
            || total_blocks * u64::from(lbs) > native.capacity_bytes()
        {
            return Err(DeviceError::BadGeometry);
        }

        let state = block_front::BlockState::new(
            block::DeviceInfo {
                block_size: lbs,
                total_blocks,
                read_only: params.read_only || native.read_only,
            },
            &params.serial,
            backend,
        );
        self.register_common(
            params.socket_path,
            params.num_queues,
            params.queue_size,
            rq,
            DeviceKind::Block(state),
            params.map_cb,
            params.unmap_cb,
        )
    }

    /// Register a virtio-fs device.  Requests reach the worker as raw
    /// buffer vectors; FUSE parsing is the consumer's business.
    pub fn register_fs(
        &self,
        params: FsParams,
        rq: &Arc<RequestQueue<Bio>>,
    ) -> Result<Arc<DeviceHandle>, DeviceError> {
        if params.tag.is_empty() || params.tag.len() > 36 {
            return Err(DeviceError::BadTag);
        }
        let state = fs_front::FsState { tag: params.tag };
        self.register_common(
            params.socket_path,
            params.num_queues,
            params.queue_size,
            rq,
            DeviceKind::Fs(state),
            None,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn register_common(
        &self,
        socket_path: PathBuf,
        num_queues: u16,
        queue_size: u16,
        rq: &Arc<RequestQueue<Bio>>,
        kind: DeviceKind,
        map_cb: Option<MemEventFn>,
        unmap_cb: Option<MemEventFn>,
    ) -> Result<Arc<DeviceHandle>, DeviceError> {
        if num_queues == 0
            || !queue_size.is_power_of_two()
            || queue_size > VIRTQ_MAX_SIZE
        {
            return Err(DeviceError::BadQueueConfig);
        }

        let name = socket_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vhost-device".to_string());
        let log = self.log.new(o!("device" => name.clone()));

        match std::fs::remove_file(&socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(DeviceError::Io(e)),
        }
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        let listener_fd = listener.as_raw_fd();

        let loop_ = self.loop_.clone();
        let handle = Arc::new_cyclic(|weak: &Weak<DeviceHandle>| {
            let queues = (0..num_queues)
                .map(|i| {
                    Arc::new(DeviceQueue {
                        vq: VirtQueue::new(
                            i,
                            queue_size,
                            log.new(o!("queue" => usize::from(i))),
                        ),
                        dev: weak.clone(),
                        kick_fd: Mutex::new(None),
                    })
                })
                .collect();
            DeviceHandle {
                name,
                log: log.clone(),
                kind,
                space: AddressSpace::new(),
                loop_: loop_.clone(),
                rq: rq.clone(),
                queues,
                socket_path,
                listener: Mutex::new(Some(listener)),
                listener_fd,
                accepting: AtomicBool::new(true),
                tracking: Tracking::new(),
                conns: Mutex::new(Vec::new()),
                cur_regions: Mutex::new(Vec::new()),
                map_cb,
                unmap_cb,
            }
        });

        let accept_ref = Arc::downgrade(&handle);
        self.loop_.register_fd(
            listener_fd,
            Events::READABLE,
            Box::new(move |_| {
                if let Some(dev) = accept_ref.upgrade() {
                    dev.accept_pending();
                }
            }),
        )?;

        info!(handle.log, "device registered";
            "socket" => handle.socket_path.display().to_string(),
            "queues" => usize::from(num_queues));
        self.devices.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    /// Asynchronously unregister a device.
    ///
    /// New avail entries stop being consumed immediately.  Once every
    /// in-flight request has committed (or completed as canceled), the
    /// virtqueues are detached, the socket is closed, and `on_done` runs
    /// on the device's event loop.  The backend must stay alive until
    /// then.
    pub fn unregister(
        &self,
        handle: &Arc<DeviceHandle>,
        on_done: impl FnOnce() + Send + 'static,
    ) {
        handle.accepting.store(false, Ordering::Release);
        self.devices
            .lock()
            .unwrap()
            .retain(|dev| !Arc::ptr_eq(dev, handle));

        let dev = handle.clone();
        self.loop_.schedule(move || {
            dev.detach_listener();
            let teardown_dev = dev.clone();
            dev.tracking.on_zero(Box::new(move || {
                for dq in &teardown_dev.queues {
                    dq.vq.release();
                }
                teardown_dev.space.clear();
                info!(teardown_dev.log, "device unregistered");
                on_done();
            }));
        });
    }

    /// Stop the server.  All devices should have been unregistered first.
    pub fn shutdown(&self) {
        let remaining = self.devices.lock().unwrap().len();
        if remaining != 0 {
            warn!(self.log, "shutting down with devices still registered";
                "count" => remaining);
        }
        self.loop_.terminate();
        if let Some(thread) = self.loop_thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}
