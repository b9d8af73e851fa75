//! Packet buffers and the shared pool they are drawn from.
//!
//! Clear and crypto grab a buffer from the pool for every packet they
//! read off their respective interface and hand it to encrypt/decrypt;
//! encrypt/decrypt hand it back to crypto/clear once transformed. The
//! pool's free list is itself a [`Ring`] of buffer indices, so getting
//! and returning a buffer is exactly as cheap as any other ring op.

use std::convert::TryInto;
use std::net::SocketAddrV4;

use crate::ring::Ring;
use crate::wire;

pub const POOL_CAPACITY: usize = 1024;
pub const PACKET_HEAD_LEN: usize = wire::HEADER_LEN;
pub const PACKET_DATA_LEN: usize = 1500;
pub const PACKET_TRAIL_LEN: usize = wire::TRAIL_LEN;
pub const PACKET_TAG_LEN: usize = 16;
pub const PACKET_MAX_LEN: usize = PACKET_HEAD_LEN + PACKET_DATA_LEN + PACKET_TRAIL_LEN + PACKET_TAG_LEN;
pub const PACKET_MIN_LEN: usize = 12;

/// Which worker a packet is currently destined for, carried alongside it
/// so a process dequeuing from a ring it doesn't privately own (there are
/// none today, but the field mirrors the original's sanity check) can
/// assert the packet is actually meant for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Target {
    None = 0,
    Clear = 1,
    Crypto = 2,
    Encrypt = 3,
    Decrypt = 4,
}

/// A single packet buffer. `length` counts bytes from [`PACKET_HEAD_LEN`]
/// onward -- i.e. everything except the 16-byte ESP header room, which is
/// filled in separately once a packet number and SPI are assigned.
///
/// `source_ip`/`source_port` record the UDP source address a
/// `Target::Decrypt` packet arrived from, so the decrypt worker can
/// compare it against the stored peer cell and roam to a new address
/// on a successfully authenticated packet, without the crypto worker
/// having to touch the peer cell itself.
#[repr(C)]
pub struct Packet {
    length: usize,
    target: Target,
    source_ip: u32,
    source_port: u16,
    buf: [u8; PACKET_MAX_LEN],
}

impl Packet {
    /// A process-local packet not backed by the shared pool, used when
    /// the pool is momentarily exhausted so inbound I/O can still drain
    /// a file descriptor -- whatever lands here is always discarded.
    pub fn scratch() -> Self {
        Packet {
            length: 0,
            target: Target::None,
            source_ip: 0,
            source_port: 0,
            buf: [0u8; PACKET_MAX_LEN],
        }
    }

    fn reset(&mut self) {
        self.length = 0;
        self.target = Target::None;
        self.source_ip = 0;
        self.source_port = 0;
    }

    pub fn source(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.source_ip.into(), self.source_port)
    }

    pub fn set_source(&mut self, addr: SocketAddrV4) {
        self.source_ip = u32::from(*addr.ip());
        self.source_port = addr.port();
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(len <= PACKET_DATA_LEN + PACKET_TRAIL_LEN + PACKET_TAG_LEN);
        self.length = len;
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn set_target(&mut self, target: Target) {
        self.target = target;
    }

    /// The region application/ciphertext data occupies today.
    pub fn payload(&self) -> &[u8] {
        &self.buf[PACKET_HEAD_LEN..PACKET_HEAD_LEN + self.length]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PACKET_HEAD_LEN..PACKET_HEAD_LEN + self.length]
    }

    /// Space available to grow the payload into, e.g. before encryption
    /// appends a trailer and tag.
    pub fn spare_capacity(&self) -> usize {
        (PACKET_MAX_LEN - PACKET_HEAD_LEN) - self.length
    }

    /// Copy raw plaintext (e.g. straight off the tun device) into the
    /// payload region, replacing whatever was there.
    pub fn fill_payload(&mut self, data: &[u8]) {
        assert!(data.len() <= PACKET_DATA_LEN);
        self.buf[PACKET_HEAD_LEN..PACKET_HEAD_LEN + data.len()].copy_from_slice(data);
        self.length = data.len();
    }

    /// The fixed `PACKET_DATA_LEN`-sized region the payload lives in,
    /// before `length` is known -- for reading directly off a tun device
    /// or socket instead of copying through [`Packet::fill_payload`].
    pub fn data_region_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PACKET_HEAD_LEN..PACKET_HEAD_LEN + PACKET_DATA_LEN]
    }

    /// The entire backing buffer, header room included. Used by the
    /// crypto worker, which reads/writes the ESP header and ciphertext
    /// as a single contiguous UDP datagram rather than filling the
    /// header and payload through separate accessors.
    pub fn raw_mut(&mut self) -> &mut [u8; PACKET_MAX_LEN] {
        &mut self.buf
    }

    /// Set the payload length from the size of a full wire read (header
    /// included), as produced by a `recvfrom` into [`Packet::raw_mut`].
    pub fn set_wire_len(&mut self, wire_len: usize) {
        assert!(wire_len >= PACKET_HEAD_LEN);
        self.set_len(wire_len - PACKET_HEAD_LEN);
    }

    pub fn header(&self) -> Option<wire::Header> {
        wire::Header::decode(&self.buf[0..PACKET_HEAD_LEN])
    }

    pub fn set_header(&mut self, header: &wire::Header) {
        header.encode(&mut self.buf[0..PACKET_HEAD_LEN]);
    }

    /// The complete on-wire representation: header followed by whatever
    /// currently occupies the payload region (ciphertext + trailer + tag
    /// once encrypted).
    pub fn wire(&self) -> &[u8] {
        &self.buf[0..PACKET_HEAD_LEN + self.length]
    }

    /// Append bytes to the end of the current payload (used to attach the
    /// plaintext trailer before encryption, and again by the cipher to
    /// append its tag).
    pub fn append(&mut self, data: &[u8]) {
        assert!(data.len() <= self.spare_capacity());
        let start = PACKET_HEAD_LEN + self.length;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.length += data.len();
    }

    /// Truncate the payload, discarding the last `n` bytes (used to strip
    /// the AEAD tag after a successful decrypt).
    pub fn truncate(&mut self, new_len: usize) {
        assert!(new_len <= self.length);
        self.length = new_len;
    }
}

/// A fixed-size shared-memory backed pool of [`Packet`] buffers plus the
/// free-list ring that tracks which indices are available.
#[repr(C)]
pub struct PoolStore {
    packets: [Packet; POOL_CAPACITY],
    free: Ring,
}

impl PoolStore {
    /// # Safety
    /// `store` must point at a zero-initialized, appropriately sized
    /// and aligned `PoolStore` no other process is using yet.
    pub unsafe fn init(store: *mut PoolStore) {
        let free_ptr = std::ptr::addr_of_mut!((*store).free);
        Ring::init(free_ptr, POOL_CAPACITY);
        let free = &*free_ptr;
        for i in 0..POOL_CAPACITY as u32 {
            free.queue(i).expect("freshly initialized ring has capacity");
        }
    }
}

/// A handle onto a [`PoolStore`] living in shared memory.
#[derive(Clone, Copy)]
pub struct Pool {
    store: *const PoolStore,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// # Safety
    /// `store` must point at an initialized `PoolStore` valid for as long
    /// as this handle is used.
    pub unsafe fn from_raw(store: *mut PoolStore) -> Self {
        Self { store }
    }

    fn free(&self) -> &Ring {
        unsafe { &(*self.store).free }
    }

    /// Obtain a buffer from the pool, resetting its length and target.
    /// Returns `None` if the pool is momentarily exhausted -- callers
    /// should fall back to a process-local scratch buffer rather than
    /// block, so inbound I/O is never starved by pool backpressure.
    pub fn get(&self) -> Option<PacketHandle> {
        let idx = self.free().dequeue()?;
        let packet = unsafe { &mut *(self.packet_ptr(idx)) };
        packet.reset();
        Some(PacketHandle { pool: *self, idx })
    }

    /// Return a buffer to the pool by index. Used internally by
    /// [`PacketHandle::release`]; exposed for workers that need to pass
    /// bare indices through a ring rather than a `PacketHandle`.
    pub fn put(&self, idx: u32) {
        let _ = self.free().queue(idx);
    }

    fn packet_ptr(&self, idx: u32) -> *mut Packet {
        unsafe {
            let base = std::ptr::addr_of!((*self.store).packets) as *mut Packet;
            base.add(idx as usize)
        }
    }

    pub unsafe fn packet(&self, idx: u32) -> &mut Packet {
        &mut *self.packet_ptr(idx)
    }
}

/// An owned reference to one packet buffer drawn from a [`Pool`]. Dropping
/// it without calling [`PacketHandle::release`] explicitly still returns
/// the buffer (the common "drop a malformed packet" path), matching the
/// "always return on drop" discipline the packet-level error kind needs.
pub struct PacketHandle {
    pool: Pool,
    idx: u32,
}

impl PacketHandle {
    pub fn index(&self) -> u32 {
        self.idx
    }

    pub fn take_index(self) -> u32 {
        let idx = self.idx;
        std::mem::forget(self);
        idx
    }
}

impl std::ops::Deref for PacketHandle {
    type Target = Packet;

    fn deref(&self) -> &Packet {
        unsafe { &*self.pool.packet_ptr(self.idx) }
    }
}

impl std::ops::DerefMut for PacketHandle {
    fn deref_mut(&mut self) -> &mut Packet {
        unsafe { &mut *self.pool.packet_ptr(self.idx) }
    }
}

impl Drop for PacketHandle {
    fn drop(&mut self) {
        self.pool.put(self.idx);
    }
}

#[allow(dead_code)]
fn _assert_header_len_matches() {
    let _: [u8; PACKET_HEAD_LEN] = [0; wire::HEADER_LEN];
    let _ = TryInto::<[u8; 0]>::try_into(Vec::<u8>::new());
}
