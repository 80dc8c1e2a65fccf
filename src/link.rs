// LINK STRUCT AND OPERATIONS
//
// This module defines a struct to represent unidirectional network links,
// implemented as circular ring buffers, and link operations.
//
//   Link - opaque link structure
//   LINK_RING_SIZE - default capacity of the ring (power of two)
//   LINK_MAX_PACKETS - default capacity of a Link
//   new() -> Link - allocate a new empty Link at the default capacity
//   new_with_capacity(usize) -> Link - allocate a Link holding at least
//       that many packets, for apps that need a different depth/latency
//       tradeoff than the default
//   max_packets(&Link) -> usize - this Link's actual capacity
//   full(&Link) -> bool - predicate to test if Link is full
//   empty(&Link) -> bool - predicate to test if Link is empty
//   receive(&mut Link) -> Box<Packet> - dequeue a packet from the Link
//   transmit(&mut Link, Box<Packet>) - enqueue a packet on the Link

use super::packet;

// Default size of the ring buffer.
const LINK_RING_SIZE: usize = 1024;

// Default capacity of a Link.
pub const LINK_MAX_PACKETS: usize = LINK_RING_SIZE - 1;

pub struct Link {
    // this is a circular ring buffer, as described at:
    //   http://en.wikipedia.org/wiki/Circular_buffer
    packets: Vec<*mut packet::Packet>,
    // Size of `packets`, always a power of two so index wraparound can use
    // a bitmask instead of a modulo.
    ring_size: i32,
    // Two cursors:
    //   read:  the next element to be read
    //   write: the next element to be written
    read: i32, write: i32,
    // Link stats:
    pub txpackets: u64, pub txbytes: u64, pub txdrop: u64,
    pub rxpackets: u64, pub rxbytes: u64,
    // Set by transmit() whenever a packet is enqueued; cleared by the
    // breath scheduler's push sweep (see engine::breathe). Drives the
    // push fixed-point: a link with new data gets its consumer's push
    // hook invoked again next sweep.
    pub has_new_data: bool,
    // Index of the consumer app in the engine's active app array, set by
    // the reconfigurator during link reconciliation. `None` only
    // momentarily, between a link's creation and its first reconciliation.
    pub consumer: Option<usize>,
}

pub fn new() -> Link {
    new_with_capacity(LINK_MAX_PACKETS)
}

// Allocate a Link that holds at least `capacity` packets. The ring is
// rounded up to the next power of two (plus the one always-empty slot a
// ring buffer needs to distinguish full from empty).
pub fn new_with_capacity(capacity: usize) -> Link {
    let ring_size = (capacity + 1).next_power_of_two();
    Link { packets: vec![std::ptr::null_mut(); ring_size],
           ring_size: ring_size as i32,
           read: 0, write: 0,
           txpackets: 0, txbytes: 0, txdrop: 0,
           rxpackets: 0, rxbytes: 0,
           has_new_data: false, consumer: None }
}

pub fn max_packets(r: &Link) -> usize { (r.ring_size - 1) as usize }

pub fn empty(r: &Link) -> bool { r.read == r.write }

pub fn full(r: &Link) -> bool { (r.write + 1) & (r.ring_size - 1) == r.read }

// Box::from_raw will never alias because receive/transmit ensure any Packet is
// either on a single Link, or on no Link at all.
pub fn receive(r: &mut Link) -> Box<packet::Packet> {
    if empty(r) { panic!("Link underflow."); }
    let p = unsafe { Box::from_raw(r.packets[r.read as usize]) };
    r.read = (r.read + 1) & (r.ring_size - 1);
    r.rxpackets += 1;
    r.rxbytes += p.length as u64;
    p
}

// Enqueue a packet. If the ring is full the packet is dropped and txdrop is
// incremented -- this is normal backpressure, not an error.
#[inline(always)]
pub fn transmit(r: &mut Link, mut p: Box<packet::Packet>) {
    if full(r) {
        r.txdrop += 1;
        packet::free(p);
    } else {
        r.txpackets += 1;
        r.txbytes += p.length as u64;
        r.packets[r.write as usize] = &mut *p; std::mem::forget(p);
        r.write = (r.write + 1) & (r.ring_size - 1);
        r.has_new_data = true;
    }
}

// Ensure that Dropped Links are empty (otherwise Dropping a link would leak
// its remaining enqueued packets).
// NB: a non-empty Link going out of scope will trigger a panic.
impl Drop for Link {
    fn drop(&mut self) {
        while !empty(self) { packet::free(receive(self)); }
    }
}
