use super::engine;
use super::util;

use std::cmp;
use std::mem;

// PACKET STRUCT AND FREELIST
//
// This module defines a struct to represent packets of network data, and
// implements a global freelist from which packets can be allocated.
//
//   Packet - packet structure with length and data fields
//   PAYLOAD_SIZE - size of packet's data field
//   preallocate(usize) - preallocate a minimum amount of packets
//   allocate() -> Box<Packet> - take a packet off the freelist for use
//   free(Box<Packet>) - return a packet to the freelist
//   clone(Box<Packet>) -> Box<Packet> - return a copy of packet
//   bitlength(Box<Packet>) -> u64 - return bit length of packet on-the-wire
//
// Packets are arena-allocated from a process-wide free-list rather than
// handed to the system allocator one at a time; the engine hands out raw,
// heap-backed buffers (DMA/hugepage-backed allocation is NIC-driver
// territory and lives outside the core).

// The maximum amount of payload in any given packet (10 KiB).
pub const PAYLOAD_SIZE: usize = 10_240;

// Packet of network data, with associated metadata.
pub struct Packet {
    pub length: u16, // data payload length
    pub data: [u8; PAYLOAD_SIZE]
}

// A packet may never go out of scope. It is either on the freelist, a link, or
// in active use (in-scope). Dropping a live packet is an app bug: the app
// must either forward it onto another link or call free() explicitly.
impl Drop for Packet { fn drop(&mut self) { panic!("Packet leaked"); } }

fn new_packet() -> Box<Packet> {
    Box::new(Packet { length: 0, data: [0; PAYLOAD_SIZE] })
}

// Maximum number of packets on the freelist.
const MAX_PACKETS: usize = 1_000_000;

// Freelist consists of an array of mutable raw pointers to Packet,
// and a fill counter.
struct Freelist {
    list: [*mut Packet; MAX_PACKETS],
    nfree: usize
}

// FL: global freelist (initially empty, populated with null ptrs).
static mut FL: Freelist = Freelist {
    list: [std::ptr::null_mut(); MAX_PACKETS],
    nfree: 0
};

// Preallocate at least n packets.
pub fn preallocate(n: usize) {
    while unsafe { PACKETS_ALLOCATED } < n {
        preallocate_step();
    }
}

// Fill up FL with freshly allocated packets.
// NB: using FL is unsafe because it is a mutable static; the engine's
// single-threaded scheduling model is what makes this sound -- no two
// threads ever touch FL concurrently.
static mut PACKETS_ALLOCATED: usize = 0;
static mut PACKET_ALLOCATION_STEP: usize = 1000;
fn preallocate_step () {
    unsafe {
        assert!(PACKETS_ALLOCATED + PACKET_ALLOCATION_STEP <= MAX_PACKETS,
                "Packet allocation overflow");

        for _ in 0..PACKET_ALLOCATION_STEP {
            free_internal(new_packet());
        }
        PACKETS_ALLOCATED += PACKET_ALLOCATION_STEP;
        PACKET_ALLOCATION_STEP *= 2;
    }
}

// Allocate an empty Boxed Packet from FL.
#[inline(always)]
pub fn allocate() -> Box<Packet> {
    if unsafe { FL.nfree == 0 } {
        preallocate_step();
    }
    unsafe { FL.nfree -= 1; }
    unsafe { Box::from_raw(FL.list[FL.nfree]) }
}

// Return Boxed Packet to FL.
fn free_internal(mut p: Box<Packet>) {
    if unsafe { FL.nfree } == MAX_PACKETS { panic!("Packet freelist overflow"); }
    p.length = 0;
    unsafe { FL.list[FL.nfree] = &mut *p; } mem::forget(p);
    unsafe { FL.nfree += 1; }
}
pub fn free (p: Box<Packet>) {
    engine::add_frees();
    engine::add_freebytes(p.length as u64);
    engine::add_freebits(bitlength(&p));
    free_internal(p);
}

// Clone a packet
pub fn clone (p: &Box<Packet>) -> Box<Packet> {
    let mut copy = allocate();
    util::copy(&mut copy.data, &p.data, p.length as usize);
    copy.length = p.length;
    copy
}

pub fn bitlength(p: &Box<Packet>) -> u64 {
    // Calculate bits of physical capacity required for packet on 10GbE.
    // Account for minimum data size and overhead of Ethernet preamble, CRC,
    // and inter-packet gap.
    // https://netoptimizer.blogspot.com/2014/05/the-calculations-10gbits-wirespeed.html
    (12 + 8 + cmp::max(p.length as u64, 60) + 4) * 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc() {
        let mut p = allocate();
        assert_eq!(p.length, 0);
        p.length = 1;
        p.data[0] = 42;
        let len = p.length;
        free(p); // Not freeing would cause panic
        assert_eq!(len, 1);
    }

    #[test]
    fn clone_copies_data_and_length() {
        let mut p = allocate();
        p.length = 3;
        p.data[0] = 1; p.data[1] = 2; p.data[2] = 3;
        let c = clone(&p);
        assert_eq!(c.length, p.length);
        assert_eq!(&c.data[0..3], &p.data[0..3]);
        free(p);
        free(c);
    }

    #[test]
    fn bitlength_accounts_for_minimum_frame_size() {
        let mut p = allocate();
        p.length = 1; // shorter than the 60-byte Ethernet minimum
        assert_eq!(bitlength(&p), (12 + 8 + 60 + 4) * 8);
        p.length = 1000;
        assert_eq!(bitlength(&p), (12 + 8 + 1000 + 4) * 8);
        free(p);
    }

    #[test]
    #[should_panic(expected = "Packet leaked")]
    fn dropping_an_unfreed_packet_panics() {
        let p = allocate();
        drop(p);
    }
}
