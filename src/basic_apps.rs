// BASIC APPS
//
// A small library of generic, protocol-agnostic apps, kept only as
// illustrative fixtures for the engine's own tests and doc examples.
//
//   Source - generate synthetic packets of a fixed size
//   Sink - receive and discard packets
//   Join - forward packets from every input onto one output
//   Tee - forward packets from every input onto every output
//   Repeater - buffer and indefinitely replay the packets it is sent

use super::engine;
use super::link;
use super::packet;
use super::util;

use std::cell::{Cell, RefCell};

#[derive(Clone, Debug)]
pub struct Source { pub size: u16 }
impl engine::AppConfig for Source {
    fn new(&self) -> Box<dyn engine::App> {
        Box::new(SourceApp { size: self.size })
    }
}
pub struct SourceApp { size: u16 }
impl engine::App for SourceApp {
    fn has_pull(&self) -> bool { true }
    fn pull(&self, slot: &engine::AppSlot) {
        for output in slot.output.values() {
            let mut output = output.borrow_mut();
            for _ in 0..engine::PULL_NPACKETS {
                let mut p = packet::allocate();
                util::fill(&mut p.data, self.size as usize, 0);
                p.length = self.size;
                link::transmit(&mut output, p);
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Sink {}
impl engine::AppConfig for Sink {
    fn new(&self) -> Box<dyn engine::App> {
        Box::new(SinkApp {})
    }
}
pub struct SinkApp {}
impl engine::App for SinkApp {
    fn has_push(&self) -> bool { true }
    fn push(&self, slot: &engine::AppSlot) {
        for input in slot.input.values() {
            let mut input = input.borrow_mut();
            while !link::empty(&input) {
                packet::free(link::receive(&mut input));
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Join {}
impl engine::AppConfig for Join {
    fn new(&self) -> Box<dyn engine::App> {
        Box::new(JoinApp {})
    }
}
pub struct JoinApp {}
impl engine::App for JoinApp {
    fn has_push(&self) -> bool { true }
    fn push(&self, slot: &engine::AppSlot) {
        if let Some(output) = slot.output.get("output") {
            let mut output = output.borrow_mut();
            for input in slot.input.values() {
                let mut input = input.borrow_mut();
                while !link::empty(&input) {
                    link::transmit(&mut output, link::receive(&mut input));
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct Tee {}
impl engine::AppConfig for Tee {
    fn new(&self) -> Box<dyn engine::App> {
        Box::new(TeeApp {})
    }
}
pub struct TeeApp {}
impl engine::App for TeeApp {
    fn has_push(&self) -> bool { true }
    fn push(&self, slot: &engine::AppSlot) {
        for input in slot.input.values() {
            let mut input = input.borrow_mut();
            while !link::empty(&input) {
                let p = link::receive(&mut input);
                for output in slot.output.values() {
                    let mut output = output.borrow_mut();
                    link::transmit(&mut output, packet::clone(&p));
                }
                packet::free(p);
            }
        }
    }
}

// Repeater: buffers every packet it is sent, then replays the whole buffer
// on every push once its input goes quiet, looping forever. Useful for
// driving a downstream app with a fixed, repeating trace.
#[derive(Clone, Debug, Default)]
pub struct Repeater {}
impl engine::AppConfig for Repeater {
    fn new(&self) -> Box<dyn engine::App> {
        Box::new(RepeaterApp { buffer: RefCell::new(Vec::new()), position: Cell::new(0) })
    }
}
pub struct RepeaterApp {
    buffer: RefCell<Vec<Box<packet::Packet>>>,
    position: Cell<usize>,
}
impl engine::App for RepeaterApp {
    fn has_push(&self) -> bool { true }
    fn push(&self, slot: &engine::AppSlot) {
        if let Some(input) = slot.input.values().next() {
            let mut input = input.borrow_mut();
            while !link::empty(&input) {
                self.buffer.borrow_mut().push(link::receive(&mut input));
            }
        }
        if let Some(output) = slot.output.values().next() {
            let buffer = self.buffer.borrow();
            if !buffer.is_empty() {
                let mut output = output.borrow_mut();
                let position = self.position.get();
                let p = packet::clone(&buffer[position]);
                link::transmit(&mut output, p);
                self.position.set((position + 1) % buffer.len());
            }
        }
    }
    fn has_stop(&self) -> bool { true }
    fn stop(&self) {
        // Buffered packets are this app's own copies; free them rather
        // than letting Packet's Drop panic about a leak.
        for p in self.buffer.borrow_mut().drain(..) {
            packet::free(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn wire(a: &str, aport: &str, b: &str, bport: &str) -> String {
        format!("{}.{} -> {}.{}", a, aport, b, bport)
    }

    #[test]
    fn source_and_sink_move_packets() {
        let mut c = config::new();
        config::app(&mut c, "source", &Source { size: 60 });
        config::app(&mut c, "sink", &Sink {});
        config::link(&mut c, &wire("source", "output", "sink", "input")).unwrap();
        engine::configure(&c).unwrap();
        engine::breathe();
        // no assertion needed beyond "did not panic": Sink frees everything
        // Source pulls, satisfying Packet's must-be-freed invariant.
    }

    #[test]
    fn tee_duplicates_onto_every_output() {
        let mut c = config::new();
        config::app(&mut c, "source", &Source { size: 60 });
        config::app(&mut c, "tee", &Tee {});
        config::app(&mut c, "sinka", &Sink {});
        config::app(&mut c, "sinkb", &Sink {});
        config::link(&mut c, &wire("source", "output", "tee", "input")).unwrap();
        config::link(&mut c, &wire("tee", "a", "sinka", "input")).unwrap();
        config::link(&mut c, &wire("tee", "b", "sinkb", "input")).unwrap();
        engine::configure(&c).unwrap();
        engine::breathe();
    }

    #[test]
    fn repeater_replays_buffered_packets_on_quiet_input() {
        let mut c = config::new();
        config::app(&mut c, "source", &Source { size: 60 });
        config::app(&mut c, "repeater", &Repeater {});
        config::app(&mut c, "sink", &Sink {});
        config::link(&mut c, &wire("source", "output", "repeater", "input")).unwrap();
        config::link(&mut c, &wire("repeater", "output", "sink", "input")).unwrap();
        engine::configure(&c).unwrap();
        for _ in 0..5 {
            engine::breathe();
        }
    }
}
