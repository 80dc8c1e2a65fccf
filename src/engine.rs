// ENGINE: app/link graph, breath scheduler, fault shield, pacer
//
// This is the core of the dataflow engine. A configuration is a set of named
// app instances wired together by named links; the engine runs that graph
// breath by breath until told to stop.
//
//   App - trait implemented by app instances (pull/push/reconfig/link/stop)
//   AppConfig - trait implemented by an app's argument type (constructs App)
//   AppArg - AppConfig + identity/equality, used to diff two configurations
//   AppSlot - one app's live state: its instance, argument, and attached links
//   configure(&Config) -> Result<(), ConfigError> - apply a new configuration
//   main(Option<Options>) - run breaths until the done predicate fires
//   now() / timeout() / throttle() - time helpers
//   report_load() / report_links() / report_apps() - human-readable reports
//
// Single-threaded cooperative scheduling: nothing here takes a lock, because
// nothing here runs on more than one thread. Parallelism is achieved by
// running more than one engine process, not by threading within one.

use super::config;
use super::config::ConfigError;
use super::counter;
use super::link;
use super::timeline;
use super::timeline::Severity;

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::cmp;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use log::{info, warn};
use once_cell::unsync::Lazy;

// Maximum number of packets to pull onto a link in a single pull call,
// keeping any one app's pull from hogging a whole breath.
pub const PULL_NPACKETS: usize = link::LINK_MAX_PACKETS / 10;

pub type SharedLink = Rc<RefCell<link::Link>>;

// API: An app instance. All methods are opt-in via the matching `has_*`
// predicate; the default bodies are never meant to run (an app that claims
// `has_push() == true` but leaves `push` as the default is a bug in that
// app, not in the engine).
pub trait App {
    fn has_pull(&self) -> bool { false }
    fn pull(&self, _slot: &AppSlot) { unimplemented!("pull") }

    fn has_push(&self) -> bool { false }
    fn push(&self, _slot: &AppSlot) { unimplemented!("push") }

    fn has_report(&self) -> bool { false }
    fn report(&self) {}

    fn has_stop(&self) -> bool { false }
    fn stop(&self) {}

    // Apply a same-class argument change in place, without restarting the
    // app (dropping buffered state). Only called when `has_reconfig()` is
    // true and the new argument's class matches the old one.
    fn has_reconfig(&self) -> bool { false }
    fn reconfig(&self, _new_arg: &dyn AppArg) { unimplemented!("reconfig") }

    // Called once after this app's links have been attached or changed by
    // the reconfigurator, to let it cache port references or similar.
    fn has_link(&self) -> bool { false }
    fn link(&self, _slot: &AppSlot) {}
}

// API: An app's argument type constructs its App instance and carries
// display/identity metadata used by the reconfigurator.
pub trait AppConfig: std::fmt::Debug {
    fn new(&self) -> Box<dyn App>;

    // Optional diagnostic label grouping related apps (e.g. "pci:0000:01:00.0").
    fn zone(&self) -> Option<String> { None }

    // Counter names this app wants tracked via a CounterFrame, if any.
    fn counter_frame_keys(&self) -> Option<Vec<String>> { None }
}

// API: AppConfig extended with identity/equality and dynamic class
// comparison, used internally by the reconfigurator to diff two
// configurations. Blanket-implemented: any app argument type that is
// Debug + Clone + 'static gets this for free.
pub trait AppArg: AppConfig + AppClone + Any {
    // Structural identity of the argument value, compared between old and
    // new configuration to detect "same class, changed value".
    fn identity(&self) -> String { format!("{:?}", self) }

    // Runtime type of the concrete argument struct, compared between old
    // and new configuration to detect "different app class entirely".
    fn class_id(&self) -> TypeId;

    fn equal(&self, other: &dyn AppArg) -> bool {
        self.class_id() == other.class_id() && self.identity() == other.identity()
    }
}

impl<T: AppConfig + AppClone + 'static> AppArg for T {
    fn class_id(&self) -> TypeId { TypeId::of::<T>() }
}

// Clone is not object-safe, so `Box<dyn AppArg>` needs this indirection to
// be cloneable.
pub trait AppClone: AppConfig {
    fn box_clone(&self) -> Box<dyn AppArg>;
}

impl<T: AppConfig + Clone + 'static> AppClone for T {
    fn box_clone(&self) -> Box<dyn AppArg> { Box::new(self.clone()) }
}

impl Clone for Box<dyn AppArg> {
    fn clone(&self) -> Self { self.box_clone() }
}

// A fault caught by the shield: the app is suspended until restart_delay
// has elapsed since `time`, at which point the engine restarts it from its
// last-known-good argument.
pub struct Dead {
    pub error: String,
    pub time: Instant,
}

// A set of ports (link attachment points) on one side of an app, addressable
// both by the name the link spec used and by the order they were attached
// in. The two views always agree: `get(name)` and `get_index(by_name_index)`
// return the same link.
#[derive(Default)]
pub struct PortTable {
    names: Vec<String>,
    links: Vec<SharedLink>,
    by_name: HashMap<String, usize>,
}

impl PortTable {
    pub fn new() -> Self { PortTable::default() }

    pub fn insert(&mut self, name: String, link: SharedLink) {
        match self.by_name.get(&name) {
            Some(&idx) => { self.links[idx] = link; }
            None => {
                self.by_name.insert(name.clone(), self.links.len());
                self.names.push(name);
                self.links.push(link);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&SharedLink> {
        self.by_name.get(name).map(|&idx| &self.links[idx])
    }

    pub fn get_index(&self, idx: usize) -> Option<&SharedLink> { self.links.get(idx) }

    pub fn name_at(&self, idx: usize) -> Option<&str> { self.names.get(idx).map(String::as_str) }

    pub fn len(&self) -> usize { self.links.len() }

    pub fn is_empty(&self) -> bool { self.links.is_empty() }

    pub fn values(&self) -> impl Iterator<Item = &SharedLink> { self.links.iter() }

    pub fn clear(&mut self) {
        self.names.clear();
        self.links.clear();
        self.by_name.clear();
    }
}

// One app's live state in the active configuration.
pub struct AppSlot {
    pub name: String,
    pub zone: Option<String>,
    pub app: Box<dyn App>,
    pub conf: Box<dyn AppArg>,
    pub input: PortTable,
    pub output: PortTable,
    pub dead: Option<Dead>,
    pub counters: Option<counter::CounterFrame>,
}

#[derive(Clone, Copy, Debug)]
pub enum PacerMode {
    // Sleep an adaptively-growing/shrinking delay whenever a breath frees
    // no packets, capped at maxsleep_us; busy-spin otherwise.
    Adaptive { maxsleep_us: u64 },
    // Sleep whatever is left of a fixed 1/hz period after each breath.
    Fixed { hz: f64 },
    // Never sleep.
    Busywait,
}

impl Default for PacerMode {
    fn default() -> Self { PacerMode::Adaptive { maxsleep_us: 100 } }
}

#[derive(Default)]
pub struct EngineStats {
    pub breaths: u64,
    pub frees: u64,
    pub freebytes: u64,
    pub freebits: u64,
    pub configs: u64,
}

struct LatencyHistogram {
    buckets: [u64; LatencyHistogram::NBUCKETS],
}

impl LatencyHistogram {
    const NBUCKETS: usize = 21; // log2(microseconds), 1us .. ~1s

    fn new() -> Self { LatencyHistogram { buckets: [0; Self::NBUCKETS] } }

    fn record(&mut self, d: Duration) {
        let us = cmp::max(d.as_micros(), 1) as u64;
        let bucket = cmp::min((63 - us.leading_zeros()) as usize, Self::NBUCKETS - 1);
        self.buckets[bucket] += 1;
    }
}

pub struct EngineState {
    pub app_table: HashMap<String, usize>,
    pub app_array: Vec<AppSlot>,
    pub link_table: HashMap<String, SharedLink>,
    pub link_array: Vec<SharedLink>,
    pub current: config::Config,
    // Strict mode: app panics propagate and crash the process. Tolerant
    // mode: the fault shield catches them and restarts the app later.
    pub strict: bool,
    pub restart_delay: Duration,
    pub pacer_mode: PacerMode,
    pacer_sleep_us: u64,
    pacer_lastfrees: u64,
    pacer_nextbreath: Option<Instant>,
    timers: Vec<Box<dyn FnMut()>>,
    timeline: timeline::Timeline,
    histogram: LatencyHistogram,
    stats: EngineStats,
}

impl EngineState {
    fn new() -> Self {
        EngineState {
            app_table: HashMap::new(),
            app_array: Vec::new(),
            link_table: HashMap::new(),
            link_array: Vec::new(),
            current: config::new(),
            strict: true,
            restart_delay: Duration::from_secs(2),
            pacer_mode: PacerMode::default(),
            pacer_sleep_us: 0,
            pacer_lastfrees: 0,
            pacer_nextbreath: None,
            timers: Vec::new(),
            timeline: timeline::Timeline::new(),
            histogram: LatencyHistogram::new(),
            stats: EngineStats::default(),
        }
    }
}

// SAFETY: the engine is single-threaded by design; this static is never
// accessed from more than one OS thread at a time.
static mut STATE: Lazy<EngineState> = Lazy::new(EngineState::new);

fn state() -> &'static EngineState { unsafe { &STATE } }
fn state_mut() -> &'static mut EngineState { unsafe { &mut STATE } }

pub fn stats() -> &'static EngineStats { &state().stats }

pub fn add_frees() { state_mut().stats.frees += 1; }
pub fn add_freebytes(n: u64) { state_mut().stats.freebytes += n; }
pub fn add_freebits(n: u64) { state_mut().stats.freebits += n; }

// API: run-mode control.
pub fn set_strict(strict: bool) { state_mut().strict = strict; }
pub fn set_restart_delay(delay: Duration) { state_mut().restart_delay = delay; }
pub fn set_pacer_mode(mode: PacerMode) { state_mut().pacer_mode = mode; }

// API: register a callback polled once per breath (a minimal stand-in for
// the timer wheel other subsystems hang deadlines off).
pub fn register_timer<F: FnMut() + 'static>(f: F) {
    state_mut().timers.push(Box::new(f));
}

fn poll_timers(state: &mut EngineState) {
    for t in state.timers.iter_mut() {
        t();
    }
}

// API: apply a new configuration, diffing it against the currently-active
// one and transitioning each named app through exactly one of
// {start, keep, reconfig, restart, stop}. Applied in that fixed order so
// that stopped apps release their links before restarted/kept apps are
// reattached.
pub fn configure(new_config: &config::Config) -> Result<(), ConfigError> {
    let mut parsed_links = Vec::with_capacity(new_config.links.len());
    for spec in &new_config.links {
        let parsed = config::parse_link(spec)?;
        if !new_config.apps.contains_key(&parsed.from) {
            return Err(ConfigError::UndefinedApp(parsed.from.clone()));
        }
        if !new_config.apps.contains_key(&parsed.to) {
            return Err(ConfigError::UndefinedApp(parsed.to.clone()));
        }
        parsed_links.push((spec.clone(), parsed));
    }
    // Deterministic link creation order, independent of HashSet iteration.
    parsed_links.sort_by(|a, b| a.0.cmp(&b.0));

    let state = state_mut();

    let mut names: HashSet<String> = state.app_table.keys().cloned().collect();
    names.extend(new_config.apps.keys().cloned());

    let mut to_stop = Vec::new();
    let mut to_restart = Vec::new();
    let mut to_keep = Vec::new();
    let mut to_reconfig = Vec::new();
    let mut to_start = Vec::new();

    for name in names {
        match (state.app_table.get(&name).copied(), new_config.apps.get(&name)) {
            (None, Some(_)) => to_start.push(name),
            (Some(_), None) => to_stop.push(name),
            (Some(idx), Some(new_arg)) => {
                let old_arg = &state.app_array[idx].conf;
                if old_arg.class_id() != new_arg.class_id() {
                    to_restart.push(name);
                } else if !old_arg.equal(new_arg.as_ref()) {
                    if state.app_array[idx].app.has_reconfig() {
                        to_reconfig.push(name);
                    } else {
                        to_restart.push(name);
                    }
                } else {
                    to_keep.push(name);
                }
            }
            (None, None) => unreachable!(),
        }
    }
    for v in [&mut to_stop, &mut to_restart, &mut to_keep, &mut to_reconfig, &mut to_start] {
        v.sort();
    }

    let old_table = std::mem::take(&mut state.app_table);
    let mut old_array: Vec<Option<AppSlot>> =
        std::mem::take(&mut state.app_array).into_iter().map(Some).collect();

    let mut new_array: Vec<AppSlot> = Vec::new();
    let mut new_table: HashMap<String, usize> = HashMap::new();

    for name in &to_stop {
        let mut slot = old_array[old_table[name]].take().unwrap();
        stop_slot(&mut slot);
    }
    for name in &to_restart {
        let mut slot = old_array[old_table[name]].take().unwrap();
        stop_slot(&mut slot);
        let arg = new_config.apps[name].box_clone();
        let fresh = start_slot(name, arg);
        new_table.insert(name.clone(), new_array.len());
        new_array.push(fresh);
    }
    for name in &to_keep {
        let mut slot = old_array[old_table[name]].take().unwrap();
        slot.input.clear();
        slot.output.clear();
        new_table.insert(name.clone(), new_array.len());
        new_array.push(slot);
    }
    for name in &to_reconfig {
        let mut slot = old_array[old_table[name]].take().unwrap();
        let new_arg = new_config.apps[name].box_clone();
        slot.app.reconfig(new_arg.as_ref());
        slot.conf = new_arg;
        slot.input.clear();
        slot.output.clear();
        new_table.insert(name.clone(), new_array.len());
        new_array.push(slot);
    }
    for name in &to_start {
        let arg = new_config.apps[name].box_clone();
        let fresh = start_slot(name, arg);
        new_table.insert(name.clone(), new_array.len());
        new_array.push(fresh);
    }

    let old_link_table = std::mem::take(&mut state.link_table);
    let mut new_link_table: HashMap<String, SharedLink> = HashMap::new();
    let mut new_link_array: Vec<SharedLink> = Vec::new();

    for (canonical, parsed) in &parsed_links {
        let shared = old_link_table.get(canonical).cloned()
            .unwrap_or_else(|| {
                let fresh = match new_config.link_capacity.get(canonical) {
                    Some(&capacity) => link::new_with_capacity(capacity),
                    None => link::new(),
                };
                Rc::new(RefCell::new(fresh))
            });
        let from_idx = new_table[&parsed.from];
        let to_idx = new_table[&parsed.to];
        new_array[from_idx].output.insert(parsed.output.clone(), shared.clone());
        new_array[to_idx].input.insert(parsed.input.clone(), shared.clone());
        shared.borrow_mut().consumer = Some(to_idx);
        new_link_table.insert(canonical.clone(), shared.clone());
        new_link_array.push(shared);
    }

    for slot in new_array.iter() {
        if slot.app.has_link() {
            slot.app.link(slot);
        }
    }

    state.app_table = new_table;
    state.app_array = new_array;
    state.link_table = new_link_table;
    state.link_array = new_link_array;
    state.current = new_config.clone();
    state.stats.configs += 1;
    Ok(())
}

fn stop_slot(slot: &mut AppSlot) {
    if slot.app.has_stop() {
        slot.app.stop();
    }
    slot.counters.take();
    info!("stopped app `{}`", slot.name);
}

fn start_slot(name: &str, arg: Box<dyn AppArg>) -> AppSlot {
    let app = arg.new();
    let zone = arg.zone();
    let counters = arg.counter_frame_keys()
        .map(|keys| counter::CounterFrame::new(name, &keys));
    info!("started app `{}`", name);
    AppSlot {
        name: name.to_string(),
        zone,
        app,
        conf: arg,
        input: PortTable::new(),
        output: PortTable::new(),
        dead: None,
        counters,
    }
}

// Swap in a fresh instance of a dead app at its existing array index,
// reusing its attached links. This is the one operation that mutates an
// app's instance in place rather than going through a full configure()
// rebuild -- it runs on the hot path, ahead of a breath's pull phase, and a
// restarted app's wiring has not changed.
fn restart_app_in_place(state: &mut EngineState, idx: usize) {
    let name = state.app_array[idx].name.clone();
    let conf = state.app_array[idx].conf.box_clone();
    if state.app_array[idx].app.has_stop() {
        state.app_array[idx].app.stop();
    }
    state.app_array[idx].counters.take();

    let counters = conf.counter_frame_keys()
        .map(|keys| counter::CounterFrame::new(&name, &keys));
    state.app_array[idx].app = conf.new();
    state.app_array[idx].conf = conf;
    state.app_array[idx].dead = None;
    state.app_array[idx].counters = counters;
    warn!("restarted app `{}` after fault", name);

    let slot = &state.app_array[idx];
    if slot.app.has_link() {
        slot.app.link(slot);
    }
}

fn restart_dead_apps(state: &mut EngineState) {
    let now = now();
    let delay = state.restart_delay;
    let due: Vec<usize> = state.app_array.iter().enumerate()
        .filter_map(|(i, slot)| match &slot.dead {
            Some(d) if now.saturating_duration_since(d.time) >= delay => Some(i),
            _ => None,
        })
        .collect();
    for idx in due {
        restart_app_in_place(state, idx);
    }
}

fn panic_message(e: &(dyn Any + Send)) -> String {
    if let Some(s) = e.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = e.downcast_ref::<String>() {
        s.clone()
    } else {
        "app panicked".to_string()
    }
}

// Run `f` (a pull/push/report call against `state.app_array[idx]`) under
// the fault shield: in strict mode panics propagate, in tolerant mode they
// are caught and turn the app into a Dead slot instead of crashing the
// process.
fn shield<F: FnOnce() + std::panic::UnwindSafe>(state: &mut EngineState, idx: usize, what: &str, f: F) {
    let result: Result<(), Box<dyn Any + Send>> = if state.strict {
        f();
        Ok(())
    } else {
        catch_unwind(f)
    };
    if let Err(e) = result {
        let msg = panic_message(&e);
        let name = state.app_array[idx].name.clone();
        warn!("app `{}` panicked in {}: {}", name, what, msg);
        state.app_array[idx].dead = Some(Dead { error: msg, time: now() });
    }
}

// Run one breath: restart-sweep, pull, fixed-point push, counter commit.
pub fn breathe() {
    let state = state_mut();
    state.timeline.resample();
    state.timeline.emit(Severity::Trace, "breath-start");

    restart_dead_apps(state);

    for idx in 0..state.app_array.len() {
        if state.app_array[idx].dead.is_some() || !state.app_array[idx].app.has_pull() {
            continue;
        }
        state.timeline.emit(Severity::App, &format!("pull {}", state.app_array[idx].name));
        shield(state, idx, "pull", AssertUnwindSafe(|| {
            let slot = &state.app_array[idx];
            slot.app.pull(slot);
        }));
    }

    // Fixed-point push sweep: every link runs its consumer's push on the
    // first pass, and again on any later pass where it gained new data
    // since last visited, until a full pass makes no progress.
    let mut firstloop = true;
    loop {
        let mut progress = false;
        for link_idx in 0..state.link_array.len() {
            let has_new = state.link_array[link_idx].borrow().has_new_data;
            if !firstloop && !has_new {
                continue;
            }
            state.link_array[link_idx].borrow_mut().has_new_data = false;
            let consumer = state.link_array[link_idx].borrow().consumer;
            let consumer = match consumer {
                Some(c) => c,
                None => continue,
            };
            if state.app_array[consumer].dead.is_some() || !state.app_array[consumer].app.has_push() {
                continue;
            }
            state.timeline.emit(Severity::App, &format!("push {}", state.app_array[consumer].name));
            shield(state, consumer, "push", AssertUnwindSafe(|| {
                let slot = &state.app_array[consumer];
                slot.app.push(slot);
            }));
            progress = true;
        }
        firstloop = false;
        if !progress {
            break;
        }
    }

    state.stats.breaths += 1;
    if state.stats.breaths % 100 == 0 {
        commit_counters(state);
        // Report hooks are also invoked on this cadence (not only at the
        // end of main()), so a report hook that panics is caught and its
        // app restarted within a running process rather than only at exit.
        for idx in 0..state.app_array.len() {
            if state.app_array[idx].dead.is_some() || !state.app_array[idx].app.has_report() {
                continue;
            }
            shield(state, idx, "report", AssertUnwindSafe(|| {
                let slot = &state.app_array[idx];
                slot.app.report();
            }));
        }
    }
    state.timeline.emit(Severity::Trace, "breath-end");
}

fn breathe_timed(measure_latency: bool) {
    if measure_latency {
        let start = Instant::now();
        breathe();
        let elapsed = Instant::now().saturating_duration_since(start);
        state_mut().histogram.record(elapsed);
    } else {
        breathe();
    }
}

fn commit_counters(state: &EngineState) {
    counter::publish("engine/breaths", state.stats.breaths);
    counter::publish("engine/frees", state.stats.frees);
    counter::publish("engine/freebytes", state.stats.freebytes);
    counter::publish("engine/freebits", state.stats.freebits);
    counter::publish("engine/configs", state.stats.configs);
    for (name, shared) in state.link_table.iter() {
        let l = shared.borrow();
        counter::publish(&format!("links/{}/rxpackets", name), l.rxpackets);
        counter::publish(&format!("links/{}/rxbytes", name), l.rxbytes);
        counter::publish(&format!("links/{}/txpackets", name), l.txpackets);
        counter::publish(&format!("links/{}/txbytes", name), l.txbytes);
        counter::publish(&format!("links/{}/txdrop", name), l.txdrop);
    }
    for slot in state.app_array.iter() {
        if let Some(cf) = &slot.counters {
            cf.commit();
        }
    }
}

fn pace_breathing(state: &mut EngineState) {
    match state.pacer_mode {
        PacerMode::Busywait => {
            state.timeline.emit(Severity::Trace, "no sleep (busywait)");
        }
        PacerMode::Adaptive { maxsleep_us } => {
            if state.stats.frees == state.pacer_lastfrees {
                state.pacer_sleep_us = cmp::min(state.pacer_sleep_us + 1, maxsleep_us);
                state.timeline.emit(Severity::Info, &format!("sleep {}us", state.pacer_sleep_us));
                sleep(Duration::from_micros(state.pacer_sleep_us));
                state.timeline.emit(Severity::Info, "wakeup");
            } else {
                state.pacer_sleep_us /= 2;
            }
            state.pacer_lastfrees = state.stats.frees;
        }
        PacerMode::Fixed { hz } => {
            let period = Duration::from_secs_f64(1.0 / hz);
            let next = state.pacer_nextbreath.unwrap_or_else(now);
            let n = now();
            if next > n {
                let slack = next - n;
                state.timeline.emit(Severity::Info, &format!("sleep {:?}", slack));
                sleep(slack);
                state.timeline.emit(Severity::Info, "wakeup");
            }
            state.pacer_nextbreath = Some(cmp::max(next + period, now()));
        }
    }
}

#[derive(Default)]
pub struct Options {
    // Stop the loop once this returns true, checked after every breath.
    pub done: Option<Box<dyn Fn() -> bool>>,
    // Convenience for `done`: stop after this much wall-clock time.
    pub duration: Option<Duration>,
    pub no_timers: bool,
    pub no_report: bool,
    pub report_load: bool,
    pub report_links: bool,
    pub report_apps: bool,
    // Record per-breath wall-clock latency into a histogram (small but
    // nonzero overhead; off by default).
    pub measure_latency: bool,
}

// API: run breaths until the done predicate fires. Each iteration runs, in
// order: breath, timer wheel poll, pacer, done check.
pub fn main(options: Option<Options>) {
    let options = options.unwrap_or_default();
    let mut done = options.done;
    if let Some(duration) = options.duration {
        assert!(done.is_none(), "You can not have both 'duration' and 'done'");
        done = Some(timeout(duration));
    }

    loop {
        breathe_timed(options.measure_latency);
        if !options.no_timers {
            poll_timers(state_mut());
        }
        pace_breathing(state_mut());
        let finished = match &done {
            Some(d) => d(),
            None => false,
        };
        if finished {
            break;
        }
    }

    if !options.no_report {
        if options.report_load { report_load(); }
        if options.report_links { report_links(); }
        if options.report_apps { report_apps(); }
    }
}

// API: force an immediate counter commit, bypassing the every-100-breaths
// schedule. Useful right before reporting or shutting down.
pub fn commit() { commit_counters(state()); }

// API: register a process-termination signal handler (SIGINT/SIGTERM) that
// flips an AtomicBool the caller can poll from a `done` closure.
pub fn install_termination_signal() -> Result<std::sync::Arc<std::sync::atomic::AtomicBool>, std::io::Error> {
    let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, flag.clone())?;
    Ok(flag)
}

pub fn now() -> Instant { Instant::now() }

// Return a closure that returns true once `duration` has elapsed since now.
pub fn timeout(duration: Duration) -> Box<dyn Fn() -> bool> {
    let deadline = now() + duration;
    Box::new(move || now() >= deadline)
}

// Return a closure that returns true at most once every `duration`.
pub fn throttle(duration: Duration) -> Box<dyn FnMut() -> bool> {
    let mut next = now();
    Box::new(move || {
        let n = now();
        if n >= next {
            next = n + duration;
            true
        } else {
            false
        }
    })
}

pub fn report_load() {
    let s = stats();
    println!("load: breaths={} frees={} freebits={} freebytes={}",
             super::util::comma_value(s.breaths),
             super::util::comma_value(s.frees),
             super::util::comma_value(s.freebits),
             super::util::comma_value(s.freebytes));
}

pub fn report_links() {
    for (name, shared) in state().link_table.iter() {
        let l = shared.borrow();
        let loss = if l.txpackets + l.txdrop > 0 {
            100.0 * l.txdrop as f64 / (l.txpackets + l.txdrop) as f64
        } else { 0.0 };
        println!("link {}: txpackets={} txdrop={} ({:.4}% loss) rxpackets={}",
                  name, super::util::comma_value(l.txpackets), super::util::comma_value(l.txdrop),
                  loss, super::util::comma_value(l.rxpackets));
    }
}

pub fn report_apps() {
    let strict = state().strict;
    for slot in state().app_array.iter() {
        if slot.dead.is_some() {
            println!("app {}: dead", slot.name);
        } else if slot.app.has_report() {
            println!("app {}:", slot.name);
            if strict {
                slot.app.report();
            } else {
                let _ = catch_unwind(AssertUnwindSafe(|| slot.app.report()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic_apps;

    fn reset() {
        let state = state_mut();
        state.app_table.clear();
        state.app_array.clear();
        state.link_table.clear();
        state.link_array.clear();
        state.current = config::new();
        state.strict = true;
        state.stats = EngineStats::default();
    }

    #[test]
    fn configure_starts_links_and_runs_a_breath() {
        reset();
        let mut c = config::new();
        config::app(&mut c, "source", &basic_apps::Source { size: 60 });
        config::app(&mut c, "sink", &basic_apps::Sink {});
        config::link(&mut c, "source.output -> sink.input").unwrap();
        configure(&c).unwrap();

        assert_eq!(state().app_array.len(), 2);
        assert_eq!(state().link_array.len(), 1);

        breathe();
        // sink should have drained everything the source pulled.
        let link = state().link_array[0].borrow();
        assert!(link::empty(&link));
        assert!(link.rxpackets > 0);
    }

    #[test]
    fn port_table_name_and_index_lookups_agree() {
        reset();
        let mut c = config::new();
        config::app(&mut c, "source", &basic_apps::Source { size: 60 });
        config::app(&mut c, "sink", &basic_apps::Sink {});
        config::link(&mut c, "source.output -> sink.input").unwrap();
        configure(&c).unwrap();

        let source_idx = state().app_table["source"];
        let slot = &state().app_array[source_idx];
        assert_eq!(slot.output.len(), 1);
        assert_eq!(slot.output.name_at(0), Some("output"));
        let by_name = slot.output.get("output").unwrap();
        let by_index = slot.output.get_index(0).unwrap();
        assert!(Rc::ptr_eq(by_name, by_index));
    }

    #[test]
    fn reconfigure_keeps_unchanged_apps_and_restarts_changed_ones() {
        reset();
        let mut c1 = config::new();
        config::app(&mut c1, "source", &basic_apps::Source { size: 60 });
        config::app(&mut c1, "sink", &basic_apps::Sink {});
        config::link(&mut c1, "source.output -> sink.input").unwrap();
        configure(&c1).unwrap();
        let sink_idx_before = state().app_table["sink"];

        let mut c2 = config::new();
        config::app(&mut c2, "source", &basic_apps::Source { size: 128 }); // changed arg, no reconfig hook -> restart
        config::app(&mut c2, "sink", &basic_apps::Sink {}); // unchanged -> keep
        config::link(&mut c2, "source.output -> sink.input").unwrap();
        configure(&c2).unwrap();

        assert_eq!(state().app_array.len(), 2);
        // sink was kept; its index may or may not match, but the link must
        // still be attached and functional.
        let _ = sink_idx_before;
        breathe();
        let link = state().link_array[0].borrow();
        assert!(link.rxpackets > 0);
    }

    #[test]
    fn configure_rejects_link_to_undefined_app() {
        reset();
        let mut c = config::new();
        config::app(&mut c, "source", &basic_apps::Source { size: 60 });
        config::link(&mut c, "source.output -> sink.input").unwrap();
        let err = configure(&c).unwrap_err();
        assert!(matches!(err, ConfigError::UndefinedApp(_)));
    }

    #[test]
    fn tolerant_mode_survives_a_panicking_push() {
        reset();
        state_mut().strict = false;
        state_mut().restart_delay = Duration::from_secs(0);

        #[derive(Debug, Clone)]
        struct Flaky;
        impl AppConfig for Flaky {
            fn new(&self) -> Box<dyn App> { Box::new(FlakyApp) }
        }
        struct FlakyApp;
        impl App for FlakyApp {
            fn has_push(&self) -> bool { true }
            fn push(&self, _slot: &AppSlot) { panic!("boom"); }
        }

        let mut c = config::new();
        config::app(&mut c, "source", &basic_apps::Source { size: 60 });
        config::app(&mut c, "flaky", &Flaky);
        config::link(&mut c, "source.output -> flaky.input").unwrap();
        configure(&c).unwrap();

        breathe(); // flaky panics on push, gets marked dead instead of crashing
        let idx = state().app_table["flaky"];
        assert!(state().app_array[idx].dead.is_some());

        breathe(); // restart_delay is zero: flaky should be back by now
        assert!(state().app_array[idx].dead.is_none());
    }

    #[test]
    fn tolerant_mode_restarts_a_panicking_report_hook_on_its_cadence() {
        reset();
        state_mut().strict = false;
        state_mut().restart_delay = Duration::from_secs(0);

        #[derive(Debug, Clone)]
        struct Reporter;
        impl AppConfig for Reporter {
            fn new(&self) -> Box<dyn App> { Box::new(ReporterApp) }
        }
        struct ReporterApp;
        impl App for ReporterApp {
            fn has_report(&self) -> bool { true }
            fn report(&self) { panic!("report boom"); }
        }

        let mut c = config::new();
        config::app(&mut c, "reporter", &Reporter);
        configure(&c).unwrap();

        // report() is only invoked on the every-100-breaths cadence.
        for _ in 0..100 {
            breathe();
        }
        let idx = state().app_table["reporter"];
        assert!(state().app_array[idx].dead.is_some());

        breathe(); // restart_delay is zero: reporter should be back by now
        assert!(state().app_array[idx].dead.is_none());
    }

    #[test]
    fn timeout_fires_after_duration_elapses() {
        let done = timeout(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(done());
    }

    #[test]
    fn throttle_limits_call_rate() {
        let mut ready = throttle(Duration::from_secs(10));
        assert!(ready()); // first call always fires
        assert!(!ready()); // immediate second call is suppressed
    }
}
