//! An injectable heap profiler.
//!
//! When this shared object is loaded into a host process it rewrites the
//! host main image's relocation slots for `calloc`, `malloc`, `free` and
//! `realloc` to point at local hooks. Every allocation is recorded with
//! a deduplicated backtrace; a text report of live allocations, oldest
//! first, goes to `/tmp/malloc-log` at most every ten minutes and once
//! more on unload, when the original slots are restored.
//!
//! All bookkeeping lives behind one mutex, taken once per hook. The
//! hooks' own allocations resolve through this object's unpatched PLT,
//! so they reach the real allocator and never re-enter the hooks.

use lazy_static::lazy_static;
use lcitk::symbols::find_relocation;
use libc::{c_void, size_t};
use std::cmp::Ordering as CmpOrdering;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

const MAX_FRAMES: usize = 200;
const REPORT_PERIOD: Duration = Duration::from_secs(10 * 60);
const LOG_PATH: &str = "/tmp/malloc-log";

type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;

// The saved original allocator entry points and the relocation slots
// they came from, for restoration on unload.
static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static SLOT_CALLOC: AtomicUsize = AtomicUsize::new(0);
static SLOT_MALLOC: AtomicUsize = AtomicUsize::new(0);
static SLOT_FREE: AtomicUsize = AtomicUsize::new(0);
static SLOT_REALLOC: AtomicUsize = AtomicUsize::new(0);

/// A captured call chain shared by any number of live allocations.
struct BacktraceEntry {
    refcount: usize,
    addresses: Vec<usize>,
}

struct AllocationEntry {
    address: usize,
    size: usize,
    logged: SystemTime,
    backtrace: usize,
}

/// Both tables are flat arrays whose entries are reused after a free;
/// the `next_free_*` hints name a known-free index when one exists.
/// `sorted` is the index permutation the report orders.
struct Profiler {
    backtraces: Vec<Option<BacktraceEntry>>,
    allocations: Vec<Option<AllocationEntry>>,
    sorted: Vec<usize>,
    next_free_allocation: Option<usize>,
    next_free_backtrace: Option<usize>,
    active_allocations: usize,
    active_backtraces: usize,
    started: SystemTime,
    last_report: SystemTime,
}

lazy_static! {
    static ref STATE: Mutex<Profiler> = Mutex::new(Profiler::new());
}

impl Profiler {
    fn new() -> Profiler {
        let now = SystemTime::now();
        Profiler {
            backtraces: Vec::new(),
            allocations: Vec::new(),
            sorted: Vec::new(),
            next_free_allocation: None,
            next_free_backtrace: None,
            active_allocations: 0,
            active_backtraces: 0,
            started: now,
            last_report: now,
        }
    }

    /// Find or create the catalog entry for a captured address vector.
    /// Deduplication is by exact equality of the addresses.
    fn intern_backtrace(&mut self, frames: &[usize]) -> usize {
        for (i, entry) in self.backtraces.iter_mut().enumerate() {
            if let Some(bt) = entry {
                if bt.addresses == frames {
                    bt.refcount += 1;
                    return i;
                }
            }
        }

        let fresh = BacktraceEntry {
            refcount: 1,
            addresses: frames.to_vec(),
        };
        self.active_backtraces += 1;

        match self.take_free_backtrace_slot() {
            Some(i) => {
                self.backtraces[i] = Some(fresh);
                i
            }
            None => {
                self.backtraces.push(Some(fresh));
                self.backtraces.len() - 1
            }
        }
    }

    fn take_free_backtrace_slot(&mut self) -> Option<usize> {
        let slot = self.next_free_backtrace.take()?;
        if self.backtraces.get(slot).map(|e| e.is_none()) != Some(true) {
            return None;
        }
        // Keep the hint pointing at any other free entry.
        let n = self.backtraces.len();
        self.next_free_backtrace = (1..n)
            .map(|d| (slot + d) % n)
            .find(|&i| self.backtraces[i].is_none());
        Some(slot)
    }

    fn take_free_allocation_slot(&mut self) -> Option<usize> {
        let slot = self.next_free_allocation.take()?;
        if self.allocations.get(slot).map(|e| e.is_none()) != Some(true) {
            return None;
        }
        let n = self.allocations.len();
        self.next_free_allocation = (1..n)
            .map(|d| (slot + d) % n)
            .find(|&i| self.allocations[i].is_none());
        Some(slot)
    }

    fn record_allocation(&mut self, address: usize, size: usize, frames: &[usize]) {
        let backtrace = self.intern_backtrace(frames);
        let entry = AllocationEntry {
            address,
            size,
            logged: SystemTime::now(),
            backtrace,
        };
        self.active_allocations += 1;

        match self.take_free_allocation_slot() {
            Some(i) => self.allocations[i] = Some(entry),
            None => {
                self.allocations.push(Some(entry));
                self.sorted.push(self.allocations.len() - 1);
            }
        }
    }

    fn record_free(&mut self, address: usize) {
        // TODO: replace the linear scan with an address-to-index map.
        let idx = self
            .allocations
            .iter()
            .position(|e| e.as_ref().map(|a| a.address) == Some(address));
        let idx = match idx {
            Some(i) => i,
            // Allocated before the profiler was loaded; nothing to do.
            None => return,
        };

        let entry = match self.allocations[idx].take() {
            Some(e) => e,
            None => return,
        };
        self.next_free_allocation = Some(idx);
        self.active_allocations -= 1;

        if let Some(bt) = self.backtraces[entry.backtrace].as_mut() {
            bt.refcount -= 1;
            if bt.refcount == 0 {
                self.backtraces[entry.backtrace] = None;
                self.next_free_backtrace = Some(entry.backtrace);
                self.active_backtraces -= 1;
            }
        }
    }

    /// Order the report permutation: freed entries first, then live ones
    /// by descending age, i.e. the oldest allocation leads the report.
    fn resort(&mut self) {
        let allocations = &self.allocations;
        self.sorted.sort_unstable_by(|&a, &b| {
            match (&allocations[a], &allocations[b]) {
                (None, None) => CmpOrdering::Equal,
                (None, Some(_)) => CmpOrdering::Less,
                (Some(_), None) => CmpOrdering::Greater,
                (Some(x), Some(y)) => x.logged.cmp(&y.logged),
            }
        });
        // Sorting moved entries around; recompute the free hint.
        self.next_free_allocation = self.allocations.iter().position(|e| e.is_none());
    }

    fn render_report(&mut self, now: SystemTime) -> String {
        self.last_report = now;
        self.resort();

        let mut out = String::new();
        let elapsed = age_secs(self.started, now);
        out.push_str(&format!("*** BEGIN REPORT: {} ***\n", format_age(elapsed)));
        out.push_str(&format!(
            "Peak allocations reached:\t{}\n",
            self.allocations.len()
        ));
        out.push_str(&format!(
            "Peak backtraces reached:\t{}\n",
            self.backtraces.len()
        ));
        out.push_str(&format!(
            "Active allocations:\t\t{}\n",
            self.active_allocations
        ));
        out.push_str(&format!(
            "Active backtraces:\t\t{}\n",
            self.active_backtraces
        ));
        out.push_str(&format!("{:<10} {:<10}\t{}\n", "Age", "Size", "Backtrace"));
        out.push_str("---------------------------------\n");

        for &i in &self.sorted {
            let entry = match &self.allocations[i] {
                Some(e) => e,
                None => continue,
            };
            out.push_str(&format!(
                "{:<10} {:<10}\t",
                format_age(age_secs(entry.logged, now)),
                entry.size
            ));
            if let Some(bt) = &self.backtraces[entry.backtrace] {
                let rendered: Vec<String> =
                    bt.addresses.iter().map(|a| format!("{:#x}", a)).collect();
                out.push_str(&rendered.join(", "));
            }
            out.push('\n');
        }
        out.push_str("*** END REPORT ***\n");
        out
    }

    fn write_report(&mut self, now: SystemTime) -> io::Result<()> {
        let report = self.render_report(now);
        let mut f = OpenOptions::new().create(true).append(true).open(LOG_PATH)?;
        f.write_all(report.as_bytes())
    }

    fn maybe_report(&mut self) {
        let now = SystemTime::now();
        if age_secs(self.last_report, now) >= REPORT_PERIOD.as_secs() {
            let _ = self.write_report(now);
        }
    }
}

fn age_secs(since: SystemTime, now: SystemTime) -> u64 {
    now.duration_since(since)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

/// Render a second count the way the report shows ages: `1d2h3m4s`,
/// omitting leading zero components.
fn format_age(mut secs: u64) -> String {
    let mut out = String::new();
    if secs > 24 * 60 * 60 {
        out.push_str(&format!("{}d", secs / (24 * 60 * 60)));
        secs %= 24 * 60 * 60;
    }
    if secs > 60 * 60 {
        out.push_str(&format!("{}h", secs / (60 * 60)));
        secs %= 60 * 60;
    }
    if secs > 60 {
        out.push_str(&format!("{}m", secs / 60));
        secs %= 60;
    }
    out.push_str(&format!("{}s", secs));
    out
}

fn capture_frames(buf: &mut [usize; MAX_FRAMES]) -> usize {
    let mut n = 0;
    backtrace::trace(|frame| {
        buf[n] = frame.ip() as usize;
        n += 1;
        n < MAX_FRAMES
    });
    n
}

fn instrument_malloc(address: usize, size: usize) {
    let mut frames = [0usize; MAX_FRAMES];
    let n = capture_frames(&mut frames);
    if let Ok(mut state) = STATE.lock() {
        state.record_allocation(address, size, &frames[..n]);
    }
}

fn instrument_free(address: usize) {
    if let Ok(mut state) = STATE.lock() {
        state.record_free(address);
    }
}

fn check_should_report() {
    if let Ok(mut state) = STATE.lock() {
        state.maybe_report();
    }
}

unsafe extern "C" fn calloc_hook(nmemb: size_t, size: size_t) -> *mut c_void {
    let real: CallocFn = mem::transmute(REAL_CALLOC.load(Ordering::SeqCst));
    let ret = real(nmemb, size);
    instrument_malloc(ret as usize, (nmemb as usize).wrapping_mul(size as usize));
    check_should_report();
    ret
}

unsafe extern "C" fn malloc_hook(size: size_t) -> *mut c_void {
    let real: MallocFn = mem::transmute(REAL_MALLOC.load(Ordering::SeqCst));
    let ret = real(size);
    instrument_malloc(ret as usize, size as usize);
    check_should_report();
    ret
}

unsafe extern "C" fn free_hook(ptr: *mut c_void) {
    let real: FreeFn = mem::transmute(REAL_FREE.load(Ordering::SeqCst));
    instrument_free(ptr as usize);
    real(ptr);
    check_should_report();
}

unsafe extern "C" fn realloc_hook(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let real: ReallocFn = mem::transmute(REAL_REALLOC.load(Ordering::SeqCst));
    let ret = real(ptr, size);
    instrument_free(ptr as usize);
    instrument_malloc(ret as usize, size as usize);
    check_should_report();
    ret
}

fn append_line(line: &str) {
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(LOG_PATH) {
        let _ = writeln!(f, "{}", line);
    }
}

unsafe fn install_hooks() {
    let pid = libc::getpid();
    let table: [(&str, &AtomicUsize, &AtomicUsize, usize); 4] = [
        ("calloc", &SLOT_CALLOC, &REAL_CALLOC, calloc_hook as usize),
        ("malloc", &SLOT_MALLOC, &REAL_MALLOC, malloc_hook as usize),
        ("free", &SLOT_FREE, &REAL_FREE, free_hook as usize),
        ("realloc", &SLOT_REALLOC, &REAL_REALLOC, realloc_hook as usize),
    ];

    for (name, slot_cell, real_cell, hook) in table.iter() {
        match find_relocation(pid, "", name) {
            Ok(slot) => {
                let slot_ptr = slot as *mut usize;
                real_cell.store(*slot_ptr, Ordering::SeqCst);
                slot_cell.store(slot as usize, Ordering::SeqCst);
                *slot_ptr = *hook;
            }
            Err(e) => append_line(&format!("cannot hook {}: {}", name, e)),
        }
    }
}

unsafe fn restore_hooks() {
    let table: [(&AtomicUsize, &AtomicUsize); 4] = [
        (&SLOT_CALLOC, &REAL_CALLOC),
        (&SLOT_MALLOC, &REAL_MALLOC),
        (&SLOT_FREE, &REAL_FREE),
        (&SLOT_REALLOC, &REAL_REALLOC),
    ];

    for (slot_cell, real_cell) in table.iter() {
        let slot = slot_cell.load(Ordering::SeqCst);
        let real = real_cell.load(Ordering::SeqCst);
        if slot != 0 && real != 0 {
            *(slot as *mut usize) = real;
        }
    }
}

extern "C" fn profiler_init() {
    append_line("------ LOGGING STARTED ------");
    lazy_static::initialize(&STATE);
    unsafe {
        install_hooks();
    }
}

extern "C" fn profiler_fini() {
    unsafe {
        restore_hooks();
    }
    if let Ok(mut state) = STATE.lock() {
        let _ = state.write_report(SystemTime::now());
    }
    append_line("------ END ------");
}

#[link_section = ".init_array"]
#[used]
static PROFILER_CTOR: extern "C" fn() = profiler_init;

#[link_section = ".fini_array"]
#[used]
static PROFILER_DTOR: extern "C" fn() = profiler_fini;

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(tag: usize) -> Vec<usize> {
        vec![0x1000 + tag, 0x2000, 0x3000]
    }

    #[test]
    fn equal_backtraces_share_one_entry() {
        let mut p = Profiler::new();
        for i in 0..5 {
            p.record_allocation(0x100 + i, 16, &frames(1));
        }
        for i in 0..3 {
            p.record_allocation(0x200 + i, 16, &frames(2));
        }

        let live: Vec<&BacktraceEntry> =
            p.backtraces.iter().filter_map(|e| e.as_ref()).collect();
        assert_eq!(live.len(), 2);
        let mut counts: Vec<usize> = live.iter().map(|b| b.refcount).collect();
        counts.sort();
        assert_eq!(counts, vec![3, 5]);
        assert_eq!(p.active_backtraces, 2);
        assert_eq!(p.active_allocations, 8);
    }

    #[test]
    fn freeing_the_last_reference_releases_the_backtrace() {
        let mut p = Profiler::new();
        p.record_allocation(0xa, 8, &frames(1));
        p.record_allocation(0xb, 8, &frames(1));

        p.record_free(0xa);
        assert_eq!(p.active_allocations, 1);
        assert_eq!(p.active_backtraces, 1);

        p.record_free(0xb);
        assert_eq!(p.active_allocations, 0);
        assert_eq!(p.active_backtraces, 0);
        assert!(p.backtraces.iter().all(|e| e.is_none()));
    }

    #[test]
    fn unknown_pointer_is_ignored() {
        let mut p = Profiler::new();
        p.record_allocation(0xa, 8, &frames(1));
        p.record_free(0xdead);
        assert_eq!(p.active_allocations, 1);
    }

    #[test]
    fn freed_slots_are_reused_before_growing() {
        let mut p = Profiler::new();
        p.record_allocation(0xa, 8, &frames(1));
        p.record_allocation(0xb, 8, &frames(2));
        assert_eq!(p.allocations.len(), 2);

        p.record_free(0xa);
        p.record_allocation(0xc, 8, &frames(3));
        // The freed slot was recycled; the table did not grow.
        assert_eq!(p.allocations.len(), 2);
        assert_eq!(p.active_allocations, 2);
    }

    #[test]
    fn report_orders_oldest_first() {
        let mut p = Profiler::new();
        p.record_allocation(0xa, 8, &frames(1));
        std::thread::sleep(Duration::from_millis(5));
        p.record_allocation(0xb, 8, &frames(2));

        p.resort();
        let live: Vec<usize> = p
            .sorted
            .iter()
            .filter_map(|&i| p.allocations[i].as_ref().map(|e| e.address))
            .collect();
        assert_eq!(live, vec![0xa, 0xb]);
    }

    #[test]
    fn report_puts_freed_entries_first_and_resets_the_hint() {
        let mut p = Profiler::new();
        p.record_allocation(0xa, 8, &frames(1));
        p.record_allocation(0xb, 8, &frames(2));
        p.record_allocation(0xc, 8, &frames(3));
        p.record_free(0xb);

        p.resort();
        assert!(p.allocations[p.sorted[0]].is_none());
        assert_eq!(p.next_free_allocation, Some(1));
    }

    #[test]
    fn report_text_has_the_expected_shape() {
        let mut p = Profiler::new();
        p.record_allocation(0xabc, 64, &frames(1));
        let text = p.render_report(SystemTime::now());
        assert!(text.starts_with("*** BEGIN REPORT:"));
        assert!(text.contains("Peak allocations reached:\t1"));
        assert!(text.contains("Active allocations:\t\t1"));
        assert!(text.contains("0x1001, 0x2000, 0x3000"));
        assert!(text.ends_with("*** END REPORT ***\n"));
    }

    #[test]
    fn ages_format_like_the_original() {
        assert_eq!(format_age(4), "4s");
        assert_eq!(format_age(61), "1m1s");
        assert_eq!(format_age(3 * 60 * 60 + 5), "3h5s");
        assert_eq!(format_age(25 * 60 * 60 + 1), "1d1h1s");
    }
}
