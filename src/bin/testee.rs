//! A cooperating target for the remote-call tools: it exports a few
//! unmangled functions and then sleeps in a loop, waiting to have them
//! called from outside.

use std::thread;
use std::time::Duration;

#[no_mangle]
pub extern "C" fn testee_add_one(x: u64) -> u64 {
    x.wrapping_add(1)
}

#[no_mangle]
pub extern "C" fn testee_sum7(a: u64, b: u64, c: u64, d: u64, e: u64, f: u64, g: u64) -> u64 {
    a.wrapping_add(b)
        .wrapping_add(c)
        .wrapping_add(d)
        .wrapping_add(e)
        .wrapping_add(f)
        .wrapping_add(g)
}

#[no_mangle]
pub extern "C" fn do_loop() {
    thread::sleep(Duration::from_secs(1));
}

fn main() {
    // Reference the exports so the linker keeps them around.
    println!(
        "testee {} up, 1+1={}, sum7={}",
        std::process::id(),
        testee_add_one(1),
        testee_sum7(1, 2, 3, 4, 5, 6, 7)
    );

    loop {
        do_loop();
    }
}
