//! coopos - a cooperative teaching kernel, simulated on the host
//!
//! Design principles:
//! - One CPU, no preemption: tasks give the processor up by yielding,
//!   blocking or exiting
//! - Tractable: fixed task table, one ready ring, one frame pool
//! - Inspectable: every counter and every trace event is reachable from
//!   a [`kernel::Kernel`] handle
//!
//! Platform support:
//! - Native: the `coopos-cli` binary and the test suite
//! - Browser (wasm32-unknown-unknown): demos run from JavaScript, output
//!   goes to the console

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

pub mod demos;
pub mod kernel;

#[cfg(target_arch = "wasm32")]
mod web;

/// Initialize panic hook so kernel halts show up in the browser console
#[cfg(target_arch = "wasm32")]
fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// WASM entry point: boot the default demo once
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn main() {
    init_panic_hook();
    web::boot();
}

/// Console logging helper
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    fn log(s: &str);
}

/// Log to browser console (WASM)
#[cfg(target_arch = "wasm32")]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        $crate::log(&format!($($t)*))
    };
}

/// Log to stderr (native)
#[cfg(not(target_arch = "wasm32"))]
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => {
        eprintln!($($t)*)
    };
}
