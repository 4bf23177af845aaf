//! Browser entry points
//!
//! The page calls [`run_demo`] and renders the JSON it returns. Boot runs
//! the counters demo once so something shows up in the console.

use crate::demos::{self, Demo};
use crate::kernel::KernelConfig;
use wasm_bindgen::prelude::*;

pub fn boot() {
    match demos::run(Demo::Counters, KernelConfig::default()) {
        Ok(run) => {
            for line in &run.transcript {
                crate::console_log!("{}", line);
            }
            crate::console_log!("{}", run.stats);
        }
        Err(e) => crate::console_log!("[boot] {}", e),
    }
}

/// Run `name` with `frames` pageable frames and return its stats and
/// transcript as JSON
#[wasm_bindgen]
pub fn run_demo(name: &str, frames: usize) -> Result<String, JsValue> {
    let demo: Demo = name.parse().map_err(|e: String| JsValue::from_str(&e))?;
    let config = KernelConfig::default().with_frames(frames);
    let run = demos::run(demo, config).map_err(|e| JsValue::from_str(&e.to_string()))?;

    let body = serde_json::json!({
        "demo": demo.name(),
        "dispatches": run.report.dispatches,
        "transcript": run.transcript,
        "stats": run.stats,
    });
    serde_json::to_string(&body).map_err(|e| JsValue::from_str(&e.to_string()))
}

/// Names and descriptions of the available demos
#[wasm_bindgen]
pub fn list_demos() -> String {
    Demo::ALL
        .iter()
        .map(|d| format!("{}\t{}", d.name(), d.description()))
        .collect::<Vec<_>>()
        .join("\n")
}
