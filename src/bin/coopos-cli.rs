//! coopos CLI - boot a demo and print what the kernel did
//!
//! One-shot:   coopos-cli run --demo paging --frames 24 --json
//! Interactive: coopos-cli (then type commands at the prompt)

use coopos::demos::{self, Demo};
use coopos::kernel::KernelConfig;
use std::io::{self, BufRead, Write};

const USAGE: &str = "\
coopos CLI - Available commands:
  run [--config FILE] [--demo NAME] [--frames N] [--json] [--trace]
          boot a demo, run it to completion, print stats
  config [--config FILE] [--frames N]
          print the effective configuration as JSON
  demos   list the demos
  help    show this help
  exit    leave the prompt";

#[derive(Debug, Default)]
struct Options {
    config: Option<String>,
    demo: Option<Demo>,
    frames: Option<usize>,
    json: bool,
    trace: bool,
}

fn parse_options(args: &[&str]) -> Result<Options, String> {
    let mut opts = Options::default();
    let mut iter = args.iter();
    while let Some(&arg) = iter.next() {
        let mut value = || {
            iter.next()
                .copied()
                .ok_or_else(|| format!("{} needs a value", arg))
        };
        match arg {
            "--config" => opts.config = Some(value()?.to_string()),
            "--demo" => opts.demo = Some(value()?.parse()?),
            "--frames" => {
                let v = value()?;
                opts.frames = Some(v.parse().map_err(|_| format!("bad frame count '{}'", v))?);
            }
            "--json" => opts.json = true,
            "--trace" => opts.trace = true,
            other => return Err(format!("unknown option '{}'", other)),
        }
    }
    Ok(opts)
}

fn load_config(opts: &Options) -> Result<KernelConfig, String> {
    let mut config = match &opts.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path, e))?;
            KernelConfig::from_json(&text).map_err(|e| format!("{}: {}", path, e))?
        }
        None => KernelConfig::default(),
    };
    if let Some(frames) = opts.frames {
        config = config.with_frames(frames);
    }
    if opts.trace {
        config.trace = true;
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn cmd_run(opts: &Options) -> Result<(), String> {
    let config = load_config(opts)?;
    let demo = opts.demo.unwrap_or(Demo::Counters);
    let run = demos::run(demo, config).map_err(|e| format!("{}: {}", demo, e))?;
    let events = run.kernel.inspect(|s| s.tracer.events().iter().cloned().collect::<Vec<_>>());

    if opts.json {
        let mut body = serde_json::json!({
            "demo": demo.name(),
            "dispatches": run.report.dispatches,
            "exited": run.report.exited,
            "transcript": run.transcript,
            "stats": run.stats,
        });
        if opts.trace {
            body["trace"] = serde_json::json!(events);
        }
        let text = serde_json::to_string_pretty(&body).map_err(|e| e.to_string())?;
        println!("{}", text);
        return Ok(());
    }

    println!("== {} ({}) ==", demo, demo.description());
    for line in &run.transcript {
        println!("{}", line);
    }
    println!();
    print!("{}", run.stats);
    if opts.trace {
        println!();
        for event in &events {
            println!("{}", event);
        }
    }
    Ok(())
}

fn cmd_config(opts: &Options) -> Result<(), String> {
    let config = load_config(opts)?;
    println!("{}", config.to_json().map_err(|e| e.to_string())?);
    Ok(())
}

/// Run one command line; returns false when the prompt should close
fn execute(line: &str) -> bool {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&cmd, rest)) = words.split_first() else {
        return true;
    };

    let result = match cmd {
        "exit" | "quit" => return false,
        "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        "demos" => {
            for demo in Demo::ALL {
                println!("  {:<14} {}", demo.name(), demo.description());
            }
            Ok(())
        }
        "run" => parse_options(rest).and_then(|o| cmd_run(&o)),
        "config" => parse_options(rest).and_then(|o| cmd_config(&o)),
        _ => Err(format!("{}: command not found", cmd)),
    };
    if let Err(e) = result {
        coopos::console_log!("{}", e);
    }
    true
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        let line = args.join(" ");
        execute(&line);
        return;
    }

    println!("coopos v{} (CLI)", env!("CARGO_PKG_VERSION"));
    println!("Type 'help' for available commands.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("$ ");
        let _ = stdout.flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) => {
                if !execute(line.trim()) {
                    break;
                }
            }
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        }
    }
}
