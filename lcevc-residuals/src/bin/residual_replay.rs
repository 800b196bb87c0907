/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Replays a JSON script of store and decoder operations against a scripted
//! mock decoder, printing one JSON line per operation.
//!
//! ```text
//! RUST_LOG=debug residual_replay session.json
//! ```

use std::fs;
use std::io::{self, Read, Write};

use anyhow::{Context, Result};
use clap::Parser;
use lcevc_residuals::{
    DecodeOrchestrator, EnhancementSample, ErrorCode, Level, MockDecoder, OrchestratorConfig,
    PacketStore, StoreConfig,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[clap(about = "Replay LCEVC residual store operations", version)]
struct Args {
    #[clap(value_parser, help = "Path to the JSON script, or - for stdin")]
    script: String,

    #[clap(long, help = "Print store and orchestrator statistics after the last operation")]
    stats: bool,

    #[clap(long, help = "Stop at the first operation that returns an error")]
    fail_fast: bool,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct Script {
    store: StoreConfig,
    orchestrator: OrchestratorConfig,
    decoder: DecoderScript,
    operations: Vec<Operation>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct DecoderScript {
    width: Option<u32>,
    height: Option<u32>,
    failures: Vec<ScriptedFailure>,
    zero_dimensions: Vec<Vec<u8>>,
}

#[derive(Deserialize, Debug)]
struct ScriptedFailure {
    payload: Vec<u8>,
    code: i32,
    #[serde(default)]
    once: bool,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Operation {
    Insert(EnhancementSample),
    Flush { start: f64, end: f64 },
    Evict,
    Coverage { time: f64 },
    Continuous { time: f64, max_gap: Option<u32> },
    Keyframe {
        time: f64,
        max_buckets_back: Option<u32>,
        #[serde(default)]
        force: bool,
    },
    Reset { time: f64 },
    Level { level: Level },
}

impl DecoderScript {
    fn build(self) -> MockDecoder {
        let mut decoder = MockDecoder::new();
        if let (Some(width), Some(height)) = (self.width, self.height) {
            decoder = decoder.with_dimensions(width, height);
        }
        for failure in self.failures {
            let code = ErrorCode::from_raw(failure.code);
            if failure.once {
                decoder.fail_once(failure.payload, code);
            } else {
                decoder.fail_on(failure.payload, code);
            }
        }
        for payload in self.zero_dimensions {
            decoder.zero_dimensions_on(payload);
        }
        decoder
    }
}

fn read_script(path: &str) -> Result<Script> {
    let text = if path == "-" {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("reading script from stdin")?;
        text
    } else {
        fs::read_to_string(path).with_context(|| format!("reading script {path}"))?
    };
    serde_json::from_str(&text).context("parsing replay script")
}

fn run(
    operation: Operation,
    store: &mut PacketStore,
    orchestrator: &mut DecodeOrchestrator<MockDecoder>,
) -> lcevc_residuals::Result<Value> {
    let max_gap = orchestrator.config().max_gap_packets;
    let max_back = orchestrator.config().max_buckets_back;
    Ok(match operation {
        Operation::Insert(sample) => {
            let start_time = sample.start_time;
            store.insert(sample);
            json!({ "op": "insert", "start_time": start_time, "packets": store.len() })
        }
        Operation::Flush { start, end } => {
            store.flush_range(start, end);
            json!({ "op": "flush", "start": start, "end": end, "packets": store.len() })
        }
        Operation::Evict => {
            store.evict_on_next_insert();
            json!({ "op": "evict" })
        }
        Operation::Coverage { time } => {
            json!({ "op": "coverage", "time": time, "covered": store.has_coverage(time) })
        }
        Operation::Continuous { time, max_gap: gap } => {
            let info = orchestrator.parse_continuous(store, time, gap.unwrap_or(max_gap))?;
            json!({ "op": "continuous", "time": time, "decoded": info })
        }
        Operation::Keyframe {
            time,
            max_buckets_back,
            force,
        } => {
            let info = orchestrator.parse_from_keyframe(
                store,
                time,
                max_buckets_back.unwrap_or(max_back),
                force,
            )?;
            json!({ "op": "keyframe", "time": time, "decoded": info })
        }
        Operation::Reset { time } => {
            orchestrator.reset(store, time)?;
            json!({ "op": "reset", "time": time, "size": orchestrator.reset_size() })
        }
        Operation::Level { level } => {
            orchestrator.set_level(level);
            json!({ "op": "level", "level": level })
        }
    })
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let script = read_script(&args.script)?;
    log::info!(
        "Replaying {} operations from {}",
        script.operations.len(),
        args.script
    );

    let mut store = PacketStore::new(script.store)?;
    let mut orchestrator = DecodeOrchestrator::new(script.decoder.build(), script.orchestrator)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for (index, operation) in script.operations.into_iter().enumerate() {
        match run(operation, &mut store, &mut orchestrator) {
            Ok(line) => writeln!(out, "{line}")?,
            Err(err) if args.fail_fast => {
                return Err(err).with_context(|| format!("operation {index} failed"));
            }
            Err(err) => {
                log::warn!("Operation {index} failed: {err}");
                writeln!(out, "{}", json!({ "index": index, "error": err.to_string() }))?;
            }
        }
    }

    if args.stats {
        let stats = json!({
            "store": store.stats(),
            "orchestrator": orchestrator.stats(),
            "first_keyframe_offset": store.first_keyframe_offset(),
        });
        writeln!(out, "{stats}")?;
    }
    Ok(())
}
